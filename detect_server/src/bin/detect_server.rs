//! Detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    data_socket::spawn_data_socket,
    detector::Detector,
    endpoints::{router, AppContext, DEFAULT_CONFIDENCE},
    meter::spawn_meter_logger,
    model::{self, ModelSource},
    nn::DEFAULT_INPUT_SIZE,
    orchestrator::DetectionOrchestrator,
    pubsub::{spawn_pubsub_pruner, NamedPubSub},
};
use env_logger::TimestampPrecision;

/// How often channels without viewers are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Path to the YOLOv8 ONNX weights
    #[clap(long, default_value = "weights/yolov8n.onnx")]
    model: PathBuf,

    /// Class names, one per line. Defaults to the model path with a `.names` extension
    #[clap(long)]
    labels: Option<PathBuf>,

    /// TrueType font for box labels
    #[clap(long)]
    font: Option<PathBuf>,

    /// Square input size the model was exported with
    #[clap(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,

    /// Confidence threshold used when a request does not give one
    #[clap(long, default_value_t = DEFAULT_CONFIDENCE)]
    confidence: f32,

    /// Address to serve the HTTP endpoints on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Address to receive camera frames on
    #[clap(long, default_value = "127.0.0.1:3001")]
    socket_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let source = ModelSource::new(&args.model)
        .with_labels(args.labels.clone())
        .with_input_size(args.input_size);

    // Without a model the server still answers, every run is rejected as unavailable
    let detector = match tokio::task::spawn_blocking(move || model::load(&source)).await? {
        Ok(model) => Some(Detector::with_font(model, args.font.clone())),
        Err(e) => {
            log::error!("{e}");
            log::warn!("Serving without a model");
            None
        }
    };
    let orchestrator = Arc::new(DetectionOrchestrator::new(detector));

    // Create socket to receive image streams via network
    let pubsub = Arc::new(NamedPubSub::new());
    let data_socket = spawn_data_socket(pubsub.clone(), &args.socket_address).await?;
    let pruner = spawn_pubsub_pruner(pubsub.clone(), PRUNE_INTERVAL);

    spawn_meter_logger();

    let ctx = Arc::new(AppContext::new(
        orchestrator,
        pubsub,
        args.model.clone(),
        args.confidence,
    ));
    let app = router(ctx.clone());

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    data_socket.abort();
    pruner.abort();
    ctx.sessions.stop_all().await;
    log::info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
