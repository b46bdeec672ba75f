//! Endpoints of HTTP server.
//!
use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::{Bytes, StreamBody},
    extract::{DefaultBodyLimit, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::{
    as_jpeg_stream_item,
    detector::{decode_image, DetectionBox},
    draw::encode_jpeg,
    error::DetectError,
    live::LiveStats,
    orchestrator::{DetectionOrchestrator, RunState, RunSummary},
    pubsub::NamedPubSub,
    registry::{SessionRegistry, DEFAULT_SESSION},
    session::{HistoryEntry, HistoryTable},
    sources::{FrameSource, ImageSequence, SocketSource, SourceError, SourceSpec},
};

/// Range the confidence slider of the dashboard allows.
pub const MIN_CONFIDENCE: f32 = 0.2;
pub const MAX_CONFIDENCE: f32 = 0.9;
pub const DEFAULT_CONFIDENCE: f32 = 0.45;

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;
const RESPONSE_JPEG_QUALITY: u8 = 90;

/// Pace of directory replays.
const REPLAY_INTERVAL: Duration = Duration::from_millis(100);

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// State shared by all handlers.
pub struct AppContext {
    pub orchestrator: Arc<DetectionOrchestrator>,
    pub sessions: SessionRegistry,
    pub pubsub: Arc<NamedPubSub>,
    pub model_path: PathBuf,
    pub default_confidence: f32,
}

impl AppContext {
    pub fn new(
        orchestrator: Arc<DetectionOrchestrator>,
        pubsub: Arc<NamedPubSub>,
        model_path: PathBuf,
        default_confidence: f32,
    ) -> Self {
        Self {
            orchestrator,
            sessions: SessionRegistry::new(),
            pubsub,
            model_path,
            default_confidence: clamp_confidence(Some(default_confidence), DEFAULT_CONFIDENCE),
        }
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/detect", post(detect))
        .route("/labels", get(labels))
        .route("/history", get(history))
        .route("/reset", post(reset))
        .route("/stream", get(named_stream))
        .route("/live/start", post(live_start))
        .route("/live/stop", post(live_stop))
        .route("/live/stream", get(live_stream))
        .layer(Extension(ctx))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Clamp a requested threshold into the range the dashboard offers.
pub fn clamp_confidence(requested: Option<f32>, default: f32) -> f32 {
    requested
        .filter(|c| c.is_finite())
        .unwrap_or(default)
        .clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Error response with a status code and a user-visible message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        log::error!("Internal error: {err}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        let status = match &err {
            DetectError::Validation(_) => StatusCode::BAD_REQUEST,
            DetectError::ModelLoad { .. } | DetectError::ModelUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DetectError::Inference { .. } | DetectError::ClassResolution { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.kind(), err.user_message())
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        let status = match &err {
            SourceError::UnknownSpec(_) | SourceError::Empty(_) | SourceError::Image(_) => {
                StatusCode::BAD_REQUEST
            }
            SourceError::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
            SourceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, "source", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub model_online: bool,
    pub model_path: String,
    pub classes: Vec<String>,
    pub sessions: usize,
}

pub async fn status(Extension(ctx): Extension<Arc<AppContext>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        model_online: ctx.orchestrator.is_online(),
        model_path: ctx.model_path.display().to_string(),
        classes: ctx.orchestrator.class_names().to_vec(),
        sessions: ctx.sessions.len(),
    })
}

/// Search parameters selecting a session.
#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    session: Option<String>,
}

impl SessionParams {
    fn name(&self) -> &str {
        self.session.as_deref().unwrap_or(DEFAULT_SESSION)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DetectParams {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub session: String,
    pub state: RunState,
    pub message: String,
    pub labels: Vec<String>,
    pub detections: Vec<DetectionBox>,
    pub total_detections: usize,
    pub unique_classes: usize,
    pub elapsed_ms: f64,
    pub suggest_lower_threshold: bool,
    /// Rendered image as a JPEG data URL.
    pub image: String,
}

impl DetectResponse {
    fn new(session: &str, state: RunState, summary: RunSummary) -> Result<Self, ApiError> {
        let jpeg = encode_jpeg(&summary.rendered_image, RESPONSE_JPEG_QUALITY)
            .map_err(ApiError::internal)?;
        let image = format!(
            "data:image/jpeg;base64,{}",
            general_purpose::STANDARD.encode(jpeg)
        );

        Ok(Self {
            session: session.to_owned(),
            state,
            message: summary.message(),
            total_detections: summary.total_detections,
            unique_classes: summary.unique_classes,
            elapsed_ms: summary.elapsed.as_secs_f64() * 1000.0,
            suggest_lower_threshold: summary.suggest_lower_threshold,
            labels: summary.labels,
            detections: summary.detections,
            image,
        })
    }
}

/// Run detection on the uploaded image. An empty body counts as no image.
pub async fn detect(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<DetectParams>,
    body: Bytes,
) -> Result<Json<DetectResponse>, ApiError> {
    let name = params.session.as_deref().unwrap_or(DEFAULT_SESSION);
    let threshold = clamp_confidence(params.confidence, ctx.default_confidence);
    let session = ctx.sessions.get_or_create(name);

    let orchestrator = ctx.orchestrator.clone();
    let pending = tokio::task::spawn_blocking(move || {
        let image = if body.is_empty() {
            None
        } else {
            Some(decode_image(&body)?)
        };
        Ok::<_, DetectError>(orchestrator.execute(image.as_ref(), threshold))
    })
    .await
    .map_err(ApiError::internal)??;

    let report = pending.commit(&mut session.lock_state());
    let state = report.state();
    let summary = report.outcome?;
    log::info!(
        "Session {}: {} detections in {:.2?}",
        name,
        summary.total_detections,
        summary.elapsed
    );

    Ok(Json(DetectResponse::new(name, state, summary)?))
}

#[derive(Debug, Serialize)]
pub struct LabelsResponse {
    pub session: String,
    pub labels: Vec<String>,
}

pub async fn labels(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<SessionParams>,
) -> Json<LabelsResponse> {
    let labels = match ctx.sessions.get(params.name()) {
        Some(session) => session.lock_state().recent_labels().to_vec(),
        None => Vec::new(),
    };

    Json(LabelsResponse {
        session: params.name().to_owned(),
        labels,
    })
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session: String,
    pub entries: Vec<HistoryEntry>,
    pub table: HistoryTable,
}

pub async fn history(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<SessionParams>,
) -> Json<HistoryResponse> {
    let (entries, table) = match ctx.sessions.get(params.name()) {
        Some(session) => {
            let state = session.lock_state();
            (state.history().to_vec(), state.history_table())
        }
        None => (Vec::new(), HistoryTable::default()),
    };

    Json(HistoryResponse {
        session: params.name().to_owned(),
        entries,
        table,
    })
}

pub async fn reset(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<SessionParams>,
) -> StatusCode {
    if let Some(session) = ctx.sessions.get(params.name()) {
        session.lock_state().reset();
        log::info!("Session {} reset", params.name());
    }
    StatusCode::NO_CONTENT
}

/// Search parameters available to streams.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    name: Option<String>,
}

/// Raw frames of a data socket channel.
pub async fn named_stream(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let name = params.name.unwrap_or_else(|| "unknown".into());
    log::info!("Stream for {} requested", &name);

    let rx = ctx.pubsub.get_broadcast_receiver(&name).await;
    let stream = BroadcastStream::new(rx)
        .filter_map(|item| item.ok())
        .map(|jpeg| Ok::<_, std::io::Error>(as_jpeg_stream_item(&jpeg)));

    mjpeg_response(StreamBody::new(stream))
}

#[derive(Debug, Deserialize)]
pub struct LiveStartParams {
    #[serde(default)]
    session: Option<String>,
    source: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct LiveStartResponse {
    pub session: String,
    pub source: String,
    pub confidence: f32,
}

pub async fn live_start(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<LiveStartParams>,
) -> Result<Json<LiveStartResponse>, ApiError> {
    if !ctx.orchestrator.is_online() {
        return Err(DetectError::ModelUnavailable.into());
    }

    let name = params.session.as_deref().unwrap_or(DEFAULT_SESSION);
    let threshold = clamp_confidence(params.confidence, ctx.default_confidence);
    let spec: SourceSpec = params.source.parse()?;

    let session = ctx.sessions.get_or_create(name);
    if session.is_live().await {
        return Err(live_running(name));
    }

    let source = open_source(&ctx, spec).await?;
    if !session
        .start_live(ctx.orchestrator.clone(), source, threshold)
        .await
    {
        return Err(live_running(name));
    }

    Ok(Json(LiveStartResponse {
        session: name.to_owned(),
        source: params.source,
        confidence: threshold,
    }))
}

fn live_running(session: &str) -> ApiError {
    ApiError::new(
        StatusCode::CONFLICT,
        "live",
        format!("a live stream is already running for session {session}"),
    )
}

async fn open_source(ctx: &AppContext, spec: SourceSpec) -> Result<Box<dyn FrameSource>, ApiError> {
    match spec {
        SourceSpec::Socket(channel) => {
            let rx = ctx.pubsub.get_broadcast_receiver(&channel).await;
            Ok(Box::new(SocketSource::new(&channel, rx)))
        }
        SourceSpec::Directory(dir) => {
            let sequence = tokio::task::spawn_blocking(move || ImageSequence::from_dir(&dir))
                .await
                .map_err(ApiError::internal)??;
            Ok(Box::new(sequence.with_interval(REPLAY_INTERVAL)))
        }
        SourceSpec::Camera(device) => Ok(open_camera(&device)?),
    }
}

#[cfg(feature = "camera")]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(crate::sensors::CameraSource::open(device)?))
}

#[cfg(not(feature = "camera"))]
fn open_camera(device: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Device(format!(
        "cannot open {device}, the server was built without the camera feature"
    )))
}

#[derive(Debug, Serialize)]
pub struct LiveStopResponse {
    pub session: String,
    pub stats: LiveStats,
}

pub async fn live_stop(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<SessionParams>,
) -> Result<Json<LiveStopResponse>, ApiError> {
    let not_running = || {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "live",
            format!("no live stream for session {}", params.name()),
        )
    };

    let session = ctx.sessions.get(params.name()).ok_or_else(not_running)?;
    let stats = session.stop_live().await.ok_or_else(not_running)?;

    Ok(Json(LiveStopResponse {
        session: params.name().to_owned(),
        stats,
    }))
}

/// Rendered frames of a session's live stream.
pub async fn live_stream(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<SessionParams>,
) -> Result<Response, ApiError> {
    let session = ctx.sessions.get(params.name()).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "session",
            format!("unknown session {}", params.name()),
        )
    })?;
    log::info!("Live stream of session {} requested", session.name());

    let stream = BroadcastStream::new(session.subscribe_rendered())
        .filter_map(|item| item.ok())
        .map(Ok::<_, std::io::Error>);

    Ok(mjpeg_response(StreamBody::new(stream)).into_response())
}

fn mjpeg_response<S>(body: StreamBody<S>) -> impl IntoResponse
where
    StreamBody<S>: IntoResponse,
{
    // Set body and headers for multipart streaming
    let headers = [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)];
    (headers, body)
}
