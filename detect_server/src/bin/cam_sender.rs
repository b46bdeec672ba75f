//! Camera sender binary, pushes MJPG frames of a local camera to the data socket.
//!
use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use common::protocol::{FrameMsg, ProtoMsg};
use detect_server::sensors::open_max_res_mjpg_camera;
use env_logger::TimestampPrecision;
use futures::sink::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the data socket of the detection server
    #[clap(long, default_value = "127.0.0.1:3001")]
    address: String,

    /// Channel name that this sender publishes to
    #[clap(long, default_value = "cam")]
    channel: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    log::info!("Launching socket sender for channel {}", &args.channel);

    // Initialize webcam to send image stream
    let cam = open_max_res_mjpg_camera(&args.device)?;

    let stream = TcpStream::connect(&args.address).await?;
    log::info!("Connected to {}", &args.address);

    // Wrap stream in transport handler with length-delimited codec
    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    // Send init message
    let init_msg = ProtoMsg::ConnectReq(args.channel.clone()).serialize()?;
    transport.send(Bytes::from(init_msg)).await?;

    // Send captured frames in a loop
    loop {
        match cam.capture() {
            Ok(frame) => {
                let data =
                    ProtoMsg::FrameMsg(FrameMsg::new(args.channel.clone(), frame[..].to_vec()))
                        .serialize()?;
                transport.send(Bytes::from(data)).await?;
            }
            Err(e) => log::error!("Unable to capture frame, trying again... ({e})"),
        }
    }
}
