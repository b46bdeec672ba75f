//! Data socket module to receive image streams via network.
//!
use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use bytes::Bytes;
use common::protocol::ProtoMsg;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::pubsub::NamedPubSub;

/// Pause after a failed accept, e.g. when the process ran out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the data socket and publish incoming frames on the channel each sender names.
pub async fn spawn_data_socket(
    pubsub: Arc<NamedPubSub>,
    addr: &str,
) -> Result<JoinHandle<()>> {
    let socket: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(socket).await?;
    log::info!("Data socket listening on {}", listener.local_addr()?);

    Ok(serve_data_socket(listener, pubsub))
}

/// Accept senders until the task is aborted. Failed accepts are logged and retried.
pub fn serve_data_socket(listener: TcpListener, pubsub: Arc<NamedPubSub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _peer_addr)) => socket,
                Err(e) => {
                    log::error!("Data socket failed to accept a connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let pubsub = pubsub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_incoming(pubsub, socket).await {
                    log::warn!("Data socket connection closed: {e}");
                }
            });
        }
    })
}

async fn handle_incoming(pubsub: Arc<NamedPubSub>, stream: TcpStream) -> Result<()> {
    let addr = stream.peer_addr()?;
    log::info!("{}: New TCP connection", &addr);

    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    let channel_name = match transport.next().await {
        Some(Ok(data)) => match ProtoMsg::deserialize(&data) {
            Ok(msg @ ProtoMsg::ConnectReq(_)) => msg.channel().to_owned(),
            _ => bail!("{addr}: first message must name a channel"),
        },
        _ => bail!("{addr}: no channel name"),
    };
    log::info!("{}: Publishing to channel {}", &addr, &channel_name);

    let mut sender = pubsub.get_broadcast_sender(&channel_name).await;

    while let Some(res) = transport.next().await {
        match res {
            Ok(data) => match ProtoMsg::deserialize(&data) {
                Ok(ProtoMsg::ConnectReq(_)) => log::warn!("{}: Repeated connect request", &addr),
                Ok(msg) if msg.channel() != channel_name => {
                    log::debug!(
                        "{}: Ignoring frame for {} on channel {}",
                        &addr,
                        msg.channel(),
                        channel_name
                    );
                }
                Ok(ProtoMsg::FrameMsg(msg)) => {
                    if sender.send(Bytes::from(msg.data)).is_err() {
                        log::trace!("No listener on channel {}", &channel_name);
                        // Idle channels get pruned, later viewers subscribe to a fresh one
                        sender = pubsub.get_broadcast_sender(&channel_name).await;
                    }
                }
                Err(e) => log::warn!("{}: Undecodable message: {}", &addr, e),
            },
            Err(e) => {
                log::warn!("Error in TCP codec: {e}");
                break;
            }
        }
    }

    log::info!("{}: TCP stream ended", &addr);
    Ok(())
}
