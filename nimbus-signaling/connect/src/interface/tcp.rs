//! TCP 长连接：4 字节大端长度前缀分帧

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::codec::length_delimited;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionRuntime, InboundFrame, write_loop};

pub struct TcpSignalingServer {
    runtime: Arc<ConnectionRuntime>,
}

impl TcpSignalingServer {
    pub fn new(runtime: Arc<ConnectionRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|err| {
            ErrorBuilder::new(ErrorCode::ServiceUnavailable, "failed to bind tcp listener")
                .details(format!("{addr}: {err}"))
                .build_error()
        })
    }

    /// 接受连接直到收到停机信号，每个连接在独立任务中处理
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().ok();
        info!(addr = ?local, "TCP signaling server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = ?local, "TCP signaling server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let runtime = self.runtime.clone();
                        tokio::spawn(async move {
                            handle_connection(runtime, stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept tcp connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        Ok(())
    }
}

async fn handle_connection(runtime: Arc<ConnectionRuntime>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "failed to set TCP_NODELAY");
    }
    let settings = runtime.settings().clone();
    let (read_half, write_half) = stream.into_split();
    let frames = FramedRead::new(read_half, length_delimited(settings.max_frame_bytes))
        .map(|frame| frame.map(|bytes| InboundFrame::Data(bytes.freeze())));
    let sink = FramedWrite::new(write_half, length_delimited(settings.max_frame_bytes));

    let (handle, rx) = runtime.open(Some(peer));
    debug!(%peer, session_id = %handle.id(), "TCP connection accepted");

    let writer = tokio::spawn(write_loop(
        handle.clone(),
        rx,
        sink,
        settings.primary,
        settings.write_timeout,
        |_, bytes| bytes,
    ));

    runtime.drive(handle.clone(), None, frames).await;
    handle.close();
    if let Err(err) = writer.await {
        warn!(%peer, error = %err, "tcp writer task failed");
    }
    debug!(%peer, session_id = %handle.id(), "TCP connection finished");
}
