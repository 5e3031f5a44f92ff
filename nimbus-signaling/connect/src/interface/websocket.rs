//! WebSocket 长连接：握手阶段鉴权，使用 WebSocket 自身的帧边界

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::codec::Protocol;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionRuntime, InboundFrame, write_loop};
use super::gate::HandshakeCredentials;
use crate::domain::model::ConnectionIdentity;

pub struct WebSocketSignalingServer {
    runtime: Arc<ConnectionRuntime>,
    path: Arc<str>,
}

impl WebSocketSignalingServer {
    pub fn new(runtime: Arc<ConnectionRuntime>, path: impl Into<String>) -> Self {
        Self {
            runtime,
            path: Arc::from(path.into()),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|err| {
            ErrorBuilder::new(ErrorCode::ServiceUnavailable, "failed to bind websocket listener")
                .details(format!("{addr}: {err}"))
                .build_error()
        })
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr().ok();
        info!(addr = ?local, path = %self.path, "WebSocket signaling server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = ?local, "WebSocket signaling server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let runtime = self.runtime.clone();
                        let path = self.path.clone();
                        tokio::spawn(async move {
                            handle_connection(runtime, path, stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept websocket connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        Ok(())
    }
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    runtime: Arc<ConnectionRuntime>,
    path: Arc<str>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut authenticated: Option<ConnectionIdentity> = None;
    let callback = |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if req.uri().path() != &*path {
            return Err(error_response(StatusCode::NOT_FOUND, "unknown path"));
        }
        let credentials = HandshakeCredentials::extract(req.uri().query(), |name| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        });
        match runtime.gate().authenticate_handshake(&credentials) {
            Ok(identity) => {
                authenticated = Some(identity);
                Ok(response)
            }
            Err(failure) => Err(error_response(StatusCode::UNAUTHORIZED, &failure.to_string())),
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%peer, error = %err, "WebSocket handshake rejected");
            return;
        }
    };
    let Some(identity) = authenticated else {
        return;
    };

    let settings = runtime.settings().clone();
    let (sink, source) = ws_stream.split();
    let frames = source.map(|message| {
        message.map(|message| match message {
            Message::Text(text) => InboundFrame::Data(Bytes::from(text)),
            Message::Binary(data) => InboundFrame::Data(Bytes::from(data)),
            _ => InboundFrame::Control,
        })
    });

    let (handle, rx) = runtime.open(Some(peer));
    info!(%peer, user_id = %identity.user_id, session_id = %handle.id(), "WebSocket connection accepted");

    let writer = tokio::spawn(write_loop(
        handle.clone(),
        rx,
        sink,
        settings.primary,
        settings.write_timeout,
        |protocol, bytes: Bytes| match protocol {
            Protocol::Json => Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()),
            Protocol::Proto => Message::Binary(bytes.to_vec().into()),
        },
    ));

    runtime.drive(handle.clone(), Some(identity), frames).await;
    handle.close();
    if let Err(err) = writer.await {
        warn!(%peer, error = %err, "websocket writer task failed");
    }
    debug!(%peer, session_id = %handle.id(), "WebSocket connection finished");
}
