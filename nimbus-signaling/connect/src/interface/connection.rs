//! 单连接的读写循环
//!
//! 传输层（TCP / WebSocket）把入站帧整理成 `InboundFrame` 流、把出站消息交给 `Sink`，
//! 其余状态流转（鉴权 → 登录 → 常态）与传输无关，都在这里完成。

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_signaling_common::codec::{
    BinaryCodec, CodecChain, CodecOutcome, EnvelopeCodec, JsonCodec, Protocol,
};
use nimbus_signaling_common::{Envelope, MessageType, SignalingResult};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::application::{ConnectionApplicationService, LoginOutcome};
use crate::config::ConnectConfig;
use crate::domain::model::{ConnectionHandle, ConnectionIdentity, Outbound};
use crate::interface::gate::AuthGate;

/// 传输层交给读循环的入站单元
#[derive(Debug)]
pub enum InboundFrame {
    Data(Bytes),
    /// Ping / Pong 等控制帧，只计入活跃时间
    Control,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub primary: Protocol,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    /// 拒绝回复或限流回复在关闭前的最长等待
    pub close_flush_timeout: Duration,
    pub outbound_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            primary: config.protocol,
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
            close_flush_timeout: config.kick_flush_timeout(),
            outbound_capacity: config.outbound_queue_capacity,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

enum Flow {
    Continue,
    Close(&'static str),
}

/// 所有连接共享的处理上下文
pub struct ConnectionRuntime {
    settings: ConnectionSettings,
    gate: Arc<AuthGate>,
    service: Arc<ConnectionApplicationService>,
    chain: CodecChain,
    metrics: Arc<ConnectMetrics>,
}

impl ConnectionRuntime {
    pub fn new(
        settings: ConnectionSettings,
        gate: Arc<AuthGate>,
        service: Arc<ConnectionApplicationService>,
        metrics: Arc<ConnectMetrics>,
    ) -> Self {
        let chain = CodecChain::new(settings.primary);
        Self {
            settings,
            gate,
            service,
            chain,
            metrics,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn metrics(&self) -> &ConnectMetrics {
        &self.metrics
    }

    pub fn open(&self, peer: Option<std::net::SocketAddr>) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new(peer, self.settings.outbound_capacity);
        self.metrics.connections_active.inc();
        (handle, rx)
    }

    /// 读循环：直到对端断开、空闲超时或连接被关闭，退出前执行清理
    ///
    /// `identity` 为握手阶段已认证的身份；为 None 时第一帧必须通过鉴权闸门。
    pub async fn drive<S, E>(
        &self,
        handle: Arc<ConnectionHandle>,
        identity: Option<ConnectionIdentity>,
        mut frames: S,
    ) where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: Display,
    {
        let shutdown = handle.shutdown_token();
        let mut identity = identity;
        handle.touch();

        let reason = loop {
            let deadline = handle.last_activity() + self.settings.idle_timeout;
            tokio::select! {
                _ = shutdown.cancelled() => break "closed",
                _ = sleep_until(deadline) => {
                    if handle.last_activity() + self.settings.idle_timeout <= Instant::now() {
                        info!(session_id = %handle.id(), "Connection idle timeout");
                        break "idle_timeout";
                    }
                }
                frame = frames.next() => match frame {
                    None => break "peer_closed",
                    Some(Err(err)) => {
                        debug!(session_id = %handle.id(), error = %err, "Transport read failed");
                        break "transport_error";
                    }
                    Some(Ok(InboundFrame::Control)) => handle.touch(),
                    Some(Ok(InboundFrame::Data(bytes))) => {
                        handle.touch();
                        if let Flow::Close(reason) = self.on_frame(&handle, &mut identity, bytes).await {
                            break reason;
                        }
                    }
                },
            }
        };

        self.service.cleanup(&handle, reason, true).await;
        self.metrics.connections_active.dec();
    }

    async fn on_frame(
        &self,
        handle: &Arc<ConnectionHandle>,
        identity: &mut Option<ConnectionIdentity>,
        bytes: Bytes,
    ) -> Flow {
        let Some(current) = identity.as_ref() else {
            return match self.gate.authenticate_frame(&bytes) {
                Ok(auth) => {
                    if let Some(protocol) = auth.protocol {
                        handle.set_protocol(protocol);
                    }
                    let current = identity.insert(auth.identity);
                    match auth.envelope {
                        Some(envelope) => self.route(current, handle, envelope).await,
                        None => Flow::Continue,
                    }
                }
                Err(rejection) => {
                    if let Some(protocol) = rejection.protocol {
                        handle.set_protocol(protocol);
                    }
                    self.reply_and_close(handle, AuthGate::rejection(rejection.failure))
                        .await;
                    Flow::Close("auth_failed")
                }
            };
        };

        match self.chain.decode(&bytes) {
            (protocol, CodecOutcome::Decoded(envelope)) => {
                if let Some(protocol) = protocol {
                    handle.set_protocol(protocol);
                }
                self.route(current, handle, envelope).await
            }
            (_, outcome) => {
                debug!(session_id = %handle.id(), ?outcome, len = bytes.len(), "Undecodable frame dropped");
                self.metrics
                    .frames_dropped_total
                    .with_label_values(&["decode"])
                    .inc();
                Flow::Continue
            }
        }
    }

    async fn route(
        &self,
        identity: &ConnectionIdentity,
        handle: &Arc<ConnectionHandle>,
        mut envelope: Envelope,
    ) -> Flow {
        match envelope.kind() {
            Some(MessageType::Login) => {
                match self.service.login(identity, handle, &envelope).await {
                    LoginOutcome::Limited(_) => {
                        handle.flush(self.settings.close_flush_timeout).await;
                        Flow::Close("connection_limited")
                    }
                    LoginOutcome::Accepted(_) | LoginOutcome::Unavailable => Flow::Continue,
                }
            }
            Some(MessageType::HeartBeat) => {
                self.service.heartbeat(identity, handle, &envelope).await;
                Flow::Continue
            }
            Some(MessageType::Logout) => {
                self.service.logout(handle).await;
                Flow::Close("logout")
            }
            Some(kind) if kind.is_business() => {
                if envelope.client_ip.is_none() {
                    envelope.client_ip = handle.peer().map(|peer| peer.ip().to_string());
                }
                self.service.forward(identity, handle, envelope).await;
                Flow::Continue
            }
            _ => {
                debug!(session_id = %handle.id(), code = envelope.code, "Unsupported client envelope dropped");
                self.metrics
                    .frames_dropped_total
                    .with_label_values(&["unsupported"])
                    .inc();
                Flow::Continue
            }
        }
    }

    async fn reply_and_close(&self, handle: &ConnectionHandle, envelope: Envelope) {
        if handle.send(envelope).is_ok() {
            handle.flush(self.settings.close_flush_timeout).await;
        }
        handle.close();
    }
}

/// 按协议编码一条下行消息
pub fn encode_envelope(protocol: Protocol, envelope: &Envelope) -> SignalingResult<Bytes> {
    match protocol {
        Protocol::Proto => BinaryCodec.encode(envelope),
        Protocol::Json => JsonCodec.encode(envelope),
    }
}

/// 写循环：消费下行队列，按连接协议编码后写出
///
/// 写失败或超时即关闭连接；`Flush` 指令在此前的消息都已写出后回执。
pub async fn write_loop<K, M, F>(
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: K,
    primary: Protocol,
    write_timeout: Duration,
    to_message: F,
) where
    K: Sink<M> + Unpin,
    K::Error: Display,
    F: Fn(Protocol, Bytes) -> M,
{
    let shutdown = handle.shutdown_token();
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            None => break,
            Some(Outbound::Envelope(envelope)) => {
                let protocol = handle.protocol().unwrap_or(primary);
                let bytes = match encode_envelope(protocol, &envelope) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(session_id = %handle.id(), error = %err, code = envelope.code, "Failed to encode outbound envelope");
                        continue;
                    }
                };
                match timeout(write_timeout, sink.send(to_message(protocol, bytes))).await {
                    Ok(Ok(())) => handle.touch(),
                    Ok(Err(err)) => {
                        debug!(session_id = %handle.id(), error = %err, "Transport write failed");
                        handle.close();
                        break;
                    }
                    Err(_) => {
                        warn!(session_id = %handle.id(), "Transport write timed out");
                        handle.close();
                        break;
                    }
                }
            }
            Some(Outbound::Flush(ack)) => {
                let _ = ack.send(());
            }
        }
    }

    rx.close();
    if let Ok(Err(err)) = timeout(write_timeout, sink.close()).await {
        debug!(session_id = %handle.id(), error = %err, "Transport close failed");
    }
}
