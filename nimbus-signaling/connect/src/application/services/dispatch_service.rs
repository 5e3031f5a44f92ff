//! 下行分发应用服务
//!
//! 处理本节点独占队列上的每条消息：解码后按消息类型写给本地会话或强制下线。
//! 写入只是入队到各连接的下行队列，慢客户端不会阻塞消费者。

use std::sync::Arc;
use std::time::Instant;

use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_signaling_common::codec::{CodecChain, CodecOutcome, Protocol};
use nimbus_signaling_common::{DeviceGroup, Envelope, MessageType};
use tracing::{debug, warn};

use crate::domain::model::SendError;
use crate::domain::service::DeviceSessionRegistry;

/// 单条消息的分发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 已处理，`sessions` 为写入或下线的会话数（目标不在本节点时为 0）
    Delivered { sessions: usize },
    /// 可重试的失败
    Failed(String),
    /// 无法处理的消息，重试也不会成功
    Rejected(String),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered { .. } => "delivered",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::Rejected(_) => "rejected",
        }
    }
}

pub struct NodeDispatchService {
    registry: DeviceSessionRegistry,
    chain: CodecChain,
    metrics: Arc<ConnectMetrics>,
}

impl NodeDispatchService {
    /// 总线载荷以 JSON 为主，兼容二进制
    pub fn new(registry: DeviceSessionRegistry, metrics: Arc<ConnectMetrics>) -> Self {
        Self {
            registry,
            chain: CodecChain::new(Protocol::Json),
            metrics,
        }
    }

    pub fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let started = Instant::now();
        let (kind_label, outcome) = match self.chain.decode(payload) {
            (_, CodecOutcome::Decoded(envelope)) => {
                let kind = envelope.kind();
                let label = kind.map(MessageType::as_str).unwrap_or("UNKNOWN");
                (label, self.dispatch_envelope(kind, envelope))
            }
            (_, CodecOutcome::Error(reason)) => {
                ("UNDECODABLE", DispatchOutcome::Rejected(format!("undecodable payload: {reason}")))
            }
            (_, CodecOutcome::Mismatch) => (
                "UNDECODABLE",
                DispatchOutcome::Rejected("payload matches no protocol".to_string()),
            ),
        };

        self.metrics
            .dispatch_total
            .with_label_values(&[kind_label, outcome.label()])
            .inc();
        self.metrics
            .dispatch_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    fn dispatch_envelope(&self, kind: Option<MessageType>, envelope: Envelope) -> DispatchOutcome {
        match kind {
            Some(
                MessageType::SingleMessage
                | MessageType::GroupMessage
                | MessageType::VideoMessage
                | MessageType::GroupOperation
                | MessageType::MessageOperation,
            ) => self.deliver(envelope),
            Some(MessageType::ForceLogout) => self.force_logout(&envelope),
            Some(other) => DispatchOutcome::Rejected(format!("{} is not dispatchable", other.as_str())),
            None => DispatchOutcome::Rejected(format!("unknown message code {}", envelope.code)),
        }
    }

    /// 写给每个目标用户在本节点的全部会话，不在线的跳过
    fn deliver(&self, envelope: Envelope) -> DispatchOutcome {
        let mut delivered = 0;
        let mut backpressured = 0;
        for user_id in &envelope.ids {
            for session in self.registry.get_all_sessions(user_id) {
                match session.send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(SendError::Closed) => {
                        debug!(user_id = %user_id, session_id = %session.session_id(), "Session closing, skipped");
                    }
                    Err(SendError::Backpressure) => {
                        backpressured += 1;
                        self.metrics
                            .frames_dropped_total
                            .with_label_values(&["backpressure"])
                            .inc();
                        warn!(user_id = %user_id, session_id = %session.session_id(), "Outbound queue full");
                    }
                }
            }
        }

        debug!(
            code = envelope.code,
            targets = envelope.ids.len(),
            delivered,
            backpressured,
            "Envelope dispatched"
        );
        if backpressured > 0 {
            return DispatchOutcome::Failed(format!("{backpressured} session queue(s) full"));
        }
        DispatchOutcome::Delivered { sessions: delivered }
    }

    /// 下线指定设备类型所在分组的会话，未指定设备类型时下线全部分组
    fn force_logout(&self, envelope: &Envelope) -> DispatchOutcome {
        let group = envelope
            .device_type
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| DeviceGroup::from_device_type(Some(d)));
        let kicked = envelope
            .ids
            .iter()
            .map(|user_id| self.registry.kick_sessions(user_id, group))
            .sum();
        DispatchOutcome::Delivered { sessions: kicked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::RegistryOptions;
    use crate::test_support::recording_connection;
    use nimbus_signaling_common::codec::{BinaryCodec, EnvelopeCodec, JsonCodec};
    use std::time::Duration;

    fn setup() -> (DeviceSessionRegistry, NodeDispatchService) {
        let registry = DeviceSessionRegistry::new(RegistryOptions {
            multi_device_enabled: true,
            kick_flush_timeout: Duration::from_millis(100),
        });
        let dispatcher = NodeDispatchService::new(registry.clone(), Arc::new(ConnectMetrics::new()));
        (registry, dispatcher)
    }

    fn json(envelope: &Envelope) -> Vec<u8> {
        JsonCodec.encode(envelope).unwrap().to_vec()
    }

    #[tokio::test]
    async fn delivers_to_every_session_and_skips_absent_users() {
        let (registry, dispatcher) = setup();
        let (web, mut web_written) = recording_connection(16);
        let (mobile, mut mobile_written) = recording_connection(16);
        registry.add_session("u1", web, Some("web"));
        registry.add_session("u1", mobile, Some("android"));

        let message = Envelope::builder(MessageType::GroupMessage)
            .ids(vec!["u1".into(), "offline".into()])
            .message("hi")
            .build();
        assert_eq!(
            dispatcher.dispatch(&json(&message)),
            DispatchOutcome::Delivered { sessions: 2 }
        );
        assert_eq!(web_written.recv().await.unwrap().message.as_deref(), Some("hi"));
        assert_eq!(mobile_written.recv().await.unwrap().message.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn binary_payloads_are_accepted() {
        let (registry, dispatcher) = setup();
        let (conn, mut written) = recording_connection(16);
        registry.add_session("u1", conn, None);

        let message = Envelope::builder(MessageType::SingleMessage)
            .ids(vec!["u1".into()])
            .build();
        let payload = BinaryCodec.encode(&message).unwrap();
        assert_eq!(
            dispatcher.dispatch(&payload),
            DispatchOutcome::Delivered { sessions: 1 }
        );
        assert_eq!(written.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn force_logout_is_idempotent() {
        let (registry, dispatcher) = setup();
        let (web, _w) = recording_connection(16);
        let (mobile, _m) = recording_connection(16);
        registry.add_session("u1", web.clone(), Some("web"));
        registry.add_session("u1", mobile.clone(), Some("ios"));

        let logout = Envelope::builder(MessageType::ForceLogout)
            .device_type("WEB")
            .ids(vec!["u1".into()])
            .build();
        assert_eq!(
            dispatcher.dispatch(&json(&logout)),
            DispatchOutcome::Delivered { sessions: 1 }
        );
        assert_eq!(
            dispatcher.dispatch(&json(&logout)),
            DispatchOutcome::Delivered { sessions: 0 }
        );
        assert!(registry.get_session("u1", DeviceGroup::Web).is_none());
        assert!(registry.get_session("u1", DeviceGroup::Mobile).is_some());

        tokio::time::timeout(Duration::from_secs(1), web.shutdown_token().cancelled())
            .await
            .unwrap();
        assert!(!mobile.is_closed());
    }

    #[tokio::test]
    async fn garbage_and_unknown_codes_are_rejected() {
        let (_registry, dispatcher) = setup();
        assert!(matches!(
            dispatcher.dispatch(b"{not json"),
            DispatchOutcome::Rejected(_)
        ));

        let unknown = Envelope {
            code: 9999,
            ids: vec!["u1".into()],
            ..Envelope::default()
        };
        assert!(matches!(
            dispatcher.dispatch(&json(&unknown)),
            DispatchOutcome::Rejected(_)
        ));

        let login = Envelope::builder(MessageType::Login).build();
        assert!(matches!(
            dispatcher.dispatch(&json(&login)),
            DispatchOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn full_queue_is_a_retryable_failure() {
        let (registry, dispatcher) = setup();
        // 没有写任务消费，队列容量 1
        let (conn, _rx) = crate::domain::model::ConnectionHandle::new(None, 1);
        registry.add_session("u1", conn, None);

        let message = Envelope::builder(MessageType::SingleMessage)
            .ids(vec!["u1".into()])
            .build();
        assert_eq!(
            dispatcher.dispatch(&json(&message)),
            DispatchOutcome::Delivered { sessions: 1 }
        );
        assert!(matches!(
            dispatcher.dispatch(&json(&message)),
            DispatchOutcome::Failed(_)
        ));
    }
}
