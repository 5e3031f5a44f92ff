use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::bus::{BusMessage, MessageBus, PublishOutcome};
use nimbus_signaling_common::codec::{EnvelopeCodec, JsonCodec};
use nimbus_signaling_common::{Envelope, MessageType, metadata_keys};
use tracing::{debug, warn};

use crate::domain::repository::NodeNotifier;

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// 经总线向其他节点的独占队列发送 FORCE_LOGOUT
///
/// 单次发布受 `publish_timeout` 约束，超时按失败处理。
pub struct BusNodeNotifier {
    bus: Arc<dyn MessageBus>,
    broker_id: String,
    publish_timeout: Duration,
}

impl BusNodeNotifier {
    pub fn new(bus: Arc<dyn MessageBus>, broker_id: impl Into<String>) -> Self {
        Self {
            bus,
            broker_id: broker_id.into(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[async_trait]
impl NodeNotifier for BusNodeNotifier {
    async fn force_logout(&self, broker_id: &str, user_id: &str, device_type: &str) -> Result<()> {
        let envelope = Envelope::builder(MessageType::ForceLogout)
            .device_type(device_type)
            .metadata(metadata_keys::BROKER_ID, self.broker_id.clone())
            .ids(vec![user_id.to_string()])
            .message("logged in on another node")
            .build();
        let payload = JsonCodec.encode(&envelope).map_err(|err| {
            ErrorBuilder::new(ErrorCode::SerializationFailed, "failed to encode force logout")
                .details(err.to_string())
                .build_error()
        })?;

        let publish = self.bus.publish(BusMessage::new(broker_id, payload));
        let outcome = tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| {
                ErrorBuilder::new(ErrorCode::Timeout, "force logout publish timed out")
                    .details(format!("{:?}", self.publish_timeout))
                    .build_error()
            })??;

        match outcome {
            PublishOutcome::Confirmed => {
                debug!(target_node = %broker_id, user_id = %user_id, device_type = %device_type, "Remote force logout sent");
                Ok(())
            }
            // 旧节点已下线，其队列随之删除，无需处理
            PublishOutcome::Returned(reason) => {
                debug!(target_node = %broker_id, user_id = %user_id, %reason, "Previous node is gone");
                Ok(())
            }
            outcome => {
                warn!(target_node = %broker_id, user_id = %user_id, %outcome, "Remote force logout not confirmed");
                Err(ErrorBuilder::new(ErrorCode::ServiceUnavailable, "force logout publish not confirmed")
                    .details(outcome.to_string())
                    .build_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StalledBus;
    use nimbus_signaling_common::bus::InMemoryBus;

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_times_out() {
        let notifier = BusNodeNotifier::new(Arc::new(StalledBus), "node-b")
            .with_publish_timeout(Duration::from_millis(200));

        let err = notifier.force_logout("node-a", "u1", "web").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn vanished_node_is_not_an_error() {
        let bus = Arc::new(InMemoryBus::new());
        let notifier = BusNodeNotifier::new(bus.clone(), "node-b");

        tokio_test::assert_ok!(notifier.force_logout("node-gone", "u1", "web").await);
        assert_eq!(bus.published_to("node-gone").await.len(), 1);
    }
}
