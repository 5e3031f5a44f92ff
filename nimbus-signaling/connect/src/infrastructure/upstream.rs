//! 上行业务消息转发

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::bus::{BusMessage, MessageBus, PublishOutcome};
use nimbus_signaling_common::codec::{EnvelopeCodec, JsonCodec};
use nimbus_signaling_common::{Envelope, metadata_keys};
use tracing::{debug, instrument};

use crate::domain::model::ConnectionIdentity;
use crate::domain::repository::UpstreamForwarder;

/// 发布到总线上固定路由键的转发器
pub struct BusUpstreamForwarder {
    bus: Arc<dyn MessageBus>,
    routing_key: String,
    broker_id: String,
}

impl BusUpstreamForwarder {
    pub fn new(bus: Arc<dyn MessageBus>, routing_key: impl Into<String>, broker_id: impl Into<String>) -> Self {
        Self {
            bus,
            routing_key: routing_key.into(),
            broker_id: broker_id.into(),
        }
    }
}

#[async_trait]
impl UpstreamForwarder for BusUpstreamForwarder {
    #[instrument(skip_all, fields(user_id = %identity.user_id, code = envelope.code))]
    async fn forward(&self, identity: &ConnectionIdentity, mut envelope: Envelope) -> Result<()> {
        // 凭证不离开接入层
        envelope.token = None;
        envelope
            .metadata
            .insert(metadata_keys::USER_ID.to_string(), identity.user_id.clone());
        envelope
            .metadata
            .insert(metadata_keys::BROKER_ID.to_string(), self.broker_id.clone());

        let payload = JsonCodec.encode(&envelope).map_err(|err| {
            ErrorBuilder::new(ErrorCode::SerializationFailed, "failed to encode upstream envelope")
                .details(err.to_string())
                .build_error()
        })?;
        let message = BusMessage::new(self.routing_key.clone(), payload)
            .with_correlation_id(envelope.request_id.clone());

        match self.bus.publish(message).await? {
            PublishOutcome::Confirmed => Ok(()),
            outcome => Err(ErrorBuilder::new(
                ErrorCode::ServiceUnavailable,
                "upstream publish not confirmed",
            )
            .details(outcome.to_string())
            .build_error()),
        }
    }
}

/// 未配置上行路由时使用：记录后丢弃
pub struct LoggingUpstreamForwarder;

#[async_trait]
impl UpstreamForwarder for LoggingUpstreamForwarder {
    async fn forward(&self, identity: &ConnectionIdentity, envelope: Envelope) -> Result<()> {
        debug!(
            user_id = %identity.user_id,
            code = envelope.code,
            request_id = ?envelope.request_id,
            "No upstream configured, dropping client envelope"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_signaling_common::MessageType;
    use nimbus_signaling_common::bus::InMemoryBus;
    use nimbus_signaling_common::codec::CodecOutcome;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new("u1", Some("ios".into()), "secret-token")
    }

    #[tokio::test]
    async fn forwards_without_token_and_with_sender() {
        let bus = Arc::new(InMemoryBus::new());
        bus.declare_durable("im.upstream").await.unwrap();
        let forwarder = BusUpstreamForwarder::new(bus.clone(), "im.upstream", "node-a");

        let env = Envelope::builder(MessageType::SingleMessage)
            .token("secret-token")
            .request_id(Some("m-1".into()))
            .build();
        forwarder.forward(&identity(), env).await.unwrap();

        let published = bus.published_to("im.upstream").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].correlation_id.as_deref(), Some("m-1"));
        let CodecOutcome::Decoded(sent) = JsonCodec.decode(&published[0].payload) else {
            panic!("upstream payload should be JSON");
        };
        assert_eq!(sent.token, None);
        assert_eq!(sent.metadata.get("userId").map(String::as_str), Some("u1"));
        assert_eq!(sent.metadata.get("brokerId").map(String::as_str), Some("node-a"));
    }

    #[tokio::test]
    async fn unroutable_upstream_is_an_error() {
        let bus = Arc::new(InMemoryBus::new());
        let forwarder = BusUpstreamForwarder::new(bus, "im.upstream", "node-a");
        let env = Envelope::builder(MessageType::GroupMessage).build();
        let err = forwarder.forward(&identity(), env).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ServiceUnavailable);
    }
}
