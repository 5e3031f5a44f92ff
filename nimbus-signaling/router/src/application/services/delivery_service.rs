//! 投递应用服务
//!
//! 业务服务提交消息的入口：补全消息 ID 与时间，按需落库，
//! 再交给总线路由扇出到接收者所在的接入节点。

use std::sync::Arc;

use chrono::Utc;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::{Envelope, MessageType};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::model::{
    GroupMessage, GroupOperation, MessageAction, PrivateMessage, SYSTEM_SENDER, StoredMessage,
    VideoSignal,
};
use crate::domain::repository::MessageStore;
use crate::domain::service::{MessageBusRouter, RouteReport};

/// 一次提交的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// 音视频信令与强制下线没有消息 ID
    pub message_id: Option<String>,
    pub report: RouteReport,
}

pub struct DeliveryService {
    store: Arc<dyn MessageStore>,
    router: Arc<MessageBusRouter>,
}

impl DeliveryService {
    pub fn new(store: Arc<dyn MessageStore>, router: Arc<MessageBusRouter>) -> Self {
        Self { store, router }
    }

    pub fn router(&self) -> &Arc<MessageBusRouter> {
        &self.router
    }

    /// 单聊：先落库，再投递给接收者和发送者的其他设备
    #[instrument(skip_all, fields(from_id = %message.from_id, to_id = %message.to_id))]
    pub async fn send_single(&self, mut message: PrivateMessage) -> Result<DeliveryReceipt> {
        let message_id = assign_id(&mut message.message_id);
        if message.message_time == 0 {
            message.message_time = Utc::now().timestamp_millis();
        }
        self.store
            .persist(&StoredMessage::Private(message.clone()))
            .await?;

        let recipients = vec![message.from_id.clone(), message.to_id.clone()];
        let template = envelope(MessageType::SingleMessage, &message)?;
        self.fan_out(template, recipients, Some(message_id)).await
    }

    /// 群聊：成员为空时不落库也不投递
    #[instrument(skip_all, fields(from_id = %message.from_id, group_id = %message.group_id))]
    pub async fn send_group(&self, mut message: GroupMessage) -> Result<DeliveryReceipt> {
        let members = self.store.resolve_group_members(&message.group_id).await?;
        if members.is_empty() {
            warn!("Group has no members, message dropped");
            return Ok(DeliveryReceipt {
                message_id: message.message_id,
                report: RouteReport::default(),
            });
        }

        let message_id = assign_id(&mut message.message_id);
        if message.message_time == 0 {
            message.message_time = Utc::now().timestamp_millis();
        }
        self.store
            .persist(&StoredMessage::Group {
                message: message.clone(),
                members: members.clone(),
            })
            .await?;

        let template = envelope(MessageType::GroupMessage, &message)?;
        self.fan_out(template, members, Some(message_id)).await
    }

    /// 群组操作通知全体成员，不落库
    #[instrument(skip_all, fields(group_id = %operation.group_id))]
    pub async fn send_group_operation(&self, mut operation: GroupOperation) -> Result<DeliveryReceipt> {
        if operation.from_id.as_deref().is_none_or(str::is_empty) {
            operation.from_id = Some(SYSTEM_SENDER.to_string());
        }
        let message_id = assign_id(&mut operation.message_id);
        let members = self.store.resolve_group_members(&operation.group_id).await?;

        let template = envelope(MessageType::GroupOperation, &operation)?;
        self.fan_out(template, members, Some(message_id)).await
    }

    /// 撤回、编辑等消息操作：单聊通知双方，群聊通知全体成员
    #[instrument(skip_all, fields(message_id = %action.message_id))]
    pub async fn send_message_action(&self, mut action: MessageAction) -> Result<DeliveryReceipt> {
        let recipients = match (action.to_id.as_deref(), action.group_id.as_deref()) {
            (Some(to_id), _) if !to_id.is_empty() => {
                vec![action.from_id.clone(), to_id.to_string()]
            }
            (_, Some(group_id)) if !group_id.is_empty() => {
                self.store.resolve_group_members(group_id).await?
            }
            _ => {
                return Err(ErrorBuilder::new(
                    ErrorCode::InvalidParameter,
                    "message action needs toId or groupId",
                )
                .details(action.message_id.clone())
                .build_error());
            }
        };
        if action.action_time == 0 {
            action.action_time = Utc::now().timestamp_millis();
        }

        let template = envelope(MessageType::MessageOperation, &action)?;
        let message_id = action.message_id.clone();
        self.fan_out(template, recipients, Some(message_id)).await
    }

    /// 音视频信令只发给在线的接收者
    #[instrument(skip_all, fields(from_id = %signal.from_id, to_id = %signal.to_id))]
    pub async fn send_video(&self, signal: VideoSignal) -> Result<DeliveryReceipt> {
        let template = envelope(MessageType::VideoMessage, &signal)?;
        let recipients = vec![signal.to_id];
        self.fan_out(template, recipients, None).await
    }

    /// 让用户下线；指定设备类型时只下线该类型所在分组
    #[instrument(skip(self))]
    pub async fn force_logout(&self, user_id: &str, device_type: Option<&str>) -> Result<DeliveryReceipt> {
        let mut builder = Envelope::builder(MessageType::ForceLogout);
        if let Some(device_type) = device_type.filter(|d| !d.is_empty()) {
            builder = builder.device_type(device_type);
        }
        let receipt = self
            .fan_out(builder.build(), vec![user_id.to_string()], None)
            .await?;
        info!(nodes = receipt.report.publishes.len(), "Force logout published");
        Ok(receipt)
    }

    async fn fan_out(
        &self,
        template: Envelope,
        recipients: Vec<String>,
        message_id: Option<String>,
    ) -> Result<DeliveryReceipt> {
        let report = self
            .router
            .send_to_users(&template, &recipients, message_id.as_deref())
            .await?;
        Ok(DeliveryReceipt { message_id, report })
    }
}

fn assign_id(slot: &mut Option<String>) -> String {
    slot.get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone()
}

fn envelope<T: Serialize>(kind: MessageType, payload: &T) -> Result<Envelope> {
    let data = serde_json::to_value(payload).map_err(|err| {
        ErrorBuilder::new(ErrorCode::SerializationFailed, "failed to serialize message")
            .details(err.to_string())
            .build_error()
    })?;
    Ok(Envelope::builder(kind)
        .timestamp(Utc::now().timestamp_millis())
        .data(data)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::DeliveryLedger;
    use crate::infrastructure::InMemoryMessageStore;
    use nimbus_im_core::metrics::RouterMetrics;
    use nimbus_signaling_common::bus::{InMemoryBus, MessageBus};
    use nimbus_signaling_common::codec::{EnvelopeCodec, JsonCodec};
    use nimbus_signaling_common::presence::{InMemoryPresenceDirectory, PresenceDirectory};
    use nimbus_signaling_common::{DeviceGroup, DriverInfo, PresenceUpdate};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryMessageStore>,
        presence: Arc<InMemoryPresenceDirectory>,
        bus: Arc<InMemoryBus>,
        service: DeliveryService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMessageStore::new());
        let presence = Arc::new(InMemoryPresenceDirectory::new());
        let bus = Arc::new(InMemoryBus::new());
        let router = Arc::new(MessageBusRouter::new(
            presence.clone(),
            bus.clone(),
            Arc::new(DeliveryLedger::new()),
            Duration::from_secs(1),
            RouterMetrics::new(),
        ));
        let service = DeliveryService::new(store.clone(), router);
        Fixture {
            store,
            presence,
            bus,
            service,
        }
    }

    impl Fixture {
        async fn online(&self, user_id: &str, broker_id: &str) {
            self.presence
                .upsert(
                    &PresenceUpdate {
                        user_id: user_id.to_string(),
                        broker_id: broker_id.to_string(),
                        token: None,
                        device_group: DeviceGroup::Mobile,
                        driver: DriverInfo::default(),
                    },
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        async fn received(&self, broker_id: &str) -> Vec<Envelope> {
            self.bus
                .published_to(broker_id)
                .await
                .iter()
                .map(|m| JsonCodec.decode(&m.payload).into_envelope().unwrap())
                .collect()
        }
    }

    #[tokio::test]
    async fn single_message_is_persisted_then_synced_to_both_sides() {
        let fx = fixture();
        fx.online("alice", "node-a").await;
        fx.online("bob", "node-b").await;
        let _a = fx.bus.subscribe("node-a").await.unwrap();
        let _b = fx.bus.subscribe("node-b").await.unwrap();

        let receipt = fx
            .service
            .send_single(PrivateMessage {
                message_id: None,
                from_id: "alice".into(),
                to_id: "bob".into(),
                message_time: 0,
                body: json!({"text": "hi"}),
            })
            .await
            .unwrap();

        let message_id = receipt.message_id.clone().unwrap();
        assert!(receipt.report.all_confirmed());
        assert_eq!(receipt.report.publishes.len(), 2);

        let stored = fx.store.stored().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_id(), Some(message_id.as_str()));
        assert!(stored[0].message_time() > 0);

        let to_b = fx.received("node-b").await;
        assert_eq!(to_b[0].kind(), Some(MessageType::SingleMessage));
        assert_eq!(to_b[0].ids, vec!["bob".to_string()]);
        assert_eq!(to_b[0].data_str("messageId"), Some(message_id.as_str()));
        assert_eq!(to_b[0].data.as_ref().unwrap()["body"]["text"], "hi");
    }

    #[tokio::test]
    async fn self_message_publishes_once() {
        let fx = fixture();
        fx.online("alice", "node-a").await;
        let _a = fx.bus.subscribe("node-a").await.unwrap();

        let receipt = fx
            .service
            .send_single(PrivateMessage {
                message_id: Some("note-1".into()),
                from_id: "alice".into(),
                to_id: "alice".into(),
                message_time: 42,
                body: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("note-1"));
        assert_eq!(fx.received("node-a").await[0].ids, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn group_message_fans_out_per_node() {
        let fx = fixture();
        fx.store
            .set_group_members("g1", vec!["a".into(), "b".into(), "c".into(), "d".into()])
            .await;
        fx.online("a", "node-1").await;
        fx.online("b", "node-2").await;
        fx.online("c", "node-1").await;
        let _n1 = fx.bus.subscribe("node-1").await.unwrap();
        let _n2 = fx.bus.subscribe("node-2").await.unwrap();

        let receipt = fx
            .service
            .send_group(GroupMessage {
                message_id: None,
                from_id: "a".into(),
                group_id: "g1".into(),
                message_time: 0,
                body: json!({"text": "hello group"}),
            })
            .await
            .unwrap();

        assert_eq!(receipt.report.publishes.len(), 2);
        assert_eq!(receipt.report.offline, vec!["d".to_string()]);
        assert_eq!(fx.received("node-1").await[0].ids, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(fx.store.unread_count("d", "g1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_group_is_a_noop() {
        let fx = fixture();
        let receipt = fx
            .service
            .send_group(GroupMessage {
                message_id: None,
                from_id: "a".into(),
                group_id: "nobody".into(),
                message_time: 0,
                body: json!({}),
            })
            .await
            .unwrap();
        assert!(receipt.report.publishes.is_empty());
        assert!(fx.store.stored().await.is_empty());
        assert!(fx.bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn group_operation_defaults_to_system_sender_and_skips_store() {
        let fx = fixture();
        fx.store.set_group_members("g1", vec!["a".into()]).await;
        fx.online("a", "node-1").await;
        let _n1 = fx.bus.subscribe("node-1").await.unwrap();

        fx.service
            .send_group_operation(GroupOperation {
                message_id: None,
                from_id: None,
                group_id: "g1".into(),
                body: json!({"op": "rename"}),
            })
            .await
            .unwrap();

        let received = fx.received("node-1").await;
        assert_eq!(received[0].kind(), Some(MessageType::GroupOperation));
        assert_eq!(received[0].data_str("fromId"), Some(SYSTEM_SENDER));
        assert!(fx.store.stored().await.is_empty());
    }

    #[tokio::test]
    async fn message_action_needs_a_target() {
        let fx = fixture();
        fx.online("bob", "node-b").await;
        let _b = fx.bus.subscribe("node-b").await.unwrap();

        let recall = MessageAction {
            message_id: "m-1".into(),
            from_id: "alice".into(),
            to_id: Some("bob".into()),
            group_id: None,
            action_time: 0,
            body: json!({"action": "recall"}),
        };
        let receipt = fx.service.send_message_action(recall.clone()).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("m-1"));
        assert_eq!(fx.received("node-b").await[0].kind(), Some(MessageType::MessageOperation));

        let err = fx
            .service
            .send_message_action(MessageAction {
                to_id: None,
                ..recall
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
    }

    #[tokio::test]
    async fn video_and_force_logout_carry_no_message_id() {
        let fx = fixture();
        fx.online("bob", "node-b").await;
        let _b = fx.bus.subscribe("node-b").await.unwrap();

        let receipt = fx
            .service
            .send_video(VideoSignal {
                from_id: "alice".into(),
                to_id: "bob".into(),
                body: json!({"sdp": "offer"}),
            })
            .await
            .unwrap();
        assert!(receipt.message_id.is_none());

        fx.service.force_logout("bob", Some("ios")).await.unwrap();
        let received = fx.received("node-b").await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kind(), Some(MessageType::VideoMessage));
        assert!(!received[0].metadata.contains_key("messageId"));
        assert_eq!(received[1].kind(), Some(MessageType::ForceLogout));
        assert_eq!(received[1].device_type.as_deref(), Some("ios"));
        assert!(fx.store.stored().await.is_empty());
    }
}
