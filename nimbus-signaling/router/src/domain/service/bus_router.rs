//! 消息总线路由（发布侧）
//!
//! 查询在线目录，把接收者按所属节点分组，每个节点发布一次，
//! 路由键即节点的 brokerId。离线用户直接跳过。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_im_core::metrics::RouterMetrics;
use nimbus_signaling_common::bus::{BusMessage, MessageBus, PublishOutcome};
use nimbus_signaling_common::codec::{EnvelopeCodec, JsonCodec};
use nimbus_signaling_common::presence::PresenceDirectory;
use nimbus_signaling_common::{Envelope, metadata_keys};
use tracing::{debug, instrument, warn};

use crate::domain::model::{DeliveryFailure, DeliveryLedger};

/// 对单个节点的一次发布
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePublish {
    pub broker_id: String,
    pub user_ids: Vec<String>,
    /// confirmed / nacked / returned / error / timeout
    pub outcome: &'static str,
}

impl NodePublish {
    pub fn is_confirmed(&self) -> bool {
        self.outcome == "confirmed"
    }
}

/// 一次扇出的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub publishes: Vec<NodePublish>,
    /// 没有在线记录的用户
    pub offline: Vec<String>,
    /// 在线目录查询失败的用户，未投递
    pub unresolved: Vec<String>,
}

impl RouteReport {
    pub fn all_confirmed(&self) -> bool {
        self.publishes.iter().all(NodePublish::is_confirmed)
    }

    pub fn delivered_users(&self) -> impl Iterator<Item = &str> {
        self.publishes
            .iter()
            .filter(|p| p.is_confirmed())
            .flat_map(|p| p.user_ids.iter().map(String::as_str))
    }
}

pub struct MessageBusRouter {
    presence: Arc<dyn PresenceDirectory>,
    bus: Arc<dyn MessageBus>,
    ledger: Arc<DeliveryLedger>,
    publish_timeout: Duration,
    metrics: RouterMetrics,
}

impl MessageBusRouter {
    pub fn new(
        presence: Arc<dyn PresenceDirectory>,
        bus: Arc<dyn MessageBus>,
        ledger: Arc<DeliveryLedger>,
        publish_timeout: Duration,
        metrics: RouterMetrics,
    ) -> Self {
        Self {
            presence,
            bus,
            ledger,
            publish_timeout,
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<DeliveryLedger> {
        &self.ledger
    }

    /// 按节点分组发布 `template`，每组的 `ids` 替换为该节点上的用户子集
    ///
    /// 未确认的发布按 `message_id` 记入台账，不自动重试。
    #[instrument(skip_all, fields(code = template.code, recipients = user_ids.len(), message_id = ?message_id))]
    pub async fn send_to_users(
        &self,
        template: &Envelope,
        user_ids: &[String],
        message_id: Option<&str>,
    ) -> Result<RouteReport> {
        let mut report = RouteReport::default();
        let groups = self.resolve(user_ids, &mut report).await;
        self.metrics.fanout_nodes.observe(groups.len() as f64);

        let publishes = groups.into_iter().map(|(broker_id, ids)| async move {
            let outcome = self.publish(template, &broker_id, &ids, message_id).await;
            (broker_id, ids, outcome)
        });
        for (broker_id, ids, outcome) in join_all(publishes).await {
            let (label, reason) = match outcome {
                Ok(PublishOutcome::Confirmed) => ("confirmed", None),
                Ok(other) => (other.label(), Some(other.to_string())),
                Err(err) => {
                    let label = if err.code() == ErrorCode::Timeout { "timeout" } else { "error" };
                    (label, Some(err.to_string()))
                }
            };
            self.metrics.publish_total.with_label_values(&[label]).inc();

            if let Some(reason) = reason {
                warn!(broker_id = %broker_id, outcome = label, %reason, "Publish not confirmed");
                if let Some(message_id) = message_id {
                    self.ledger.record(
                        message_id,
                        DeliveryFailure {
                            broker_id: broker_id.clone(),
                            user_ids: ids.clone(),
                            outcome: label,
                            reason,
                            at: Utc::now(),
                        },
                    );
                }
            }
            report.publishes.push(NodePublish {
                broker_id,
                user_ids: ids,
                outcome: label,
            });
        }

        debug!(
            nodes = report.publishes.len(),
            offline = report.offline.len(),
            unresolved = report.unresolved.len(),
            "Fan-out finished"
        );
        Ok(report)
    }

    /// 并发查询在线目录，按节点分组；重复的接收者只计一次
    async fn resolve(
        &self,
        user_ids: &[String],
        report: &mut RouteReport,
    ) -> BTreeMap<String, Vec<String>> {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let unique = user_ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()));

        let lookups =
            unique.map(|user_id| async move { (user_id, self.presence.get(user_id).await) });

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (user_id, lookup) in join_all(lookups).await {
            match lookup {
                Ok(Some(record)) if !record.broker_id.is_empty() => {
                    groups.entry(record.broker_id).or_default().push(user_id.clone());
                }
                Ok(_) => {
                    self.metrics.recipients_offline_total.inc();
                    report.offline.push(user_id.clone());
                }
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "Presence lookup failed, recipient skipped");
                    report.unresolved.push(user_id.clone());
                }
            }
        }
        groups
    }

    async fn publish(
        &self,
        template: &Envelope,
        broker_id: &str,
        ids: &[String],
        message_id: Option<&str>,
    ) -> Result<PublishOutcome> {
        let mut envelope = template.with_ids(ids.to_vec());
        if let Some(message_id) = message_id {
            envelope
                .metadata
                .insert(metadata_keys::MESSAGE_ID.to_string(), message_id.to_string());
        }
        let payload = JsonCodec.encode(&envelope).map_err(|err| {
            ErrorBuilder::new(ErrorCode::SerializationFailed, "failed to encode envelope")
                .details(err.to_string())
                .build_error()
        })?;
        let message = BusMessage::new(broker_id, payload)
            .with_correlation_id(message_id.map(str::to_string));

        let started = Instant::now();
        let result = tokio::time::timeout(self.publish_timeout, self.bus.publish(message)).await;
        self.metrics
            .publish_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ErrorBuilder::new(ErrorCode::Timeout, "publish confirmation timed out")
                .details(format!("{broker_id} after {:?}", self.publish_timeout))
                .build_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nimbus_signaling_common::bus::InMemoryBus;
    use nimbus_signaling_common::presence::InMemoryPresenceDirectory;
    use nimbus_signaling_common::{DeviceGroup, DriverInfo, MessageType, PresenceUpdate};

    async fn online(presence: &InMemoryPresenceDirectory, user_id: &str, broker_id: &str) {
        presence
            .upsert(
                &PresenceUpdate {
                    user_id: user_id.to_string(),
                    broker_id: broker_id.to_string(),
                    token: None,
                    device_group: DeviceGroup::Web,
                    driver: DriverInfo::default(),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
    }

    fn router(presence: Arc<dyn PresenceDirectory>, bus: Arc<dyn MessageBus>) -> MessageBusRouter {
        MessageBusRouter::new(
            presence,
            bus,
            Arc::new(DeliveryLedger::new()),
            Duration::from_secs(1),
            RouterMetrics::new(),
        )
    }

    fn ids(users: &[&str]) -> Vec<String> {
        users.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn publishes_once_per_node_with_node_subset() {
        let presence = Arc::new(InMemoryPresenceDirectory::new());
        online(&presence, "u1", "node-a").await;
        online(&presence, "u2", "node-b").await;
        online(&presence, "u3", "node-a").await;
        let bus = Arc::new(InMemoryBus::new());
        let _a = bus.subscribe("node-a").await.unwrap();
        let _b = bus.subscribe("node-b").await.unwrap();

        let router = router(presence, bus.clone());
        let template = Envelope::builder(MessageType::GroupMessage).message("hi").build();
        let report = router
            .send_to_users(&template, &ids(&["u1", "u2", "u3", "ghost", "u1"]), Some("m-1"))
            .await
            .unwrap();

        assert_eq!(report.publishes.len(), 2);
        assert!(report.all_confirmed());
        assert_eq!(report.offline, ids(&["ghost"]));

        let to_a = bus.published_to("node-a").await;
        assert_eq!(to_a.len(), 1);
        let envelope = JsonCodec.decode(&to_a[0].payload).into_envelope().unwrap();
        assert_eq!(envelope.ids, ids(&["u1", "u3"]));
        assert_eq!(envelope.metadata.get("messageId").map(String::as_str), Some("m-1"));
        assert_eq!(to_a[0].headers.get("x-correlation-id").map(String::as_str), Some("m-1"));

        let to_b = bus.published_to("node-b").await;
        let envelope = JsonCodec.decode(&to_b[0].payload).into_envelope().unwrap();
        assert_eq!(envelope.ids, ids(&["u2"]));
    }

    #[tokio::test]
    async fn offline_recipients_never_publish() {
        let bus = Arc::new(InMemoryBus::new());
        let router = router(Arc::new(InMemoryPresenceDirectory::new()), bus.clone());
        let template = Envelope::builder(MessageType::SingleMessage).build();
        let report = router
            .send_to_users(&template, &ids(&["u1", "u2"]), Some("m-1"))
            .await
            .unwrap();
        assert!(report.publishes.is_empty());
        assert_eq!(report.offline.len(), 2);
        assert!(bus.published().await.is_empty());
        assert!(router.ledger().is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_publishes_land_in_ledger() {
        let presence = Arc::new(InMemoryPresenceDirectory::new());
        online(&presence, "u1", "node-gone").await;
        online(&presence, "u2", "node-b").await;
        let bus = Arc::new(InMemoryBus::new());
        let _b = bus.subscribe("node-b").await.unwrap();
        bus.nack_routing_key("node-b", "broker overloaded");

        let router = router(presence, bus.clone());
        let template = Envelope::builder(MessageType::SingleMessage).build();
        let report = router
            .send_to_users(&template, &ids(&["u1", "u2"]), Some("m-9"))
            .await
            .unwrap();

        assert!(!report.all_confirmed());
        assert_eq!(report.delivered_users().count(), 0);
        let mut outcomes: Vec<_> = router
            .ledger()
            .failures("m-9")
            .into_iter()
            .map(|f| (f.broker_id, f.outcome))
            .collect();
        outcomes.sort();
        assert_eq!(
            outcomes,
            vec![("node-b".to_string(), "nacked"), ("node-gone".to_string(), "returned")]
        );
        // 不自动重试
        assert_eq!(bus.published().await.len(), 2);
    }

    struct StalledBus;

    #[async_trait]
    impl MessageBus for StalledBus {
        async fn publish(&self, _message: BusMessage) -> Result<PublishOutcome> {
            std::future::pending().await
        }

        async fn declare_durable(&self, _routing_key: &str) -> Result<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _routing_key: &str,
        ) -> Result<Box<dyn nimbus_signaling_common::bus::BusSubscription>> {
            Err(ErrorBuilder::new(ErrorCode::ServiceUnavailable, "unsupported").build_error())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_confirmation_times_out() {
        let presence = Arc::new(InMemoryPresenceDirectory::new());
        online(&presence, "u1", "node-a").await;
        let router = router(presence, Arc::new(StalledBus));

        let template = Envelope::builder(MessageType::SingleMessage).build();
        let report = router
            .send_to_users(&template, &ids(&["u1"]), Some("m-3"))
            .await
            .unwrap();
        assert_eq!(report.publishes[0].outcome, "timeout");
        assert_eq!(router.ledger().failures("m-3")[0].outcome, "timeout");
    }
}
