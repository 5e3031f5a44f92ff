//! 投递台账：记录未被总线确认的发布，供调用方对账与重试

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// 一次失败的节点发布
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub broker_id: String,
    pub user_ids: Vec<String>,
    /// nacked / returned / error / timeout
    pub outcome: &'static str,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 按消息 ID 归集的失败记录
///
/// 路由层只记录不重试，重试策略属于调用方。
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    failures: DashMap<String, Vec<DeliveryFailure>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message_id: &str, failure: DeliveryFailure) {
        self.failures
            .entry(message_id.to_string())
            .or_default()
            .push(failure);
    }

    pub fn failures(&self, message_id: &str) -> Vec<DeliveryFailure> {
        self.failures
            .get(message_id)
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// 取出并清除，调用方处理完（重发或标记失败）后调用
    pub fn take(&self, message_id: &str) -> Vec<DeliveryFailure> {
        self.failures
            .remove(message_id)
            .map(|(_, f)| f)
            .unwrap_or_default()
    }

    pub fn pending_messages(&self) -> Vec<String> {
        self.failures.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(broker: &str) -> DeliveryFailure {
        DeliveryFailure {
            broker_id: broker.to_string(),
            user_ids: vec!["u1".into()],
            outcome: "returned",
            reason: "NO_ROUTE".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn failures_are_grouped_by_message() {
        let ledger = DeliveryLedger::new();
        ledger.record("m-1", failure("node-a"));
        ledger.record("m-1", failure("node-b"));
        ledger.record("m-2", failure("node-a"));

        assert_eq!(ledger.failures("m-1").len(), 2);
        let mut pending = ledger.pending_messages();
        pending.sort();
        assert_eq!(pending, vec!["m-1".to_string(), "m-2".to_string()]);

        assert_eq!(ledger.take("m-1").len(), 2);
        assert!(ledger.failures("m-1").is_empty());
        assert!(!ledger.is_empty());
    }
}
