use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use tokio::sync::{Mutex, mpsc};

use super::{BusDelivery, BusMessage, BusSubscription, MessageBus, PublishOutcome};

/// 内存消息总线
///
/// 与真实总线语义一致：未绑定的路由键退回（Returned），独占队列在消费者断开后自动删除，
/// 持久化队列在无消费者时暂存消息。额外记录所有发布，供测试断言。
#[derive(Default)]
pub struct InMemoryBus {
    queues: DashMap<String, mpsc::UnboundedSender<BusDelivery>>,
    durable: DashMap<String, VecDeque<BusDelivery>>,
    nacks: DashMap<String, String>,
    published: Mutex<Vec<BusMessage>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让发往某路由键的消息被拒绝
    pub fn nack_routing_key(&self, routing_key: &str, reason: &str) {
        self.nacks
            .insert(routing_key.to_string(), reason.to_string());
    }

    /// 全部已发布的消息（含被拒绝 / 退回的）
    pub async fn published(&self) -> Vec<BusMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, routing_key: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// 持久化队列中暂存（尚未被消费）的消息
    pub fn parked(&self, routing_key: &str) -> Vec<BusDelivery> {
        self.durable
            .get(routing_key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome> {
        self.published.lock().await.push(message.clone());

        if let Some(reason) = self.nacks.get(&message.routing_key) {
            return Ok(PublishOutcome::Nacked(reason.clone()));
        }

        let routing_key = message.routing_key.clone();
        let delivery = BusDelivery::from(message);

        let delivery = match self.queues.get(&routing_key) {
            Some(tx) => match tx.send(delivery) {
                Ok(()) => return Ok(PublishOutcome::Confirmed),
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };
        // 消费者已断开的独占队列视为已删除
        self.queues.remove_if(&routing_key, |_, tx| tx.is_closed());

        if let Some(mut parked) = self.durable.get_mut(&routing_key) {
            parked.push_back(delivery);
            return Ok(PublishOutcome::Confirmed);
        }

        Ok(PublishOutcome::Returned(format!(
            "NO_ROUTE: routing key {routing_key} is not bound"
        )))
    }

    async fn declare_durable(&self, routing_key: &str) -> Result<()> {
        self.durable.entry(routing_key.to_string()).or_default();
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> Result<Box<dyn BusSubscription>> {
        let (tx, rx) = mpsc::unbounded_channel();

        match self.queues.entry(routing_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return Err(ErrorBuilder::new(
                        ErrorCode::InvalidParameter,
                        "queue already has an exclusive consumer",
                    )
                    .details(routing_key.to_string())
                    .build_error());
                }
                occupied.insert(tx.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(tx.clone());
            }
        }

        if let Some(mut parked) = self.durable.get_mut(routing_key) {
            for delivery in parked.drain(..) {
                let _ = tx.send(delivery);
            }
        }

        Ok(Box::new(InMemorySubscription { rx }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<BusDelivery>,
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<BusDelivery>> {
        self.rx.recv().await.map(Ok)
    }

    async fn ack(&mut self, _delivery: &BusDelivery) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}
