use std::sync::Arc;
use std::time::Duration;

use nimbus_im_core::error::Result;
use nimbus_signaling_common::bus::{
    BusDelivery, BusMessage, BusSubscription, HEADER_ERROR, HEADER_REDELIVERED, MessageBus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::{DispatchOutcome, NodeDispatchService};

/// 重试后仍失败、或无法处理的消息转入共享错误队列
pub struct NodeQueueConsumer {
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<NodeDispatchService>,
    broker_id: String,
    error_routing_key: String,
}

impl NodeQueueConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<NodeDispatchService>,
        broker_id: impl Into<String>,
        error_routing_key: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            dispatcher,
            broker_id: broker_id.into(),
            error_routing_key: error_routing_key.into(),
        }
    }

    /// 声明错误队列并订阅本节点独占队列，订阅成功后才能对外宣称在线
    pub async fn subscribe(&self) -> Result<Box<dyn BusSubscription>> {
        self.bus.declare_durable(&self.error_routing_key).await?;
        let subscription = self.bus.subscribe(&self.broker_id).await?;
        info!(
            queue = %self.broker_id,
            error_queue = %self.error_routing_key,
            "Node queue subscribed"
        );
        Ok(subscription)
    }

    pub async fn run(
        &self,
        mut subscription: Box<dyn BusSubscription>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut consecutive_errors = 0u32;
        let mut last_error_time: Option<std::time::Instant> = None;
        let mut message_count = 0u64;

        info!(queue = %self.broker_id, "Node queue consumer started, waiting for messages...");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(queue = %self.broker_id, message_count, "Node queue consumer stopping");
                    break;
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    consecutive_errors = 0;
                    last_error_time = None;
                    message_count += 1;

                    self.handle(&delivery).await;
                    if let Err(err) = subscription.ack(&delivery).await {
                        warn!(?err, queue = %self.broker_id, "failed to ack delivery");
                    }
                }
                Some(Err(err)) => {
                    consecutive_errors += 1;
                    let now = std::time::Instant::now();

                    if consecutive_errors == 1
                        || last_error_time.is_none_or(|t| now.duration_since(t).as_secs() >= 5)
                    {
                        error!(
                            ?err,
                            consecutive_errors,
                            queue = %self.broker_id,
                            "error receiving from node queue"
                        );
                        last_error_time = Some(now);
                    }

                    // 根据连续错误次数调整重试间隔
                    let retry_delay = if consecutive_errors < 10 {
                        Duration::from_millis(100)
                    } else if consecutive_errors < 50 {
                        Duration::from_millis(1000)
                    } else {
                        Duration::from_secs(5)
                    };
                    tokio::time::sleep(retry_delay).await;
                }
                None => {
                    warn!(queue = %self.broker_id, "Node queue closed by the bus");
                    break;
                }
            }
        }

        if let Err(err) = subscription.close().await {
            warn!(?err, queue = %self.broker_id, "failed to close node queue subscription");
        }
        Ok(())
    }

    /// 处理一条消息并决定去向：确认、重投一次或转入错误队列
    pub async fn handle(&self, delivery: &BusDelivery) -> DispatchOutcome {
        let outcome = self.dispatcher.dispatch(&delivery.payload);
        match &outcome {
            DispatchOutcome::Delivered { sessions } => {
                debug!(sessions, "Delivery dispatched");
            }
            DispatchOutcome::Failed(reason) if !delivery.redelivered() => {
                self.requeue(delivery, reason).await;
            }
            DispatchOutcome::Failed(reason) | DispatchOutcome::Rejected(reason) => {
                self.dead_letter(delivery, reason).await;
            }
        }
        outcome
    }

    async fn requeue(&self, delivery: &BusDelivery, reason: &str) {
        let message = copy_of(delivery, &self.broker_id).with_header(HEADER_REDELIVERED, "true");
        match self.bus.publish(message).await {
            Ok(outcome) if outcome.is_confirmed() => {
                debug!(%reason, "Delivery requeued once");
            }
            Ok(outcome) => {
                warn!(%reason, %outcome, "Requeue not confirmed, dead-lettering");
                self.dead_letter(delivery, reason).await;
            }
            Err(err) => {
                warn!(?err, %reason, "Requeue failed, dead-lettering");
                self.dead_letter(delivery, reason).await;
            }
        }
    }

    async fn dead_letter(&self, delivery: &BusDelivery, reason: &str) {
        let message = copy_of(delivery, &self.error_routing_key).with_header(HEADER_ERROR, reason);
        match self.bus.publish(message).await {
            Ok(outcome) if outcome.is_confirmed() => {
                warn!(%reason, error_queue = %self.error_routing_key, "Delivery dead-lettered");
            }
            Ok(outcome) => {
                error!(%reason, %outcome, "Dead-letter publish not confirmed, delivery dropped");
            }
            Err(err) => {
                error!(?err, %reason, "Dead-letter publish failed, delivery dropped");
            }
        }
    }
}

fn copy_of(delivery: &BusDelivery, routing_key: &str) -> BusMessage {
    delivery
        .headers
        .iter()
        .fold(
            BusMessage::new(routing_key, delivery.payload.clone()),
            |message, (key, value)| message.with_header(key.clone(), value.clone()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ConnectionHandle;
    use crate::domain::service::{DeviceSessionRegistry, RegistryOptions};
    use crate::test_support::recording_connection;
    use bytes::Bytes;
    use nimbus_im_core::metrics::ConnectMetrics;
    use nimbus_signaling_common::bus::InMemoryBus;
    use nimbus_signaling_common::codec::{EnvelopeCodec, JsonCodec};
    use nimbus_signaling_common::{Envelope, MessageType};

    fn consumer(bus: Arc<InMemoryBus>) -> (DeviceSessionRegistry, NodeQueueConsumer) {
        let registry = DeviceSessionRegistry::new(RegistryOptions::default());
        let dispatcher = Arc::new(NodeDispatchService::new(
            registry.clone(),
            Arc::new(ConnectMetrics::new()),
        ));
        (registry, NodeQueueConsumer::new(bus, dispatcher, "node-a", "im.error"))
    }

    fn message_for(user: &str) -> Bytes {
        let env = Envelope::builder(MessageType::SingleMessage)
            .ids(vec![user.to_string()])
            .message("hello")
            .build();
        JsonCodec.encode(&env).unwrap()
    }

    #[tokio::test]
    async fn poison_message_is_dead_lettered() {
        let bus = Arc::new(InMemoryBus::new());
        let (_registry, consumer) = consumer(bus.clone());
        let _subscription = consumer.subscribe().await.unwrap();

        let delivery = BusDelivery::new("node-a", Bytes::from_static(b"\x00garbage"));
        assert!(matches!(
            consumer.handle(&delivery).await,
            DispatchOutcome::Rejected(_)
        ));

        let parked = bus.parked("im.error");
        assert_eq!(parked.len(), 1);
        assert!(parked[0].header(HEADER_ERROR).is_some());
        assert!(bus.published_to("node-a").await.is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_is_requeued_once_then_dead_lettered() {
        let bus = Arc::new(InMemoryBus::new());
        let (registry, consumer) = consumer(bus.clone());
        let _subscription = consumer.subscribe().await.unwrap();

        // 没有写任务的连接：容量 1，第二条起队列满
        let (conn, _rx) = ConnectionHandle::new(None, 1);
        registry.add_session("u1", conn, None);
        consumer
            .handle(&BusDelivery::new("node-a", message_for("u1")))
            .await;

        let first = BusDelivery::new("node-a", message_for("u1"));
        assert!(matches!(consumer.handle(&first).await, DispatchOutcome::Failed(_)));
        let requeued = bus.published_to("node-a").await;
        assert_eq!(requeued.len(), 1);
        assert_eq!(
            requeued[0].headers.get(HEADER_REDELIVERED).map(String::as_str),
            Some("true")
        );
        assert!(bus.parked("im.error").is_empty());

        let second = BusDelivery::new("node-a", message_for("u1")).with_header(HEADER_REDELIVERED, "true");
        consumer.handle(&second).await;
        assert_eq!(bus.parked("im.error").len(), 1);
    }

    #[tokio::test]
    async fn run_loop_delivers_and_stops_on_shutdown() {
        let bus = Arc::new(InMemoryBus::new());
        let (registry, consumer) = consumer(bus.clone());
        let (conn, mut written) = recording_connection(16);
        registry.add_session("u1", conn, None);

        let subscription = consumer.subscribe().await.unwrap();
        let shutdown = CancellationToken::new();
        let runner = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(subscription, shutdown).await })
        };

        let outcome = bus
            .publish(BusMessage::new("node-a", message_for("u1")))
            .await
            .unwrap();
        assert!(outcome.is_confirmed());
        let received = tokio::time::timeout(Duration::from_secs(1), written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message.as_deref(), Some("hello"));

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }
}
