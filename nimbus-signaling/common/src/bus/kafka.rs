//! Kafka 总线实现
//!
//! 交换机映射为主题前缀：路由键 `k` 对应主题 `<exchange>.<k>`。
//! 节点独占队列即其自身主题，使用节点唯一的消费组；错误队列为 `<exchange>.<error_routing_key>`。
//! 投递报告即确认，投递失败为拒绝，`UnknownTopicOrPartition` / `UnknownTopic` 视为无路由退回
//! （要求 broker 关闭自动建主题）。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_im_core::config::KafkaClusterConfig;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, InfraResultExt, Result, map_infra_error};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{BusDelivery, BusMessage, BusSubscription, MessageBus, PublishOutcome};

/// 已消费消息的位点，用于提交
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KafkaReceipt {
    topic: String,
    partition: i32,
    offset: i64,
}

#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    pub bootstrap_servers: String,
    pub client_id: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// 主题前缀
    pub exchange: String,
    /// 发布确认超时
    pub publish_timeout: Duration,
    pub options: HashMap<String, String>,
}

impl KafkaBusConfig {
    pub fn from_cluster(cluster: &KafkaClusterConfig, exchange: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: cluster.bootstrap_servers.clone(),
            client_id: cluster.client_id.clone(),
            security_protocol: cluster.security_protocol.clone(),
            sasl_username: cluster.sasl_username.clone(),
            sasl_password: cluster.sasl_password.clone(),
            exchange: exchange.into(),
            publish_timeout: Duration::from_millis(cluster.timeout_ms.unwrap_or(5000)),
            options: cluster.options.clone(),
        }
    }

    pub fn topic(&self, routing_key: &str) -> String {
        format!("{}.{}", self.exchange, routing_key)
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        if let Some(protocol) = &self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let (Some(user), Some(pass)) = (&self.sasl_username, &self.sasl_password) {
            config.set("sasl.username", user);
            config.set("sasl.password", pass);
        }
        for (key, value) in &self.options {
            config.set(key, value);
        }
        config
    }
}

/// 记录键固定为路由键（节点 ID），同一节点的消息落在同一分区内保持先后顺序
fn partition_key(message: &BusMessage) -> &str {
    message.routing_key.as_str()
}

/// 将投递错误归类为 拒绝 / 退回
fn classify(err: &KafkaError) -> PublishOutcome {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            PublishOutcome::Returned(err.to_string())
        }
        _ => PublishOutcome::Nacked(err.to_string()),
    }
}

/// Kafka 消息总线
pub struct KafkaMessageBus {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    config: KafkaBusConfig,
}

impl KafkaMessageBus {
    pub fn new(config: KafkaBusConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .client_config()
            .set(
                "message.timeout.ms",
                config.publish_timeout.as_millis().to_string(),
            )
            .create()
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to create kafka producer")?;

        let admin: AdminClient<DefaultClientContext> = config
            .client_config()
            .create()
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to create kafka admin client")?;

        info!(
            bootstrap = %config.bootstrap_servers,
            exchange = %config.exchange,
            "Kafka message bus connected"
        );

        Ok(Self {
            producer,
            admin,
            config,
        })
    }

    /// 声明主题（已存在视为成功）
    async fn declare_topic(&self, topic: &str) -> Result<()> {
        let new_topic = NewTopic::new(topic, 1, TopicReplication::Fixed(1));
        let results = self
            .admin
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to declare kafka topic")?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "kafka topic declared"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "kafka topic already exists")
                }
                Err((name, code)) => {
                    return Err(ErrorBuilder::new(
                        ErrorCode::ServiceUnavailable,
                        "failed to declare kafka topic",
                    )
                    .details(format!("{name}: {code}"))
                    .build_error());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for KafkaMessageBus {
    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome> {
        let topic = self.config.topic(&message.routing_key);

        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&topic)
            .payload(message.payload.as_ref())
            .key(partition_key(&message))
            .headers(headers);

        match self
            .producer
            .send(record, self.config.publish_timeout)
            .await
        {
            Ok(_) => Ok(PublishOutcome::Confirmed),
            Err((err, _)) => {
                let outcome = classify(&err);
                warn!(
                    topic = %topic,
                    correlation_id = ?message.correlation_id,
                    outcome = %outcome,
                    "Kafka publish not confirmed"
                );
                Ok(outcome)
            }
        }
    }

    async fn declare_durable(&self, routing_key: &str) -> Result<()> {
        self.declare_topic(&self.config.topic(routing_key)).await
    }

    async fn subscribe(&self, routing_key: &str) -> Result<Box<dyn BusSubscription>> {
        let topic = self.config.topic(routing_key);
        self.declare_topic(&topic).await?;

        // 消费组按节点唯一，等价于独占队列
        let group = format!("{}-consumer", topic);
        let consumer: StreamConsumer = self
            .config
            .client_config()
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to create kafka consumer")?;

        consumer
            .subscribe(&[topic.as_str()])
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to subscribe kafka topic")?;

        info!(topic = %topic, group = %group, "Subscribed to node queue");

        Ok(Box::new(KafkaSubscription {
            consumer,
            routing_key: routing_key.to_string(),
            topic,
            admin_config: self.config.client_config(),
        }))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
    routing_key: String,
    topic: String,
    admin_config: ClientConfig,
}

#[async_trait]
impl BusSubscription for KafkaSubscription {
    async fn next_delivery(&mut self) -> Option<Result<BusDelivery>> {
        let result = match self.consumer.recv().await {
            Ok(message) => {
                let mut headers = HashMap::new();
                if let Some(borrowed) = message.headers() {
                    for header in borrowed.iter() {
                        if let Some(value) = header.value {
                            headers.insert(
                                header.key.to_string(),
                                String::from_utf8_lossy(value).into_owned(),
                            );
                        }
                    }
                }
                Ok(BusDelivery {
                    routing_key: self.routing_key.clone(),
                    payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                    headers,
                    receipt: Some(KafkaReceipt {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    }),
                })
            }
            Err(err) => Err(map_infra_error(
                err,
                ErrorCode::ServiceUnavailable,
                "failed to receive from kafka",
            )),
        };
        Some(result)
    }

    async fn ack(&mut self, delivery: &BusDelivery) -> Result<()> {
        let Some(receipt) = &delivery.receipt else {
            return Ok(());
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &receipt.topic,
            receipt.partition,
            Offset::Offset(receipt.offset + 1),
        )
        .into_nimbus(ErrorCode::ServiceUnavailable, "failed to build commit offsets")?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to commit kafka offset")
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        // 独占队列随节点下线删除
        let admin: AdminClient<DefaultClientContext> = self
            .admin_config
            .create()
            .into_nimbus(ErrorCode::ServiceUnavailable, "failed to create kafka admin client")?;
        if let Err(err) = admin
            .delete_topics(&[self.topic.as_str()], &AdminOptions::new())
            .await
        {
            warn!(topic = %self.topic, error = %err, "failed to delete node topic");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KafkaBusConfig {
        KafkaBusConfig::from_cluster(
            &KafkaClusterConfig {
                bootstrap_servers: "127.0.0.1:9092".into(),
                timeout_ms: Some(1500),
                ..KafkaClusterConfig::default()
            },
            "im-server",
        )
    }

    #[test]
    fn routing_keys_map_to_prefixed_topics() {
        let cfg = config();
        assert_eq!(cfg.topic("node-a"), "im-server.node-a");
        assert_eq!(cfg.topic("im.error"), "im-server.im.error");
        assert_eq!(cfg.publish_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn records_are_keyed_by_node_not_correlation_id() {
        let first = BusMessage::new("node-a", Bytes::from_static(b"1"))
            .with_correlation_id(Some("m-1".into()));
        let second = BusMessage::new("node-a", Bytes::from_static(b"2"))
            .with_correlation_id(Some("m-2".into()));
        assert_eq!(partition_key(&first), "node-a");
        assert_eq!(partition_key(&first), partition_key(&second));
    }

    #[test]
    fn unknown_topic_is_returned_other_errors_nacked() {
        let unknown = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(matches!(classify(&unknown), PublishOutcome::Returned(_)));

        let timed_out = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(matches!(classify(&timed_out), PublishOutcome::Nacked(_)));
    }
}
