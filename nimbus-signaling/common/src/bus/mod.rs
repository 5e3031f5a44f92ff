//! 消息总线
//!
//! 语义对齐“交换机 + 路由键 + 队列”模型：按路由键发布、每个节点独占一个以自身 id 命名的队列、
//! 共享一个持久化错误队列。发布需要确认，结果为 确认 / 拒绝 / 无路由退回 三种之一。

mod kafka;
mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_im_core::error::Result;

pub use kafka::{KafkaBusConfig, KafkaMessageBus};
pub use memory::InMemoryBus;

/// 重投标记头
pub const HEADER_REDELIVERED: &str = "x-redelivered";
/// 错误描述头（死信）
pub const HEADER_ERROR: &str = "x-error";
/// 关联 id 头（业务消息 id）
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";

/// 发布结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 总线已确认
    Confirmed,
    /// 总线拒绝
    Nacked(String),
    /// 路由键没有绑定任何队列
    Returned(String),
}

impl PublishOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PublishOutcome::Confirmed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Confirmed => "confirmed",
            PublishOutcome::Nacked(_) => "nacked",
            PublishOutcome::Returned(_) => "returned",
        }
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Confirmed => f.write_str("confirmed"),
            PublishOutcome::Nacked(reason) => write!(f, "nacked: {reason}"),
            PublishOutcome::Returned(reason) => write!(f, "returned: {reason}"),
        }
    }
}

/// 待发布的消息
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub routing_key: String,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn new(routing_key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            correlation_id: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        if let Some(id) = &correlation_id {
            self.headers
                .insert(HEADER_CORRELATION_ID.to_string(), id.clone());
        }
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// 消费到的消息
#[derive(Debug, Clone, PartialEq)]
pub struct BusDelivery {
    pub routing_key: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub(crate) receipt: Option<kafka::KafkaReceipt>,
}

impl BusDelivery {
    pub fn new(routing_key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            headers: HashMap::new(),
            receipt: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 是否为重投的消息
    pub fn redelivered(&self) -> bool {
        self.headers
            .get(HEADER_REDELIVERED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl From<BusMessage> for BusDelivery {
    fn from(message: BusMessage) -> Self {
        Self {
            routing_key: message.routing_key,
            payload: message.payload,
            headers: message.headers,
            receipt: None,
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布并等待确认
    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome>;

    /// 声明持久化队列（如错误队列），无消费者时也保留消息
    async fn declare_durable(&self, routing_key: &str) -> Result<()>;

    /// 以独占方式消费某个路由键对应的队列
    async fn subscribe(&self, routing_key: &str) -> Result<Box<dyn BusSubscription>>;
}

#[async_trait]
pub trait BusSubscription: Send {
    /// 下一条消息，队列关闭时返回 None
    async fn next_delivery(&mut self) -> Option<Result<BusDelivery>>;

    /// 确认消息
    async fn ack(&mut self, delivery: &BusDelivery) -> Result<()>;

    /// 关闭订阅（独占队列随之删除）
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
