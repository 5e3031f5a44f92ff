//! 单元测试共用的替身

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use nimbus_signaling_common::Envelope;
use nimbus_signaling_common::bus::{BusMessage, BusSubscription, MessageBus, PublishOutcome};
use tokio::sync::mpsc;

use crate::domain::model::{ConnectionHandle, ConnectionIdentity, Outbound};
use crate::domain::repository::{AuthFailure, IdentityValidator, UpstreamForwarder, VerifiedToken};

/// 模拟写任务：收集写出的消息并回执 flush
pub fn recording_connection(capacity: usize) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Envelope>) {
    let (handle, mut rx) = ConnectionHandle::new(None, capacity);
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Envelope(env) => {
                    let _ = written_tx.send(env);
                }
                Outbound::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });
    (handle, written_rx)
}

/// 令牌格式为 `user:<id>`，其他一律视为格式错误；`expired` 视为过期
pub struct StaticValidator {
    pub remaining: Option<Duration>,
}

impl StaticValidator {
    pub fn new(remaining: Duration) -> Self {
        Self {
            remaining: Some(remaining),
        }
    }
}

impl IdentityValidator for StaticValidator {
    fn validate(&self, token: &str) -> std::result::Result<VerifiedToken, AuthFailure> {
        if token.is_empty() {
            return Err(AuthFailure::Missing);
        }
        if token == "expired" {
            return Err(AuthFailure::Expired);
        }
        match token.strip_prefix("user:") {
            Some(user) if !user.is_empty() => Ok(VerifiedToken {
                user_id: user.to_string(),
                expires_at: None,
            }),
            _ => Err(AuthFailure::Malformed),
        }
    }

    fn remaining_validity(&self, _token: &str) -> Option<Duration> {
        self.remaining
    }
}

/// 记录所有上行消息
#[derive(Default)]
pub struct RecordingForwarder {
    pub forwarded: Mutex<Vec<(String, Envelope)>>,
}

impl RecordingForwarder {
    pub fn count(&self) -> usize {
        self.forwarded.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamForwarder for RecordingForwarder {
    async fn forward(&self, identity: &ConnectionIdentity, envelope: Envelope) -> Result<()> {
        if let Ok(mut forwarded) = self.forwarded.lock() {
            forwarded.push((identity.user_id.clone(), envelope));
        }
        Ok(())
    }
}

/// 发布永不返回确认的总线，模拟 broker 卡死
#[derive(Default)]
pub struct StalledBus;

#[async_trait]
impl MessageBus for StalledBus {
    async fn publish(&self, _message: BusMessage) -> Result<PublishOutcome> {
        std::future::pending().await
    }

    async fn declare_durable(&self, _routing_key: &str) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> Result<Box<dyn BusSubscription>> {
        Err(ErrorBuilder::new(ErrorCode::ServiceUnavailable, "stalled bus cannot subscribe")
            .details(routing_key)
            .build_error())
    }
}
