//! 连接句柄
//!
//! 传输层（TCP / WebSocket）为每个连接创建一个 `ConnectionHandle`，会话表、下行分发与
//! 清理流程只通过它写出消息或关闭连接，不直接接触 socket。

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_signaling_common::codec::Protocol;
use nimbus_signaling_common::{DeviceGroup, Envelope};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 默认写队列容量
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// 写任务消费的指令
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    /// 之前排队的消息全部写出并 flush 后回执
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
}

/// 连接在会话表中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub user_id: String,
    pub device_group: DeviceGroup,
}

pub struct ConnectionHandle {
    id: String,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    protocol: OnceLock<Protocol>,
    binding: OnceLock<SessionBinding>,
    close_watched: AtomicBool,
    cleaned: AtomicBool,
    opened_at: Instant,
    /// 最近一次读写，距 `opened_at` 的毫秒数
    last_activity_ms: AtomicU64,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("binding", &self.binding.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(
        peer: Option<SocketAddr>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4().to_string(),
            peer,
            tx,
            shutdown: CancellationToken::new(),
            protocol: OnceLock::new(),
            binding: OnceLock::new(),
            close_watched: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        };
        (Arc::new(handle), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// 入队一条下行消息，不等待写出
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Outbound::Envelope(envelope))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// 等待此前入队的消息写出，超时或连接已关闭返回 false
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let wait = async {
            self.tx.send(Outbound::Flush(ack_tx)).await.ok()?;
            ack_rx.await.ok()
        };
        matches!(tokio::time::timeout(timeout, wait).await, Ok(Some(())))
    }

    /// 通知传输层关闭连接（可重复调用）
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 关闭信号，供读写循环与关闭回调等待
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 记录首个成功解码帧的协议，下行使用同一协议编码
    pub fn set_protocol(&self, protocol: Protocol) {
        let _ = self.protocol.set(protocol);
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol.get().copied()
    }

    /// 绑定会话位置，只生效一次；返回实际生效的绑定
    pub fn bind(&self, user_id: &str, device_group: DeviceGroup) -> &SessionBinding {
        self.binding.get_or_init(|| SessionBinding {
            user_id: user_id.to_string(),
            device_group,
        })
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.get()
    }

    /// 首次调用返回 true，用于保证关闭回调只注册一次
    pub(crate) fn mark_close_watched(&self) -> bool {
        !self.close_watched.swap(true, Ordering::AcqRel)
    }

    /// 首次调用返回 true，重复清理据此短路
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned.swap(true, Ordering::AcqRel)
    }

    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last_activity(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }
}
