//! 连接数与消息速率限制

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use super::session_registry::AdmissionSnapshot;

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    UserLimit { limit: usize },
    NodeLimit { limit: usize },
}

impl LimitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }

    pub fn reason(self) -> &'static str {
        match self {
            LimitDecision::Allowed => "allowed",
            LimitDecision::UserLimit { .. } => "user connection limit reached",
            LimitDecision::NodeLimit { .. } => "node connection limit reached",
        }
    }
}

/// 单用户 / 单节点最大会话数
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimiter {
    max_per_user: usize,
    max_total: usize,
}

impl ConnectionLimiter {
    pub fn new(max_per_user: usize, max_total: usize) -> Self {
        Self {
            max_per_user,
            max_total,
        }
    }

    /// 只替换已有会话的登录不会增加会话数，总是放行
    pub fn check(&self, user_id: &str, snapshot: AdmissionSnapshot) -> LimitDecision {
        if snapshot.replaces_existing {
            return LimitDecision::Allowed;
        }
        if snapshot.node_sessions >= self.max_total {
            warn!(limit = self.max_total, "node connection limit reached");
            return LimitDecision::NodeLimit {
                limit: self.max_total,
            };
        }
        if snapshot.user_sessions >= self.max_per_user {
            warn!(user_id = %user_id, limit = self.max_per_user, "user connection limit reached");
            return LimitDecision::UserLimit {
                limit: self.max_per_user,
            };
        }
        LimitDecision::Allowed
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// 按用户的固定窗口消息计数
pub struct MessageRateLimiter {
    window: Duration,
    max_messages: u32,
    windows: DashMap<String, Window>,
}

impl MessageRateLimiter {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        Self {
            window,
            max_messages,
            windows: DashMap::new(),
        }
    }

    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut window = self.windows.entry(user_id.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max_messages {
            warn!(
                user_id = %user_id,
                count = window.count,
                limit = self.max_messages,
                "message rate limit exceeded"
            );
            return false;
        }
        window.count += 1;
        true
    }

    /// 用户在本节点完全下线时释放计数窗口
    pub fn forget(&self, user_id: &str) {
        self.windows.remove(user_id);
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}
