//! 工具函数模块
//!
//! 时间戳、日期键、TTL 换算等通用工具函数

pub mod helpers;

pub use helpers::ServiceHelper;

use chrono::{DateTime, Utc};

/// 获取当前时间戳（毫秒）
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 按 UTC 日期生成键：`<prefix>YYYY-MM-DD`
pub fn utc_day_key(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}{}", prefix, at.format("%Y-%m-%d"))
}

/// 心跳间隔 + 宽限窗口 换算为秒级 TTL（向上取整，至少 1 秒）
pub fn ttl_seconds(heartbeat_ms: u64, timeout_ms: u64) -> u64 {
    heartbeat_ms.saturating_add(timeout_ms).div_ceil(1000).max(1)
}

/// 空字符串视为缺省
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
