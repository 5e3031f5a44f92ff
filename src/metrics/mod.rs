//! # Prometheus 指标收集模块
//!
//! 为接入节点与路由服务提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 接入节点指标
#[derive(Clone)]
pub struct ConnectMetrics {
    /// 当前活跃连接数
    pub connections_active: IntGauge,
    /// 当前在线用户数（本节点）
    pub online_users: IntGauge,
    /// 认证失败次数
    pub auth_failures_total: IntCounterVec,
    /// 登录次数
    pub logins_total: IntCounterVec,
    /// 被挤下线的会话数
    pub sessions_kicked_total: IntCounter,
    /// 丢弃的帧
    pub frames_dropped_total: IntCounterVec,
    /// 下行投递结果
    pub dispatch_total: IntCounterVec,
    /// 下行投递耗时（秒）
    pub dispatch_duration_seconds: Histogram,
    /// 心跳处理结果
    pub heartbeats_total: IntCounterVec,
}

impl ConnectMetrics {
    pub fn new() -> Self {
        let connections_active = IntGauge::new(
            "connect_connections_active",
            "Number of live client connections on this node",
        )
        .expect("Failed to create connect_connections_active metric");

        let online_users = IntGauge::new(
            "connect_online_users",
            "Number of users with at least one session on this node",
        )
        .expect("Failed to create connect_online_users metric");

        let auth_failures_total = IntCounterVec::new(
            Opts::new(
                "connect_auth_failures_total",
                "Total number of rejected handshakes",
            ),
            &["reason"],
        )
        .expect("Failed to create connect_auth_failures_total metric");

        let logins_total = IntCounterVec::new(
            Opts::new("connect_logins_total", "Total number of login attempts"),
            &["result"],
        )
        .expect("Failed to create connect_logins_total metric");

        let sessions_kicked_total = IntCounter::new(
            "connect_sessions_kicked_total",
            "Total number of sessions evicted by a newer login",
        )
        .expect("Failed to create connect_sessions_kicked_total metric");

        let frames_dropped_total = IntCounterVec::new(
            Opts::new(
                "connect_frames_dropped_total",
                "Total number of inbound frames dropped",
            ),
            &["reason"],
        )
        .expect("Failed to create connect_frames_dropped_total metric");

        let dispatch_total = IntCounterVec::new(
            Opts::new(
                "connect_dispatch_total",
                "Total number of bus deliveries handled by the node dispatcher",
            ),
            &["kind", "result"],
        )
        .expect("Failed to create connect_dispatch_total metric");

        let dispatch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "connect_dispatch_duration_seconds",
                "Bus delivery dispatch duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("Failed to create connect_dispatch_duration_seconds metric");

        let heartbeats_total = IntCounterVec::new(
            Opts::new("connect_heartbeats_total", "Total number of heartbeats"),
            &["result"],
        )
        .expect("Failed to create connect_heartbeats_total metric");

        // 注册指标，忽略重复注册错误（测试中可能会重复创建）
        let _ = REGISTRY.register(Box::new(connections_active.clone()));
        let _ = REGISTRY.register(Box::new(online_users.clone()));
        let _ = REGISTRY.register(Box::new(auth_failures_total.clone()));
        let _ = REGISTRY.register(Box::new(logins_total.clone()));
        let _ = REGISTRY.register(Box::new(sessions_kicked_total.clone()));
        let _ = REGISTRY.register(Box::new(frames_dropped_total.clone()));
        let _ = REGISTRY.register(Box::new(dispatch_total.clone()));
        let _ = REGISTRY.register(Box::new(dispatch_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(heartbeats_total.clone()));

        Self {
            connections_active,
            online_users,
            auth_failures_total,
            logins_total,
            sessions_kicked_total,
            frames_dropped_total,
            dispatch_total,
            dispatch_duration_seconds,
            heartbeats_total,
        }
    }
}

impl Default for ConnectMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 路由服务指标
#[derive(Clone)]
pub struct RouterMetrics {
    /// 发布结果（confirmed / nacked / returned / error）
    pub publish_total: IntCounterVec,
    /// 发布耗时（秒）
    pub publish_duration_seconds: Histogram,
    /// 离线跳过的接收者
    pub recipients_offline_total: IntCounter,
    /// 单次扇出涉及的节点数
    pub fanout_nodes: Histogram,
}

impl RouterMetrics {
    pub fn new() -> Self {
        let publish_total = IntCounterVec::new(
            Opts::new("router_publish_total", "Total number of bus publishes"),
            &["outcome"],
        )
        .expect("Failed to create router_publish_total metric");

        let publish_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "router_publish_duration_seconds",
                "Bus publish confirmation latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .expect("Failed to create router_publish_duration_seconds metric");

        let recipients_offline_total = IntCounter::new(
            "router_recipients_offline_total",
            "Total number of recipients skipped because no presence record exists",
        )
        .expect("Failed to create router_recipients_offline_total metric");

        let fanout_nodes = Histogram::with_opts(
            HistogramOpts::new(
                "router_fanout_nodes",
                "Number of distinct nodes targeted by one send",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .expect("Failed to create router_fanout_nodes metric");

        let _ = REGISTRY.register(Box::new(publish_total.clone()));
        let _ = REGISTRY.register(Box::new(publish_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(recipients_offline_total.clone()));
        let _ = REGISTRY.register(Box::new(fanout_nodes.clone()));

        Self {
            publish_total,
            publish_duration_seconds,
            recipients_offline_total,
            fanout_nodes,
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
