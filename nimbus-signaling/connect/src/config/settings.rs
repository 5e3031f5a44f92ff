use std::time::Duration;

use nimbus_im_core::config::{KafkaClusterConfig, NimbusAppConfig, RedisPoolConfig};
use nimbus_im_core::utils::ttl_seconds;
use nimbus_signaling_common::codec::{DEFAULT_MAX_FRAME_BYTES, Protocol};
use nimbus_signaling_common::presence::{DEFAULT_ACTIVE_USERS_PREFIX, DEFAULT_KEY_PREFIX};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// 节点标识，同时是本节点在总线上的路由键
    pub broker_id: String,
    pub address: String,
    pub tcp_port: u16,
    pub ws_port: u16,
    pub ws_path: String,
    /// 首选编码，另一种作为回退
    pub protocol: Protocol,
    pub heartbeat_time_ms: u64,
    pub timeout_ms: u64,
    /// 关闭时同一用户只保留一个会话（跨设备分组互斥）
    pub multi_device_enabled: bool,
    pub redis_url: Option<String>,
    pub redis_op_timeout_ms: u64,
    pub kafka: Option<KafkaClusterConfig>,
    pub exchange: String,
    pub error_routing_key: String,
    pub upstream_routing_key: Option<String>,
    pub token_secret: String,
    pub token_issuer: Option<String>,
    /// 剩余有效期低于该阈值（分钟）时心跳回复 REFRESH_TOKEN
    pub token_refresh_threshold_minutes: i64,
    pub presence_key_prefix: String,
    pub active_users_prefix: String,
    pub max_connections_per_user: usize,
    pub max_connections: usize,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_messages: u32,
    pub kick_flush_timeout_ms: u64,
    /// 每条连接的下行队列容量，写满后新消息被丢弃
    pub outbound_queue_capacity: usize,
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            broker_id: generate_broker_id(),
            address: "0.0.0.0".to_string(),
            tcp_port: 9000,
            ws_port: 9001,
            ws_path: "/im".to_string(),
            protocol: Protocol::Proto,
            heartbeat_time_ms: 30_000,
            timeout_ms: 5_000,
            multi_device_enabled: false,
            redis_url: None,
            redis_op_timeout_ms: 2_000,
            kafka: None,
            exchange: "im-server".to_string(),
            error_routing_key: "im.error".to_string(),
            upstream_routing_key: None,
            token_secret: "insecure-secret".to_string(),
            token_issuer: None,
            token_refresh_threshold_minutes: 3,
            presence_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            active_users_prefix: DEFAULT_ACTIVE_USERS_PREFIX.to_string(),
            max_connections_per_user: 5,
            max_connections: 10_000,
            rate_limit_window_ms: 1_000,
            rate_limit_max_messages: 20,
            kick_flush_timeout_ms: 500,
            outbound_queue_capacity: 1024,
            write_timeout_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

fn generate_broker_id() -> String {
    format!("connect-{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl ConnectConfig {
    pub fn from_app_config(app: &NimbusAppConfig) -> Self {
        let service = app.connect_service();
        let defaults = Self::default();

        let redis_profile: Option<RedisPoolConfig> = service
            .redis
            .as_deref()
            .and_then(|name| app.redis_profile(name))
            .cloned();

        let kafka = service
            .kafka
            .as_deref()
            .and_then(|name| app.kafka_profile(name))
            .cloned();

        // 节点标识：环境变量优先，其次配置，最后随机生成
        let broker_id = std::env::var("CONNECT_BROKER_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| service.broker_id.clone())
            .unwrap_or(defaults.broker_id);

        let protocol_raw = std::env::var("CONNECT_PROTOCOL")
            .ok()
            .or_else(|| service.protocol.clone());
        let protocol = match protocol_raw.as_deref().map(str::parse::<Protocol>) {
            Some(Ok(protocol)) => protocol,
            Some(Err(err)) => {
                warn!(error = %err, "invalid connect protocol, falling back to proto");
                defaults.protocol
            }
            None => defaults.protocol,
        };

        let redis_url = std::env::var("CONNECT_REDIS_URL")
            .ok()
            .or_else(|| redis_profile.as_ref().map(|p| p.url.clone()));

        let token_secret = std::env::var("CONNECT_TOKEN_SECRET")
            .ok()
            .or_else(|| service.token_secret.clone())
            .unwrap_or(defaults.token_secret);

        let multi_device_enabled = env_parse::<bool>("CONNECT_MULTI_DEVICE_ENABLED")
            .or(service.multi_device_enabled)
            .unwrap_or(defaults.multi_device_enabled);

        Self {
            broker_id,
            address: service.address.unwrap_or(defaults.address),
            tcp_port: env_parse("CONNECT_TCP_PORT")
                .or(service.tcp_port)
                .unwrap_or(defaults.tcp_port),
            ws_port: env_parse("CONNECT_WS_PORT")
                .or(service.ws_port)
                .unwrap_or(defaults.ws_port),
            ws_path: service.ws_path.unwrap_or(defaults.ws_path),
            protocol,
            heartbeat_time_ms: service
                .heartbeat_time_ms
                .unwrap_or(defaults.heartbeat_time_ms),
            timeout_ms: service.timeout_ms.unwrap_or(defaults.timeout_ms),
            multi_device_enabled,
            redis_url,
            redis_op_timeout_ms: redis_profile
                .as_ref()
                .and_then(|p| p.op_timeout_ms)
                .unwrap_or(defaults.redis_op_timeout_ms),
            kafka,
            exchange: service.exchange.unwrap_or(defaults.exchange),
            error_routing_key: service
                .error_routing_key
                .unwrap_or(defaults.error_routing_key),
            upstream_routing_key: service.upstream_routing_key.filter(|k| !k.is_empty()),
            token_secret,
            token_issuer: service.token_issuer,
            token_refresh_threshold_minutes: service
                .token_refresh_threshold_minutes
                .unwrap_or(defaults.token_refresh_threshold_minutes),
            presence_key_prefix: service
                .presence_key_prefix
                .unwrap_or(defaults.presence_key_prefix),
            active_users_prefix: service
                .active_users_prefix
                .unwrap_or(defaults.active_users_prefix),
            max_connections_per_user: service
                .max_connections_per_user
                .unwrap_or(defaults.max_connections_per_user),
            max_connections: service.max_connections.unwrap_or(defaults.max_connections),
            rate_limit_window_ms: service
                .rate_limit_window_ms
                .unwrap_or(defaults.rate_limit_window_ms),
            rate_limit_max_messages: service
                .rate_limit_max_messages
                .unwrap_or(defaults.rate_limit_max_messages),
            kick_flush_timeout_ms: service
                .kick_flush_timeout_ms
                .unwrap_or(defaults.kick_flush_timeout_ms),
            outbound_queue_capacity: service
                .outbound_queue_capacity
                .unwrap_or(defaults.outbound_queue_capacity)
                .max(1),
            write_timeout_ms: service
                .write_timeout_ms
                .unwrap_or(defaults.write_timeout_ms),
            max_frame_bytes: service
                .max_frame_bytes
                .unwrap_or(defaults.max_frame_bytes),
        }
    }

    /// 在线记录 TTL：心跳间隔 + 宽限窗口
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(ttl_seconds(self.heartbeat_time_ms, self.timeout_ms))
    }

    /// 空闲超时：同一窗口内既无读也无写即视为断开
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_time_ms + self.timeout_ms)
    }

    pub fn kick_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.kick_flush_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_im_core::config::{ConnectServiceConfig, ServicesConfig};

    #[test]
    fn defaults_follow_documented_values() {
        let cfg = ConnectConfig::default();
        assert_eq!(cfg.presence_ttl(), Duration::from_secs(35));
        assert_eq!(cfg.idle_timeout(), Duration::from_millis(35_000));
        assert_eq!(cfg.exchange, "im-server");
        assert_eq!(cfg.error_routing_key, "im.error");
        assert!(cfg.broker_id.starts_with("connect-"));
        assert!(!cfg.multi_device_enabled);
    }

    #[test]
    fn resolves_named_profiles() {
        let mut app = NimbusAppConfig::default();
        app.redis.insert(
            "presence".into(),
            RedisPoolConfig {
                url: "redis://10.0.0.5:6379".into(),
                op_timeout_ms: Some(800),
                ..RedisPoolConfig::default()
            },
        );
        app.services = ServicesConfig {
            connect: Some(ConnectServiceConfig {
                broker_id: Some("node-7".into()),
                redis: Some("presence".into()),
                protocol: Some("json".into()),
                heartbeat_time_ms: Some(10_000),
                timeout_ms: Some(2_500),
                upstream_routing_key: Some(String::new()),
                ..ConnectServiceConfig::default()
            }),
            router: None,
        };

        let cfg = ConnectConfig::from_app_config(&app);
        if std::env::var("CONNECT_BROKER_ID").is_err() {
            assert_eq!(cfg.broker_id, "node-7");
        }
        if std::env::var("CONNECT_REDIS_URL").is_err() {
            assert_eq!(cfg.redis_url.as_deref(), Some("redis://10.0.0.5:6379"));
        }
        if std::env::var("CONNECT_PROTOCOL").is_err() {
            assert_eq!(cfg.protocol, Protocol::Json);
        }
        assert_eq!(cfg.redis_op_timeout_ms, 800);
        assert_eq!(cfg.presence_ttl(), Duration::from_secs(13));
        assert!(cfg.upstream_routing_key.is_none());
    }
}
