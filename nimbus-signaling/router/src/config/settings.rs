use std::time::Duration;

use nimbus_im_core::config::{KafkaClusterConfig, NimbusAppConfig};
use nimbus_signaling_common::presence::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub redis_url: Option<String>,
    pub redis_op_timeout_ms: u64,
    pub kafka: Option<KafkaClusterConfig>,
    /// 与接入节点一致的交换机（Kafka 主题前缀）
    pub exchange: String,
    pub presence_key_prefix: String,
    /// 单次发布等待确认的上限，超时记为失败
    pub publish_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_op_timeout_ms: 2_000,
            kafka: None,
            exchange: "im-server".to_string(),
            presence_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            publish_timeout_ms: 5_000,
        }
    }
}

impl RouterConfig {
    pub fn from_app_config(app: &NimbusAppConfig) -> Self {
        let service = app.router_service();
        let defaults = Self::default();

        let redis_profile = service
            .redis
            .as_deref()
            .and_then(|name| app.redis_profile(name));
        let kafka = service
            .kafka
            .as_deref()
            .and_then(|name| app.kafka_profile(name))
            .cloned();

        Self {
            redis_url: std::env::var("ROUTER_REDIS_URL")
                .ok()
                .or_else(|| redis_profile.map(|p| p.url.clone())),
            redis_op_timeout_ms: redis_profile
                .and_then(|p| p.op_timeout_ms)
                .unwrap_or(defaults.redis_op_timeout_ms),
            kafka,
            exchange: service.exchange.unwrap_or(defaults.exchange),
            presence_key_prefix: service
                .presence_key_prefix
                .unwrap_or(defaults.presence_key_prefix),
            publish_timeout_ms: service
                .publish_timeout_ms
                .unwrap_or(defaults.publish_timeout_ms),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_im_core::config::{RedisPoolConfig, RouterServiceConfig, ServicesConfig};

    #[test]
    fn resolves_router_section() {
        let mut app = NimbusAppConfig::default();
        app.redis.insert(
            "presence".into(),
            RedisPoolConfig {
                url: "redis://10.0.0.9:6379".into(),
                ..RedisPoolConfig::default()
            },
        );
        app.services = ServicesConfig {
            connect: None,
            router: Some(RouterServiceConfig {
                redis: Some("presence".into()),
                exchange: Some("im-test".into()),
                publish_timeout_ms: Some(750),
                ..RouterServiceConfig::default()
            }),
        };

        let cfg = RouterConfig::from_app_config(&app);
        if std::env::var("ROUTER_REDIS_URL").is_err() {
            assert_eq!(cfg.redis_url.as_deref(), Some("redis://10.0.0.9:6379"));
        }
        assert_eq!(cfg.exchange, "im-test");
        assert_eq!(cfg.publish_timeout(), Duration::from_millis(750));
        assert_eq!(cfg.presence_key_prefix, DEFAULT_KEY_PREFIX);
        assert!(cfg.kafka.is_none());
    }
}
