//! Wire 风格的依赖注入模块
//!
//! 业务服务进程内嵌路由时使用：在线目录与总线必须与接入节点指向同一套 Redis / Kafka。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_im_core::config::NimbusAppConfig;
use nimbus_im_core::metrics::RouterMetrics;
use nimbus_signaling_common::bus::{InMemoryBus, KafkaBusConfig, KafkaMessageBus, MessageBus};
use nimbus_signaling_common::presence::{
    InMemoryPresenceDirectory, PresenceDirectory, RedisPresenceConfig, RedisPresenceDirectory,
};
use tracing::{info, warn};

use crate::application::DeliveryService;
use crate::config::RouterConfig;
use crate::domain::model::DeliveryLedger;
use crate::domain::repository::MessageStore;
use crate::domain::service::MessageBusRouter;

/// 路由上下文
pub struct RouterContext {
    pub config: Arc<RouterConfig>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub bus: Arc<dyn MessageBus>,
    pub ledger: Arc<DeliveryLedger>,
    pub router: Arc<MessageBusRouter>,
    pub delivery: Arc<DeliveryService>,
}

impl RouterContext {
    /// 按应用配置构建；`store` 由宿主业务服务提供
    pub fn initialize(app_config: &NimbusAppConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        let config = RouterConfig::from_app_config(app_config);

        let presence: Arc<dyn PresenceDirectory> = match config.redis_url.as_deref() {
            Some(url) => {
                let directory = RedisPresenceDirectory::new(
                    url,
                    RedisPresenceConfig {
                        key_prefix: config.presence_key_prefix.clone(),
                        op_timeout: Duration::from_millis(config.redis_op_timeout_ms),
                        ..RedisPresenceConfig::default()
                    },
                )
                .context("failed to create redis presence directory")?;
                info!("✅ Redis 在线目录已配置");
                Arc::new(directory)
            }
            None => {
                warn!("Redis not configured, router sees an empty presence directory");
                Arc::new(InMemoryPresenceDirectory::new())
            }
        };

        let bus: Arc<dyn MessageBus> = match config.kafka.as_ref() {
            Some(cluster) => {
                let bus = KafkaMessageBus::new(KafkaBusConfig::from_cluster(
                    cluster,
                    config.exchange.clone(),
                ))
                .context("failed to create kafka message bus")?;
                info!("✅ Kafka 消息总线已配置");
                Arc::new(bus)
            }
            None => {
                warn!("Kafka not configured, using in-memory message bus");
                Arc::new(InMemoryBus::new())
            }
        };

        Ok(Self::assemble(config, presence, bus, store))
    }

    /// 用现成的在线目录与总线组装，测试与单进程部署共用
    pub fn assemble(
        config: RouterConfig,
        presence: Arc<dyn PresenceDirectory>,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let ledger = Arc::new(DeliveryLedger::new());
        let router = Arc::new(MessageBusRouter::new(
            presence.clone(),
            bus.clone(),
            ledger.clone(),
            config.publish_timeout(),
            RouterMetrics::new(),
        ));
        let delivery = Arc::new(DeliveryService::new(store, router.clone()));
        info!(exchange = %config.exchange, "✅ 消息路由创建完成");

        Self {
            config: Arc::new(config),
            presence,
            bus,
            ledger,
            router,
            delivery,
        }
    }
}
