//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建接入节点的全部组件

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_im_core::config::NimbusAppConfig;
use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_im_core::registry::ServiceInstance;
use nimbus_signaling_common::bus::{InMemoryBus, KafkaBusConfig, KafkaMessageBus, MessageBus};
use nimbus_signaling_common::presence::{
    InMemoryPresenceDirectory, PresenceDirectory, RedisPresenceConfig, RedisPresenceDirectory,
};
use tracing::{info, warn};

use crate::application::{ConnectionApplicationService, ConnectionServiceOptions, NodeDispatchService};
use crate::config::ConnectConfig;
use crate::domain::repository::{IdentityValidator, UpstreamForwarder};
use crate::domain::service::{DeviceSessionRegistry, RegistryOptions};
use crate::infrastructure::{
    BusNodeNotifier, BusUpstreamForwarder, JwtTokenService, LoggingUpstreamForwarder,
};
use crate::interface::{AuthGate, ConnectionRuntime, ConnectionSettings, NodeQueueConsumer};

/// 服务发现中的服务类型
pub const SERVICE_TYPE: &str = "nimbus-connect";

/// 外部依赖：在线目录与消息总线
pub struct Infrastructure {
    pub presence: Arc<dyn PresenceDirectory>,
    pub bus: Arc<dyn MessageBus>,
}

impl Infrastructure {
    /// 配置了 Redis / Kafka 时使用真实实现，否则退回内存实现（仅适合单节点）
    pub fn from_config(config: &ConnectConfig) -> Result<Self> {
        let presence: Arc<dyn PresenceDirectory> = match config.redis_url.as_deref() {
            Some(url) => {
                let directory = RedisPresenceDirectory::new(
                    url,
                    RedisPresenceConfig {
                        key_prefix: config.presence_key_prefix.clone(),
                        active_users_prefix: config.active_users_prefix.clone(),
                        op_timeout: Duration::from_millis(config.redis_op_timeout_ms),
                    },
                )
                .context("failed to create redis presence directory")?;
                info!("✅ Redis 在线目录已配置");
                Arc::new(directory)
            }
            None => {
                warn!("Redis not configured, using in-memory presence directory");
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

        Ok(Self { presence, bus })
    }
}

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub config: Arc<ConnectConfig>,
    pub metrics: Arc<ConnectMetrics>,
    pub registry: DeviceSessionRegistry,
    pub presence: Arc<dyn PresenceDirectory>,
    pub bus: Arc<dyn MessageBus>,
    pub connection_service: Arc<ConnectionApplicationService>,
    pub runtime: Arc<ConnectionRuntime>,
    pub consumer: Arc<NodeQueueConsumer>,
}

impl ApplicationContext {
    /// 当前监听端点与连接数
    pub fn service_instance(&self) -> ServiceInstance {
        let mut instance = ServiceInstance::new(SERVICE_TYPE, self.config.broker_id.clone())
            .with_endpoint("tcp", format!("{}:{}", self.config.address, self.config.tcp_port))
            .with_endpoint(
                "ws",
                format!(
                    "{}:{}{}",
                    self.config.address, self.config.ws_port, self.config.ws_path
                ),
            );
        instance.connections = self.registry.session_count() as u64;
        instance
            .metadata
            .insert("protocol".to_string(), self.config.protocol.as_str().to_string());
        instance
    }
}

/// 构建应用上下文
pub async fn initialize(app_config: &NimbusAppConfig) -> Result<ApplicationContext> {
    let config = ConnectConfig::from_app_config(app_config);
    info!(broker_id = %config.broker_id, "开始构建接入节点...");

    let infrastructure = Infrastructure::from_config(&config)?;
    let validator: Arc<dyn IdentityValidator> = Arc::new(JwtTokenService::new(
        &config.token_secret,
        config.token_issuer.clone(),
    ));
    Ok(assemble(config, infrastructure, validator))
}

/// 用给定的外部依赖组装上下文
pub fn assemble(
    config: ConnectConfig,
    infrastructure: Infrastructure,
    validator: Arc<dyn IdentityValidator>,
) -> ApplicationContext {
    let Infrastructure { presence, bus } = infrastructure;
    let metrics = Arc::new(ConnectMetrics::new());

    let registry = DeviceSessionRegistry::with_metrics(
        RegistryOptions {
            multi_device_enabled: config.multi_device_enabled,
            kick_flush_timeout: config.kick_flush_timeout(),
        },
        (*metrics).clone(),
    );

    let upstream: Arc<dyn UpstreamForwarder> = match config.upstream_routing_key.as_deref() {
        Some(routing_key) => {
            info!(routing_key, "✅ 上行消息将转发到总线");
            Arc::new(BusUpstreamForwarder::new(
                bus.clone(),
                routing_key,
                config.broker_id.clone(),
            ))
        }
        None => Arc::new(LoggingUpstreamForwarder),
    };

    let connection_service = Arc::new(
        ConnectionApplicationService::new(
            ConnectionServiceOptions::from_config(&config),
            registry.clone(),
            presence.clone(),
            validator.clone(),
            upstream,
            metrics.clone(),
        )
        .with_notifier(Arc::new(BusNodeNotifier::new(
            bus.clone(),
            config.broker_id.clone(),
        ))),
    );

    let dispatcher = Arc::new(NodeDispatchService::new(registry.clone(), metrics.clone()));
    let consumer = Arc::new(NodeQueueConsumer::new(
        bus.clone(),
        dispatcher,
        config.broker_id.clone(),
        config.error_routing_key.clone(),
    ));

    let gate = Arc::new(AuthGate::new(validator, config.protocol, metrics.clone()));
    let runtime = Arc::new(ConnectionRuntime::new(
        ConnectionSettings::from_config(&config),
        gate,
        connection_service.clone(),
        metrics.clone(),
    ));

    info!("✅ 接入节点组件构建完成");
    ApplicationContext {
        config: Arc::new(config),
        metrics,
        registry,
        presence,
        bus,
        connection_service,
        runtime,
        consumer,
    }
}
