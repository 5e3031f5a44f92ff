//! Nimbus IM Core 公共库
//!
//! 提供统一的配置加载、错误类型、日志、指标和服务注册发现功能

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod tracing;
pub mod utils;

pub use config::{
    ConfigManager, ConnectServiceConfig, KafkaClusterConfig, LoggingConfig, NimbusAppConfig,
    RedisPoolConfig, RegistryConfig, RouterServiceConfig, app_config, load_config,
};
pub use error::*;
pub use registry::{NoopRegistrar, ServiceInstance, ServiceRegistrar, register_service};
pub use utils::*;
