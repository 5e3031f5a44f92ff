//! 配置管理器 - 负责处理不同环境下的配置选择和覆盖
//!
//! - 根据环境变量选择 Redis / Kafka 配置
//! - 加载环境特定配置并合并

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;

use super::{KafkaClusterConfig, NimbusAppConfig, RedisPoolConfig, merge_value};

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 选择 Redis 配置
    ///
    /// 优先级：环境变量 NIMBUS_REDIS_PROFILE > 配置文件中指定的名称
    pub fn select_redis_config(
        config: &NimbusAppConfig,
        profile_name: &str,
    ) -> Option<RedisPoolConfig> {
        if let Ok(env_profile) = env::var("NIMBUS_REDIS_PROFILE") {
            if let Some(redis) = config.redis_profile(&env_profile) {
                return Some(redis.clone());
            }
        }

        config.redis_profile(profile_name).cloned()
    }

    /// 选择 Kafka 配置
    ///
    /// 优先级：环境变量 NIMBUS_KAFKA_PROFILE > 配置文件中指定的名称
    pub fn select_kafka_config(
        config: &NimbusAppConfig,
        profile_name: &str,
    ) -> Option<KafkaClusterConfig> {
        if let Ok(env_profile) = env::var("NIMBUS_KAFKA_PROFILE") {
            if let Some(kafka) = config.kafka_profile(&env_profile) {
                return Some(kafka.clone());
            }
        }

        config.kafka_profile(profile_name).cloned()
    }

    /// 获取当前环境名称（NIMBUS_ENV，默认 development）
    pub fn get_environment() -> String {
        env::var("NIMBUS_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 加载 config/environments/{environment}.toml 并合并到基础配置
    pub fn load_environment_config(base: &mut Value) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env);

        if Path::new(&env_config_path).exists() {
            let content = fs::read_to_string(&env_config_path)
                .with_context(|| format!("无法读取环境配置文件: {}", env_config_path))?;
            let overlay: Value = toml::from_str(&content)
                .with_context(|| format!("无效的环境配置格式: {}", env_config_path))?;

            merge_value(base, overlay);
        }

        Ok(())
    }
}
