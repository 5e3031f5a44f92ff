//! Nimbus IM Core 配置模块
//!
//! 该模块提供了完整的应用程序配置管理功能，包括：
//! - 配置文件加载和解析（单文件或目录合并）
//! - 环境特定配置覆盖
//! - 接入节点与路由服务的配置定义

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<NimbusAppConfig> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
    #[serde(default = "default_true")]
    pub with_thread_ids: bool,
    #[serde(default = "default_true")]
    pub with_file: bool,
    #[serde(default = "default_true")]
    pub with_line_number: bool,
    /// 以 JSON 格式输出
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
            with_thread_ids: true,
            with_file: true,
            with_line_number: true,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_true() -> bool {
    true
}

/// Redis 连接配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisPoolConfig {
    /// Redis 服务器地址
    pub url: String,
    /// 命名空间前缀
    #[serde(default)]
    pub namespace: Option<String>,
    /// 数据库编号
    #[serde(default)]
    pub database: Option<u32>,
    /// 单次操作超时（毫秒）
    #[serde(default)]
    pub op_timeout_ms: Option<u64>,
}

/// Kafka 集群配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KafkaClusterConfig {
    /// Kafka 服务器地址列表
    pub bootstrap_servers: String,
    /// 客户端标识
    #[serde(default)]
    pub client_id: Option<String>,
    /// 安全协议
    #[serde(default)]
    pub security_protocol: Option<String>,
    /// SASL 用户名
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL 密码
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// 超时时间（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 其他选项
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// 注册中心类型（目前仅支持 etcd）
    #[serde(default = "default_registry_type")]
    pub registry_type: String,
    pub endpoints: Vec<String>,
    #[serde(default = "default_registry_namespace")]
    pub namespace: String,
    /// 租约 TTL（秒）
    #[serde(default = "default_registry_ttl")]
    pub ttl: i64,
}

fn default_registry_type() -> String {
    "etcd".to_string()
}

fn default_registry_namespace() -> String {
    "nimbus".to_string()
}

fn default_registry_ttl() -> i64 {
    30
}

/// 服务基本信息
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "nimbus-im-core".to_string(),
            version: default_version(),
        }
    }
}

/// 接入节点服务配置
///
/// 所有字段均为可选，缺省值由各服务的 settings 模块决定
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConnectServiceConfig {
    /// 节点标识（即路由键）
    #[serde(default)]
    pub broker_id: Option<String>,
    /// 监听地址
    #[serde(default)]
    pub address: Option<String>,
    /// TCP 端口
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// WebSocket 端口
    #[serde(default)]
    pub ws_port: Option<u16>,
    /// WebSocket 路径
    #[serde(default)]
    pub ws_path: Option<String>,
    /// 首选编码（proto / json）
    #[serde(default)]
    pub protocol: Option<String>,
    /// 心跳间隔（毫秒）
    #[serde(default)]
    pub heartbeat_time_ms: Option<u64>,
    /// 心跳宽限（毫秒）
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 是否允许多设备组同时在线
    #[serde(default)]
    pub multi_device_enabled: Option<bool>,
    /// Redis 配置名称
    #[serde(default)]
    pub redis: Option<String>,
    /// Kafka 配置名称
    #[serde(default)]
    pub kafka: Option<String>,
    /// 消息总线交换机（Kafka 主题前缀）
    #[serde(default)]
    pub exchange: Option<String>,
    /// 错误队列路由键
    #[serde(default)]
    pub error_routing_key: Option<String>,
    /// 上行业务消息路由键
    #[serde(default)]
    pub upstream_routing_key: Option<String>,
    /// 令牌密钥
    #[serde(default)]
    pub token_secret: Option<String>,
    /// 令牌发行方
    #[serde(default)]
    pub token_issuer: Option<String>,
    /// 令牌剩余有效期低于该值（分钟）时提示刷新
    #[serde(default)]
    pub token_refresh_threshold_minutes: Option<i64>,
    /// 在线记录键前缀
    #[serde(default)]
    pub presence_key_prefix: Option<String>,
    /// 日活键前缀
    #[serde(default)]
    pub active_users_prefix: Option<String>,
    /// 单用户最大连接数
    #[serde(default)]
    pub max_connections_per_user: Option<usize>,
    /// 节点最大连接数
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// 限流窗口（毫秒）
    #[serde(default)]
    pub rate_limit_window_ms: Option<u64>,
    /// 窗口内最大消息数
    #[serde(default)]
    pub rate_limit_max_messages: Option<u32>,
    /// 踢下线通知最长等待（毫秒）
    #[serde(default)]
    pub kick_flush_timeout_ms: Option<u64>,
    /// 每条连接的下行队列容量
    #[serde(default)]
    pub outbound_queue_capacity: Option<usize>,
    /// 单次写 socket 超时（毫秒）
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    /// 单帧最大字节数
    #[serde(default)]
    pub max_frame_bytes: Option<usize>,
}

/// 路由服务配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouterServiceConfig {
    /// Redis 配置名称
    #[serde(default)]
    pub redis: Option<String>,
    /// Kafka 配置名称
    #[serde(default)]
    pub kafka: Option<String>,
    /// 消息总线交换机（Kafka 主题前缀）
    #[serde(default)]
    pub exchange: Option<String>,
    /// 在线记录键前缀
    #[serde(default)]
    pub presence_key_prefix: Option<String>,
    /// 投递确认超时（毫秒）
    #[serde(default)]
    pub publish_timeout_ms: Option<u64>,
}

/// 服务配置集合
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub connect: Option<ConnectServiceConfig>,
    #[serde(default)]
    pub router: Option<RouterServiceConfig>,
}

/// Nimbus 应用配置主结构体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NimbusAppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    /// Redis 配置映射
    #[serde(default)]
    pub redis: HashMap<String, RedisPoolConfig>,
    /// Kafka 配置映射
    #[serde(default)]
    pub kafka: HashMap<String, KafkaClusterConfig>,
    #[serde(default)]
    pub services: ServicesConfig,
}

impl NimbusAppConfig {
    /// 获取 Redis 配置
    pub fn redis_profile(&self, name: &str) -> Option<&RedisPoolConfig> {
        self.redis.get(name)
    }

    /// 获取 Kafka 配置
    pub fn kafka_profile(&self, name: &str) -> Option<&KafkaClusterConfig> {
        self.kafka.get(name)
    }

    /// 获取接入节点服务配置
    pub fn connect_service(&self) -> ConnectServiceConfig {
        self.services.connect.clone().unwrap_or_default()
    }

    /// 获取路由服务配置
    pub fn router_service(&self) -> RouterServiceConfig {
        self.services.router.clone().unwrap_or_default()
    }
}

/// 加载配置
///
/// 未指定路径时依次尝试 `config/` 目录与 `config.toml`，全部失败时使用默认配置
pub fn load_config(path: Option<&str>) -> &'static NimbusAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| load_with_fallback(&candidates))
}

/// 获取应用配置（未调用 `load_config` 时返回 None）
pub fn app_config() -> Option<&'static NimbusAppConfig> {
    APP_CONFIG.get()
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> NimbusAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    NimbusAppConfig::default()
}

/// 从源加载配置（文件或目录），并叠加环境配置
pub fn load_config_from_source(path: &Path) -> Result<NimbusAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let mut merged = if metadata.is_dir() {
        load_directory_value(path)?
    } else {
        load_toml_value(path)?
    };

    if let Err(err) = ConfigManager::load_environment_config(&mut merged) {
        warn!("failed to load environment config: {err}");
    }

    merged
        .try_into()
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

/// 从目录加载配置：base.toml + shared/ + services/ + overrides/
fn load_directory_value(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 合并值：表递归合并，其它类型直接覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}
