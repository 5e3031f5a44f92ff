//! # 日志初始化模块
//!
//! 为各个服务提供统一的 tracing 日志初始化能力。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// # 参数
/// * `logging_config` - 日志配置（可选），如果为 None 则使用默认配置（debug 级别）
///
/// # 示例
/// ```rust,ignore
/// use nimbus_im_core::config::LoggingConfig;
///
/// init_tracing_from_config(None);
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json: true,
///     ..LoggingConfig::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    // 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
    let env_filter = build_env_filter(logging_config);

    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    // 重复初始化（如测试中）时忽略错误
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn build_env_filter(logging_config: Option<&LoggingConfig>) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level_str = logging_config.map(|c| c.level.as_str()).unwrap_or("debug");
            EnvFilter::try_new(level_str).unwrap_or_else(|_| EnvFilter::new("info"))
        }
    }
}
