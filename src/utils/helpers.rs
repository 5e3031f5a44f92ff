//! 辅助工具函数模块
//!
//! 提供配置加载、监听地址解析等服务启动辅助函数

use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::config::NimbusAppConfig;

/// 服务启动辅助函数
pub struct ServiceHelper;

impl ServiceHelper {
    /// 加载配置并初始化日志
    ///
    /// 配置路径优先取参数，其次取环境变量 NIMBUS_CONFIG
    pub fn load_config(config_path: Option<&str>) -> &'static NimbusAppConfig {
        let env_path = std::env::var("NIMBUS_CONFIG").ok();
        let path = config_path.or(env_path.as_deref());
        let config = crate::config::load_config(path);
        crate::tracing::init_tracing_from_config(config.logging.as_ref());
        config
    }

    /// 解析监听地址
    ///
    /// # 参数
    /// * `address` - 监听 IP（如 0.0.0.0）
    /// * `port` - 端口
    pub fn parse_listen_addr(address: &str, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", address, port)
            .parse()
            .with_context(|| format!("invalid listen address: {}:{}", address, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addresses() {
        let addr = ServiceHelper::parse_listen_addr("127.0.0.1", 9000).unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(ServiceHelper::parse_listen_addr("not an ip", 9000).is_err());
    }
}
