//! 启动信息展示

use std::net::SocketAddr;

use tracing::info;

/// 启动信息展示器
pub struct StartupInfo {
    pub broker_id: String,
    pub tcp_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub ws_path: String,
    pub protocol: &'static str,
    pub multi_device_enabled: bool,
}

impl StartupInfo {
    /// 打印启动信息
    pub fn print(&self) {
        info!("");
        info!("╔════════════════════════════════════════════════════════════════╗");
        info!("║          Nimbus Connect 接入节点启动成功                       ║");
        info!("╚════════════════════════════════════════════════════════════════╝");
        info!("");

        info!("📋 节点信息:");
        info!("   Broker ID:  {}", self.broker_id);
        info!("   首选编码:   {}", self.protocol);
        info!(
            "   多设备:     {}",
            if self.multi_device_enabled { "开启" } else { "关闭（单设备登录）" }
        );
        info!("");

        info!("🌐 长连接服务 (客户端连接):");
        info!("   TCP:        {} (4 字节长度前缀分帧)", self.tcp_addr);
        info!("   WebSocket:  ws://{}{}", self.ws_addr, self.ws_path);
        info!("");

        info!("📨 消息总线:");
        info!("   节点队列:   {}", self.broker_id);
        info!("");

        info!("✅ 所有服务已就绪，等待客户端连接...");
        info!("");
    }
}
