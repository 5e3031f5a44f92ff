use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // 配置路径：第一个参数，其次环境变量 NIMBUS_CONFIG
    let config_path = std::env::args().nth(1);
    nimbus_signaling_connect::ApplicationBootstrap::run(config_path.as_deref()).await
}
