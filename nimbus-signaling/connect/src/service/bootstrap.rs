//! 应用启动器 - 负责依赖注入和服务启动

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_im_core::ServiceHelper;
use nimbus_im_core::config::NimbusAppConfig;
use nimbus_im_core::registry::{ServiceRegistrar, register_service};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::startup::StartupInfo;
use super::wire::{self, ApplicationContext};
use crate::interface::{TcpSignalingServer, WebSocketSignalingServer};

/// 连接数上报间隔
const REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(config_path: Option<&str>) -> Result<()> {
        let app_config = ServiceHelper::load_config(config_path);

        info!("开始创建应用上下文...");
        let context = match Self::create_context(app_config).await {
            Ok(ctx) => {
                info!("✅ 应用上下文创建成功");
                ctx
            }
            Err(e) => {
                error!(error = %e, "❌ 应用上下文创建失败");
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("收到停机信号，开始优雅停机..."),
                Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
            }
            signal.cancel();
        });

        Self::serve(app_config, context, shutdown).await
    }

    /// 创建应用上下文
    pub async fn create_context(config: &NimbusAppConfig) -> Result<ApplicationContext> {
        let context = wire::initialize(config).await?;
        info!("✅ 应用上下文创建完成");
        Ok(context)
    }

    /// 启动监听与消费，直到 `shutdown` 被触发
    ///
    /// 顺序：订阅节点队列 → 绑定端口 → 注册到服务发现。任一步失败都不会对外宣称在线。
    pub async fn serve(
        app_config: &NimbusAppConfig,
        context: ApplicationContext,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let config = context.config.clone();

        let subscription = context
            .consumer
            .subscribe()
            .await
            .context("failed to subscribe node queue")?;

        let tcp_addr = ServiceHelper::parse_listen_addr(&config.address, config.tcp_port)?;
        let ws_addr = ServiceHelper::parse_listen_addr(&config.address, config.ws_port)?;
        let tcp_listener = TcpSignalingServer::bind(tcp_addr).await?;
        let ws_listener = WebSocketSignalingServer::bind(ws_addr).await?;

        let registrar = register_service(app_config.registry.as_ref(), &context.service_instance())
            .await
            .context("failed to register service instance")?;

        StartupInfo {
            broker_id: config.broker_id.clone(),
            tcp_addr: tcp_listener.local_addr().unwrap_or(tcp_addr),
            ws_addr: ws_listener.local_addr().unwrap_or(ws_addr),
            ws_path: config.ws_path.clone(),
            protocol: config.protocol.as_str(),
            multi_device_enabled: config.multi_device_enabled,
        }
        .print();

        let mut tasks = JoinSet::new();

        let tcp = TcpSignalingServer::new(context.runtime.clone());
        let token = shutdown.clone();
        tasks.spawn(async move { ("tcp-server", tcp.serve(tcp_listener, token).await) });

        let ws = WebSocketSignalingServer::new(context.runtime.clone(), config.ws_path.clone());
        let token = shutdown.clone();
        tasks.spawn(async move { ("ws-server", ws.serve(ws_listener, token).await) });

        let consumer = context.consumer.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { ("node-consumer", consumer.run(subscription, token).await) });

        let refresher = spawn_registry_refresher(&context, registrar.clone(), shutdown.clone());

        // 任一核心任务退出即整体停机
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(task = name, "service task stopped"),
                Ok((name, Err(err))) => error!(task = name, error = %err, "❌ service task failed"),
                Err(err) => error!(error = %err, "❌ service task panicked"),
            }
            shutdown.cancel();
        }

        refresher.abort();
        if let Err(err) = registrar.deregister().await {
            warn!(error = %err, "failed to deregister service instance");
        }
        info!(
            sessions = context.registry.session_count(),
            "✅ 接入节点已停止"
        );
        Ok(())
    }
}

fn spawn_registry_refresher(
    context: &ApplicationContext,
    registrar: Arc<dyn ServiceRegistrar>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let registry = context.registry.clone();
    let mut instance = context.service_instance();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REGISTRY_REFRESH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let connections = registry.session_count() as u64;
                    if connections == instance.connections {
                        continue;
                    }
                    instance.connections = connections;
                    match registrar.update(&instance).await {
                        Ok(()) => debug!(connections, "service instance refreshed"),
                        Err(err) => warn!(error = %err, "failed to refresh service instance"),
                    }
                }
            }
        }
    })
}
