//! 服务注册发现模块
//!
//! 接入节点把自身的监听端点与实时连接数注册到 etcd（带租约），
//! 上游网关据此做负载感知的路由。未配置注册中心时使用 `NoopRegistrar`。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, PutOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{ErrorCode, Result, map_infra_error};

/// 服务实例信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_type: String,
    pub instance_id: String,
    /// 监听端点，如 `tcp -> 10.0.0.1:9000`
    pub endpoints: HashMap<String, String>,
    /// 实时连接数
    pub connections: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(service_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            instance_id: instance_id.into(),
            endpoints: HashMap::new(),
            connections: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, addr: impl Into<String>) -> Self {
        self.endpoints.insert(name.into(), addr.into());
        self
    }

    /// 注册键：`/{namespace}/services/{service_type}/{instance_id}`
    pub fn registry_key(&self, namespace: &str) -> String {
        format!(
            "/{}/services/{}/{}",
            namespace.trim_matches('/'),
            self.service_type,
            self.instance_id
        )
    }
}

/// 服务注册器
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    /// 注册实例
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// 更新实例信息（连接数等），沿用已有租约
    async fn update(&self, instance: &ServiceInstance) -> Result<()>;

    /// 注销实例
    async fn deregister(&self) -> Result<()>;
}

/// 空实现：未配置注册中心时使用
#[derive(Debug, Default)]
pub struct NoopRegistrar;

#[async_trait]
impl ServiceRegistrar for NoopRegistrar {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        debug!(
            instance_id = %instance.instance_id,
            "service registry not configured, skipping registration"
        );
        Ok(())
    }

    async fn update(&self, _instance: &ServiceInstance) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        Ok(())
    }
}

struct Registration {
    key: String,
    lease_id: i64,
    keepalive: JoinHandle<()>,
}

/// 基于 etcd 租约的注册器
pub struct EtcdRegistrar {
    client: Client,
    namespace: String,
    ttl: i64,
    registration: Mutex<Option<Registration>>,
}

impl EtcdRegistrar {
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let client = Client::connect(config.endpoints.clone(), None)
            .await
            .map_err(|err| {
                map_infra_error(
                    err,
                    ErrorCode::ServiceUnavailable,
                    "failed to connect to etcd",
                )
            })?;

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            ttl: config.ttl.max(5),
            registration: Mutex::new(None),
        })
    }

    async fn put(&self, key: &str, instance: &ServiceInstance, lease_id: i64) -> Result<()> {
        let value = serde_json::to_string(instance).map_err(|err| {
            map_infra_error(
                err,
                ErrorCode::SerializationFailed,
                "failed to serialize service instance",
            )
        })?;

        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|err| {
                map_infra_error(
                    err,
                    ErrorCode::ServiceUnavailable,
                    "failed to write service instance",
                )
            })?;
        Ok(())
    }

    fn spawn_keepalive(&self, lease_id: i64) -> JoinHandle<()> {
        let mut client = self.client.clone();
        let interval = std::time::Duration::from_secs((self.ttl / 3).max(1) as u64);

        tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(lease_id, error = %err, "failed to start etcd lease keepalive");
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease_id, error = %err, "etcd lease keepalive failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(lease_id, "etcd lease keepalive stream closed");
                        break;
                    }
                    Err(err) => {
                        warn!(lease_id, error = %err, "etcd lease keepalive response error");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ServiceRegistrar for EtcdRegistrar {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(self.ttl, None).await.map_err(|err| {
            map_infra_error(
                err,
                ErrorCode::ServiceUnavailable,
                "failed to grant etcd lease",
            )
        })?;
        let lease_id = lease.id();
        let key = instance.registry_key(&self.namespace);

        self.put(&key, instance, lease_id).await?;
        let keepalive = self.spawn_keepalive(lease_id);

        let mut guard = self.registration.lock().await;
        if let Some(previous) = guard.replace(Registration {
            key: key.clone(),
            lease_id,
            keepalive,
        }) {
            previous.keepalive.abort();
        }

        info!(key = %key, lease_id, "service registered");
        Ok(())
    }

    async fn update(&self, instance: &ServiceInstance) -> Result<()> {
        let guard = self.registration.lock().await;
        match guard.as_ref() {
            Some(reg) => self.put(&reg.key, instance, reg.lease_id).await,
            None => Err(map_infra_error(
                "instance not registered",
                ErrorCode::InvalidParameter,
                "cannot update an unregistered service instance",
            )),
        }
    }

    async fn deregister(&self) -> Result<()> {
        let Some(reg) = self.registration.lock().await.take() else {
            return Ok(());
        };
        reg.keepalive.abort();

        let mut client = self.client.clone();
        if let Err(err) = client.lease_revoke(reg.lease_id).await {
            warn!(key = %reg.key, error = %err, "failed to revoke etcd lease");
        }
        info!(key = %reg.key, "service deregistered");
        Ok(())
    }
}

/// 根据配置创建注册器并注册实例
///
/// 未配置或类型不支持时返回 `NoopRegistrar`
pub async fn register_service(
    config: Option<&RegistryConfig>,
    instance: &ServiceInstance,
) -> Result<Arc<dyn ServiceRegistrar>> {
    let registrar: Arc<dyn ServiceRegistrar> = match config {
        Some(cfg) if cfg.registry_type.eq_ignore_ascii_case("etcd") => {
            Arc::new(EtcdRegistrar::connect(cfg).await?)
        }
        Some(cfg) => {
            warn!(registry_type = %cfg.registry_type, "unsupported registry type, skipping registration");
            Arc::new(NoopRegistrar)
        }
        None => {
            info!("Service registry not configured, skipping registration");
            Arc::new(NoopRegistrar)
        }
    };

    registrar.register(instance).await?;
    Ok(registrar)
}
