use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, InfraResultExt, Result};
use nimbus_im_core::utils::utc_day_key;
use redis::{AsyncCommands, RedisResult, Script, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::{
    ACTIVE_USERS_RETENTION, DEFAULT_ACTIVE_USERS_PREFIX, DEFAULT_KEY_PREFIX, PresenceDirectory,
    ttl_secs,
};
use crate::models::{PresenceRecord, PresenceUpdate};

/// 仅当记录的 brokerId 与调用方一致时续期
const RENEW_IF_OWNED: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, record = pcall(cjson.decode, raw)
if not ok or type(record) ~= 'table' or record['brokerId'] ~= ARGV[1] then return 0 end
return redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
"#;

/// 仅当记录的 brokerId 与调用方一致时删除
const DELETE_IF_OWNED: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, record = pcall(cjson.decode, raw)
if not ok or type(record) ~= 'table' or record['brokerId'] ~= ARGV[1] then return 0 end
return redis.call('DEL', KEYS[1])
"#;

#[derive(Debug, Clone)]
pub struct RedisPresenceConfig {
    pub key_prefix: String,
    pub active_users_prefix: String,
    /// 单次操作超时，连接不可用时快速失败
    pub op_timeout: Duration,
}

impl Default for RedisPresenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            active_users_prefix: DEFAULT_ACTIVE_USERS_PREFIX.to_string(),
            op_timeout: Duration::from_millis(2000),
        }
    }
}

/// Redis 在线目录
///
/// 连接由 `ConnectionManager` 维护，断线后自动重连；每次操作受 `op_timeout` 约束。
pub struct RedisPresenceDirectory {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    config: RedisPresenceConfig,
    renew_script: Script,
    delete_script: Script,
}

impl RedisPresenceDirectory {
    pub fn new(url: &str, config: RedisPresenceConfig) -> Result<Self> {
        let client =
            redis::Client::open(url).into_nimbus(ErrorCode::ConfigurationError, "invalid redis url")?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            config,
            renew_script: Script::new(RENEW_IF_OWNED),
            delete_script: Script::new(DELETE_IF_OWNED),
        })
    }

    fn presence_key(&self, user_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, user_id)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .run("connect", async {
                self.conn
                    .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
                    .await
                    .cloned()
            })
            .await?;
        Ok(conn)
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                Err(err).into_nimbus(ErrorCode::ServiceUnavailable, &format!("redis {op} failed"))
            }
            Err(_) => Err(ErrorBuilder::new(ErrorCode::Timeout, format!("redis {op} timed out"))
                .details(format!("{:?}", self.config.op_timeout))
                .build_error()),
        }
    }

    fn decode(payload: &str) -> Result<PresenceRecord> {
        serde_json::from_str(payload)
            .into_nimbus(ErrorCode::SerializationFailed, "failed to decode presence record")
    }

    fn with_pttl(mut record: PresenceRecord, pttl_ms: i64) -> PresenceRecord {
        record.expires_at = (pttl_ms > 0).then(|| Utc::now() + chrono::Duration::milliseconds(pttl_ms));
        record
    }
}

#[async_trait]
impl PresenceDirectory for RedisPresenceDirectory {
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let mut conn = self.connection().await?;
        let key = self.presence_key(user_id);
        let (payload, pttl): (Option<String>, i64) = self
            .run("get", redis::pipe().get(&key).pttl(&key).query_async(&mut conn))
            .await?;

        match payload {
            Some(payload) => Ok(Some(Self::with_pttl(Self::decode(&payload)?, pttl))),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(user_id = %update.user_id, broker_id = %update.broker_id))]
    async fn upsert(&self, update: &PresenceUpdate, ttl: Duration) -> Result<PresenceRecord> {
        let mut conn = self.connection().await?;
        let key = self.presence_key(&update.user_id);

        let existing: Option<String> = self.run("get", conn.get(&key)).await?;
        let record = match existing.as_deref().map(Self::decode) {
            Some(Ok(mut record)) => {
                record.apply(update);
                record
            }
            Some(Err(err)) => {
                debug!(error = %err, "overwriting undecodable presence record");
                update.clone().into_record()
            }
            None => update.clone().into_record(),
        };

        let payload = serde_json::to_string(&record)
            .into_nimbus(ErrorCode::SerializationFailed, "failed to encode presence record")?;
        let secs = ttl_secs(ttl);
        let _: () = self.run("set", conn.set_ex(&key, payload, secs)).await?;

        Ok(Self::with_pttl(record, (secs * 1000) as i64))
    }

    #[instrument(skip_all, fields(user_id = %user_id, broker_id = %broker_id))]
    async fn renew_ttl(&self, user_id: &str, broker_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let key = self.presence_key(user_id);
        let renewed: i64 = self
            .run(
                "renew",
                self.renew_script
                    .key(&key)
                    .arg(broker_id)
                    .arg(ttl_secs(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(renewed == 1)
    }

    #[instrument(skip_all, fields(user_id = %user_id, broker_id = %broker_id))]
    async fn delete_if_owned(&self, user_id: &str, broker_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let key = self.presence_key(user_id);
        let deleted: i64 = self
            .run(
                "delete",
                self.delete_script
                    .key(&key)
                    .arg(broker_id)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn record_active_user(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = utc_day_key(&self.config.active_users_prefix, at);
        let _: () = self
            .run(
                "pfadd",
                redis::pipe()
                    .pfadd(&key, user_id)
                    .ignore()
                    .expire(&key, ACTIVE_USERS_RETENTION.as_secs() as i64)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}
