//! 连接生命周期应用服务
//!
//! 编排登录、心跳、上行转发、登出与断线清理：会话表、在线目录、令牌校验与限流在这里汇合。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_signaling_common::presence::PresenceDirectory;
use nimbus_signaling_common::{
    DeviceGroup, DriverInfo, Envelope, EnvelopeBuilder, MessageType, PresenceRecord,
    PresenceUpdate, metadata_keys,
};
use tracing::{Instrument, debug, info, instrument, warn};

use crate::config::ConnectConfig;
use crate::domain::model::{ConnectionHandle, ConnectionIdentity, Session};
use crate::domain::repository::{IdentityValidator, NodeNotifier, UpstreamForwarder};
use crate::domain::service::{
    ConnectionLimiter, DeviceSessionRegistry, LimitDecision, MessageRateLimiter,
};

#[derive(Debug, Clone)]
pub struct ConnectionServiceOptions {
    pub broker_id: String,
    pub presence_ttl: Duration,
    /// 剩余有效期不超过该值时心跳回复 REFRESH_TOKEN
    pub refresh_threshold: Duration,
    pub multi_device_enabled: bool,
    pub max_connections_per_user: usize,
    pub max_connections: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max_messages: u32,
}

impl ConnectionServiceOptions {
    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            broker_id: config.broker_id.clone(),
            presence_ttl: config.presence_ttl(),
            refresh_threshold: Duration::from_secs(
                config.token_refresh_threshold_minutes.max(0) as u64 * 60,
            ),
            multi_device_enabled: config.multi_device_enabled,
            max_connections_per_user: config.max_connections_per_user,
            max_connections: config.max_connections,
            rate_limit_window: Duration::from_millis(config.rate_limit_window_ms),
            rate_limit_max_messages: config.rate_limit_max_messages,
        }
    }
}

/// 登录结果
#[derive(Debug)]
pub enum LoginOutcome {
    Accepted(Session),
    /// 超出连接数限制，已回复 CONNECTION_LIMITED
    Limited(LimitDecision),
    /// 在线目录不可用，未登记任何状态
    Unavailable,
}

/// 连接管理应用服务
pub struct ConnectionApplicationService {
    options: ConnectionServiceOptions,
    registry: DeviceSessionRegistry,
    presence: Arc<dyn PresenceDirectory>,
    validator: Arc<dyn IdentityValidator>,
    upstream: Arc<dyn UpstreamForwarder>,
    notifier: Option<Arc<dyn NodeNotifier>>,
    limiter: ConnectionLimiter,
    rate_limiter: MessageRateLimiter,
    metrics: Arc<ConnectMetrics>,
}

impl ConnectionApplicationService {
    pub fn new(
        options: ConnectionServiceOptions,
        registry: DeviceSessionRegistry,
        presence: Arc<dyn PresenceDirectory>,
        validator: Arc<dyn IdentityValidator>,
        upstream: Arc<dyn UpstreamForwarder>,
        metrics: Arc<ConnectMetrics>,
    ) -> Self {
        let limiter = ConnectionLimiter::new(options.max_connections_per_user, options.max_connections);
        let rate_limiter =
            MessageRateLimiter::new(options.rate_limit_window, options.rate_limit_max_messages);
        Self {
            options,
            registry,
            presence,
            validator,
            upstream,
            notifier: None,
            limiter,
            rate_limiter,
            metrics,
        }
    }

    /// 用于让其他节点上的冲突会话下线
    pub fn with_notifier(mut self, notifier: Arc<dyn NodeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &DeviceSessionRegistry {
        &self.registry
    }

    pub fn validator(&self) -> &Arc<dyn IdentityValidator> {
        &self.validator
    }

    pub fn broker_id(&self) -> &str {
        &self.options.broker_id
    }

    /// 处理登录
    ///
    /// 流程：
    /// 1. 连接数准入
    /// 2. 写在线目录（失败则不登记本地会话）
    /// 3. 登记会话并驱逐冲突会话
    /// 4. 回复 LOGIN_SUCCESS
    /// 5. 旧记录属于其他节点时在后台通知其下线冲突分组，记录日活
    #[instrument(skip_all, fields(user_id = %identity.user_id, session_id = %handle.id()))]
    pub async fn login(
        &self,
        identity: &ConnectionIdentity,
        handle: &Arc<ConnectionHandle>,
        request: &Envelope,
    ) -> LoginOutcome {
        let user_id = identity.user_id.as_str();
        let device_type = identity
            .resolve_device_type(request.device_type.as_deref())
            .map(str::to_string);
        let group = handle
            .binding()
            .map(|b| b.device_group)
            .unwrap_or_else(|| DeviceGroup::from_device_type(device_type.as_deref()));

        let decision = self
            .limiter
            .check(user_id, self.registry.admission(user_id, group, handle));
        if !decision.is_allowed() {
            self.metrics.logins_total.with_label_values(&["limited"]).inc();
            self.reply(
                handle,
                Envelope::builder(MessageType::ConnectionLimited)
                    .request_id(request.request_id.clone())
                    .message(decision.reason())
                    .build(),
            );
            return LoginOutcome::Limited(decision);
        }

        let previous = match self.presence.get(user_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(?err, user_id = %user_id, "Failed to read previous presence record");
                None
            }
        };

        let token = request
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| identity.token.clone());
        let update = PresenceUpdate {
            user_id: user_id.to_string(),
            broker_id: self.options.broker_id.clone(),
            token: Some(token),
            device_group: group,
            driver: DriverInfo {
                request_id: request.request_id.clone(),
                device_type: device_type.clone(),
            },
        };
        if let Err(err) = self.presence.upsert(&update, self.options.presence_ttl).await {
            warn!(?err, user_id = %user_id, "Failed to register presence, login rejected");
            self.metrics.logins_total.with_label_values(&["unavailable"]).inc();
            self.reply(
                handle,
                Envelope::builder(MessageType::NotLoggedIn)
                    .request_id(request.request_id.clone())
                    .metadata(metadata_keys::ERROR, "presence unavailable")
                    .message("login failed, please retry")
                    .build(),
            );
            return LoginOutcome::Unavailable;
        }

        let outcome = self
            .registry
            .add_session(user_id, handle.clone(), device_type.as_deref());

        let reply = with_device(
            Envelope::builder(MessageType::LoginSuccess)
                .request_id(request.request_id.clone())
                .metadata(metadata_keys::PLATFORM, outcome.session.device_group.as_str())
                .metadata(metadata_keys::BROKER_ID, self.options.broker_id.clone())
                .message("login success"),
            device_type.as_deref(),
        );
        self.reply(handle, reply.build());

        let remote = previous.filter(|r| !r.is_owned_by(&self.options.broker_id));
        if let (Some(notifier), Some(previous)) = (self.notifier.clone(), remote) {
            tokio::spawn(
                evict_remote(
                    notifier,
                    previous,
                    outcome.session.device_group,
                    self.options.multi_device_enabled,
                )
                .in_current_span(),
            );
        }

        if let Err(err) = self.presence.record_active_user(user_id, Utc::now()).await {
            debug!(?err, user_id = %user_id, "Failed to record daily active user");
        }

        self.metrics.logins_total.with_label_values(&["success"]).inc();
        info!(
            user_id = %user_id,
            device_group = %outcome.session.device_group,
            evicted = outcome.evicted.len(),
            "User logged in"
        );
        LoginOutcome::Accepted(outcome.session)
    }

    /// 处理心跳：回复并续期在线记录，返回回复的消息类型
    #[instrument(skip_all, fields(user_id = %identity.user_id, session_id = %handle.id()))]
    pub async fn heartbeat(
        &self,
        identity: &ConnectionIdentity,
        handle: &Arc<ConnectionHandle>,
        request: &Envelope,
    ) -> MessageType {
        let token = request
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&identity.token);
        let refresh = self
            .validator
            .remaining_validity(token)
            .is_some_and(|remaining| remaining <= self.options.refresh_threshold);
        let kind = if refresh {
            MessageType::RefreshToken
        } else {
            MessageType::HeartBeatSuccess
        };

        let device_type = identity.resolve_device_type(request.device_type.as_deref());
        let group = handle
            .binding()
            .map(|b| b.device_group)
            .unwrap_or_else(|| DeviceGroup::from_device_type(device_type));
        let reply = with_device(
            Envelope::builder(kind)
                .request_id(request.request_id.clone())
                .metadata(metadata_keys::PLATFORM, group.as_str())
                .message(kind.as_str()),
            device_type,
        );
        self.reply(handle, reply.build());

        let result = match handle.binding() {
            Some(binding) => {
                match self
                    .presence
                    .renew_ttl(&binding.user_id, &self.options.broker_id, self.options.presence_ttl)
                    .await
                {
                    Ok(true) => "renewed",
                    Ok(false) => self.restore_presence(identity, handle, device_type).await,
                    Err(err) => {
                        warn!(?err, user_id = %binding.user_id, "Failed to renew presence");
                        "error"
                    }
                }
            }
            None => "anonymous",
        };
        self.metrics.heartbeats_total.with_label_values(&[result]).inc();
        kind
    }

    /// 转发客户端业务消息：要求已登录并受限流约束
    pub async fn forward(
        &self,
        identity: &ConnectionIdentity,
        handle: &Arc<ConnectionHandle>,
        envelope: Envelope,
    ) {
        if handle.binding().is_none() {
            self.metrics
                .frames_dropped_total
                .with_label_values(&["not_logged_in"])
                .inc();
            self.reply(
                handle,
                Envelope::builder(MessageType::NotLoggedIn)
                    .request_id(envelope.request_id.clone())
                    .message("login required")
                    .build(),
            );
            return;
        }

        if !self.rate_limiter.allow(&identity.user_id) {
            self.metrics
                .frames_dropped_total
                .with_label_values(&["rate_limited"])
                .inc();
            self.reply(
                handle,
                Envelope::builder(MessageType::RateLimited)
                    .request_id(envelope.request_id.clone())
                    .message("too many messages")
                    .build(),
            );
            return;
        }

        if let Err(err) = self.upstream.forward(identity, envelope).await {
            warn!(?err, user_id = %identity.user_id, "Failed to forward client envelope");
            self.metrics
                .frames_dropped_total
                .with_label_values(&["upstream"])
                .inc();
        }
    }

    /// 客户端主动登出
    pub async fn logout(&self, handle: &ConnectionHandle) {
        self.cleanup(handle, "logout", true).await;
    }

    /// 断线清理，可重复调用
    ///
    /// 只删除本连接自己的会话；用户在本节点已无会话时，按节点归属删除在线记录。
    #[instrument(skip(self, handle), fields(session_id = %handle.id()))]
    pub async fn cleanup(&self, handle: &ConnectionHandle, reason: &str, close: bool) {
        if !handle.begin_cleanup() {
            debug!("Connection already cleaned");
            if close {
                handle.close();
            }
            return;
        }

        let removed = self.registry.remove_by_transport(handle);
        if let Some(binding) = handle.binding() {
            let user_id = binding.user_id.as_str();
            if self.registry.has_sessions(user_id) {
                debug!(user_id = %user_id, "User still has local sessions, keeping presence");
            } else {
                self.rate_limiter.forget(user_id);
                match self
                    .presence
                    .delete_if_owned(user_id, &self.options.broker_id)
                    .await
                {
                    Ok(true) => debug!(user_id = %user_id, "Presence record removed"),
                    Ok(false) => {
                        debug!(user_id = %user_id, "Presence record owned elsewhere or gone, kept")
                    }
                    Err(err) => warn!(?err, user_id = %user_id, "Failed to remove presence record"),
                }
            }
        }

        if close {
            handle.close();
        }
        info!(
            reason = %reason,
            user_id = ?handle.binding().map(|b| b.user_id.as_str()),
            session_removed = removed.is_some(),
            "Connection cleaned up"
        );
    }

    /// 续期失败时：本连接仍是该用户在本节点的会话且记录已消失，则重新登记
    async fn restore_presence(
        &self,
        identity: &ConnectionIdentity,
        handle: &Arc<ConnectionHandle>,
        device_type: Option<&str>,
    ) -> &'static str {
        let Some(binding) = handle.binding() else {
            return "anonymous";
        };
        let still_local = self
            .registry
            .get_session(&binding.user_id, binding.device_group)
            .is_some_and(|s| s.is_same_connection(handle));
        if !still_local {
            return "not_owner";
        }
        match self.presence.get(&binding.user_id).await {
            Ok(None) => {}
            Ok(Some(_)) => return "not_owner",
            Err(err) => {
                warn!(?err, user_id = %binding.user_id, "Failed to read presence record");
                return "error";
            }
        }

        let update = PresenceUpdate {
            user_id: binding.user_id.clone(),
            broker_id: self.options.broker_id.clone(),
            token: Some(identity.token.clone()),
            device_group: binding.device_group,
            driver: DriverInfo {
                request_id: None,
                device_type: device_type.map(str::to_string),
            },
        };
        match self.presence.upsert(&update, self.options.presence_ttl).await {
            Ok(_) => {
                info!(user_id = %binding.user_id, "Presence record restored by heartbeat");
                "restored"
            }
            Err(err) => {
                warn!(?err, user_id = %binding.user_id, "Failed to restore presence record");
                "error"
            }
        }
    }

    fn reply(&self, handle: &ConnectionHandle, envelope: Envelope) {
        if let Err(err) = handle.send(envelope) {
            debug!(session_id = %handle.id(), error = %err, "Reply dropped");
            self.metrics
                .frames_dropped_total
                .with_label_values(&["reply"])
                .inc();
        }
    }
}

/// 让旧节点下线与新登录冲突的分组；关闭多端时旧记录的所有分组都下线
async fn evict_remote(
    notifier: Arc<dyn NodeNotifier>,
    previous: PresenceRecord,
    group: DeviceGroup,
    multi_device_enabled: bool,
) {
    for (previous_group, driver) in &previous.drivers {
        if multi_device_enabled && *previous_group != group {
            continue;
        }
        let device_type = driver
            .device_type
            .clone()
            .unwrap_or_else(|| previous_group.as_str().to_string());
        if let Err(err) = notifier
            .force_logout(&previous.broker_id, &previous.user_id, &device_type)
            .await
        {
            warn!(
                ?err,
                user_id = %previous.user_id,
                previous_node = %previous.broker_id,
                "Failed to evict session on previous node"
            );
        }
    }
}

fn with_device(builder: EnvelopeBuilder, device_type: Option<&str>) -> EnvelopeBuilder {
    match device_type {
        Some(device_type) => builder
            .device_type(device_type)
            .metadata(metadata_keys::DEVICE_TYPE, device_type),
        None => builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::RegistryOptions;
    use crate::infrastructure::BusNodeNotifier;
    use crate::test_support::{
        RecordingForwarder, StalledBus, StaticValidator, recording_connection,
    };
    use nimbus_signaling_common::bus::{InMemoryBus, MessageBus};
    use nimbus_signaling_common::codec::{CodecOutcome, EnvelopeCodec, JsonCodec};
    use nimbus_signaling_common::presence::InMemoryPresenceDirectory;

    struct Fixture {
        service: ConnectionApplicationService,
        presence: Arc<InMemoryPresenceDirectory>,
        forwarder: Arc<RecordingForwarder>,
    }

    fn options(broker_id: &str) -> ConnectionServiceOptions {
        ConnectionServiceOptions {
            broker_id: broker_id.to_string(),
            presence_ttl: Duration::from_secs(35),
            refresh_threshold: Duration::from_secs(180),
            multi_device_enabled: true,
            max_connections_per_user: 5,
            max_connections: 100,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max_messages: 2,
        }
    }

    fn fixture_with(options: ConnectionServiceOptions, remaining: Duration) -> Fixture {
        let presence = Arc::new(InMemoryPresenceDirectory::new());
        let forwarder = Arc::new(RecordingForwarder::default());
        let registry = DeviceSessionRegistry::new(RegistryOptions {
            multi_device_enabled: options.multi_device_enabled,
            kick_flush_timeout: Duration::from_millis(100),
        });
        let service = ConnectionApplicationService::new(
            options,
            registry,
            presence.clone(),
            Arc::new(StaticValidator::new(remaining)),
            forwarder.clone(),
            Arc::new(ConnectMetrics::new()),
        );
        Fixture {
            service,
            presence,
            forwarder,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(options("node-a"), Duration::from_secs(3600))
    }

    fn identity(user: &str, device_type: &str) -> ConnectionIdentity {
        ConnectionIdentity::new(user, Some(device_type.to_string()), format!("user:{user}"))
    }

    fn login_request() -> Envelope {
        Envelope::builder(MessageType::Login)
            .request_id(Some("req-1".into()))
            .build()
    }

    #[tokio::test]
    async fn login_registers_session_and_presence() {
        let f = fixture();
        let (conn, mut written) = recording_connection(16);
        let id = identity("u1", "ios");

        let outcome = f.service.login(&id, &conn, &login_request()).await;
        assert!(matches!(outcome, LoginOutcome::Accepted(_)));

        let reply = written.recv().await.unwrap();
        assert_eq!(reply.kind(), Some(MessageType::LoginSuccess));
        assert_eq!(reply.request_id.as_deref(), Some("req-1"));
        assert_eq!(reply.metadata.get("platform").map(String::as_str), Some("MOBILE"));
        assert_eq!(reply.metadata.get("brokerId").map(String::as_str), Some("node-a"));
        assert_eq!(reply.metadata.get("deviceType").map(String::as_str), Some("ios"));
        assert_eq!(reply.token, None);

        let record = f.presence.get("u1").await.unwrap().unwrap();
        assert_eq!(record.broker_id, "node-a");
        assert!(record.drivers.contains_key(&DeviceGroup::Mobile));
        assert_eq!(f.presence.active_user_count(Utc::now()).await, 1);
        assert!(f.service.registry().has_sessions("u1"));
    }

    #[tokio::test]
    async fn heartbeat_asks_for_refresh_near_expiry() {
        let f = fixture_with(options("node-a"), Duration::from_secs(60));
        let (conn, mut written) = recording_connection(16);
        let id = identity("u1", "web");
        f.service.login(&id, &conn, &login_request()).await;
        written.recv().await.unwrap();

        let heartbeat = Envelope::builder(MessageType::HeartBeat).build();
        assert_eq!(
            f.service.heartbeat(&id, &conn, &heartbeat).await,
            MessageType::RefreshToken
        );
        let reply = written.recv().await.unwrap();
        assert_eq!(reply.kind(), Some(MessageType::RefreshToken));
        assert_eq!(reply.metadata.get("platform").map(String::as_str), Some("WEB"));
        assert_eq!(reply.token, None);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_renews_presence_ttl() {
        let f = fixture();
        let (conn, mut written) = recording_connection(16);
        let id = identity("u1", "web");
        f.service.login(&id, &conn, &login_request()).await;
        written.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let heartbeat = Envelope::builder(MessageType::HeartBeat).build();
        assert_eq!(
            f.service.heartbeat(&id, &conn, &heartbeat).await,
            MessageType::HeartBeatSuccess
        );
        let remaining = f.presence.remaining_ttl("u1").await.unwrap();
        assert!(remaining > Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_restores_expired_presence() {
        let f = fixture();
        let (conn, mut written) = recording_connection(16);
        let id = identity("u1", "web");
        f.service.login(&id, &conn, &login_request()).await;
        written.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(f.presence.get("u1").await.unwrap().is_none());

        let heartbeat = Envelope::builder(MessageType::HeartBeat).build();
        f.service.heartbeat(&id, &conn, &heartbeat).await;
        let record = f.presence.get("u1").await.unwrap().unwrap();
        assert_eq!(record.broker_id, "node-a");
    }

    #[tokio::test]
    async fn cleanup_keeps_presence_while_other_sessions_remain() {
        let f = fixture();
        let (web, _w) = recording_connection(16);
        let (mobile, _m) = recording_connection(16);
        f.service.login(&identity("u1", "web"), &web, &login_request()).await;
        f.service.login(&identity("u1", "ios"), &mobile, &login_request()).await;

        f.service.cleanup(&web, "peer_closed", true).await;
        assert!(web.is_closed());
        assert!(f.presence.get("u1").await.unwrap().is_some());

        f.service.cleanup(&mobile, "peer_closed", true).await;
        assert!(f.presence.get("u1").await.unwrap().is_none());

        // 重复清理无副作用
        f.service.cleanup(&mobile, "peer_closed", true).await;
        assert!(!f.service.registry().has_sessions("u1"));
    }

    #[tokio::test]
    async fn cleanup_never_deletes_record_of_newer_owner() {
        let f = fixture();
        let (conn, _w) = recording_connection(16);
        f.service.login(&identity("u1", "web"), &conn, &login_request()).await;

        let newer = PresenceUpdate {
            user_id: "u1".into(),
            broker_id: "node-b".into(),
            token: None,
            device_group: DeviceGroup::Web,
            driver: DriverInfo::default(),
        };
        f.presence.upsert(&newer, Duration::from_secs(35)).await.unwrap();

        f.service.cleanup(&conn, "peer_closed", true).await;
        let record = f.presence.get("u1").await.unwrap().unwrap();
        assert_eq!(record.broker_id, "node-b");
    }

    #[tokio::test]
    async fn connection_limit_rejects_extra_device() {
        let mut opts = options("node-a");
        opts.max_connections_per_user = 1;
        let f = fixture_with(opts, Duration::from_secs(3600));
        let (web, _w) = recording_connection(16);
        let (mobile, mut written) = recording_connection(16);
        f.service.login(&identity("u1", "web"), &web, &login_request()).await;

        let outcome = f.service.login(&identity("u1", "ios"), &mobile, &login_request()).await;
        assert!(matches!(
            outcome,
            LoginOutcome::Limited(LimitDecision::UserLimit { limit: 1 })
        ));
        let reply = written.recv().await.unwrap();
        assert_eq!(reply.kind(), Some(MessageType::ConnectionLimited));
        assert_eq!(f.service.registry().session_count(), 1);
    }

    #[tokio::test]
    async fn login_on_new_node_evicts_session_on_previous_node() {
        let bus = Arc::new(InMemoryBus::new());
        let mut node_a_queue = bus.subscribe("node-a").await.unwrap();

        let f = fixture_with(options("node-b"), Duration::from_secs(3600));
        let service = f
            .service
            .with_notifier(Arc::new(BusNodeNotifier::new(bus.clone(), "node-b")));
        let on_a = PresenceUpdate {
            user_id: "u1".into(),
            broker_id: "node-a".into(),
            token: None,
            device_group: DeviceGroup::Web,
            driver: DriverInfo {
                request_id: None,
                device_type: Some("web".into()),
            },
        };
        f.presence.upsert(&on_a, Duration::from_secs(35)).await.unwrap();

        let (conn, _w) = recording_connection(16);
        service.login(&identity("u1", "web"), &conn, &login_request()).await;

        let delivery = node_a_queue.next_delivery().await.unwrap().unwrap();
        let CodecOutcome::Decoded(notice) = JsonCodec.decode(&delivery.payload) else {
            panic!("force logout should be JSON");
        };
        assert_eq!(notice.kind(), Some(MessageType::ForceLogout));
        assert_eq!(notice.ids, vec!["u1".to_string()]);
        assert_eq!(notice.device_type.as_deref(), Some("web"));
        assert_eq!(f.presence.get("u1").await.unwrap().unwrap().broker_id, "node-b");
    }

    #[tokio::test]
    async fn login_reply_does_not_wait_for_stalled_eviction() {
        let f = fixture_with(options("node-b"), Duration::from_secs(3600));
        let service = f
            .service
            .with_notifier(Arc::new(BusNodeNotifier::new(Arc::new(StalledBus), "node-b")));
        let on_a = PresenceUpdate {
            user_id: "u1".into(),
            broker_id: "node-a".into(),
            token: None,
            device_group: DeviceGroup::Web,
            driver: DriverInfo {
                request_id: None,
                device_type: Some("web".into()),
            },
        };
        f.presence.upsert(&on_a, Duration::from_secs(35)).await.unwrap();

        let (conn, mut written) = recording_connection(16);
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            service.login(&identity("u1", "web"), &conn, &login_request()),
        )
        .await
        .expect("login must not block on the previous node");
        assert!(matches!(outcome, LoginOutcome::Accepted(_)));

        let reply = written.recv().await.unwrap();
        assert_eq!(reply.kind(), Some(MessageType::LoginSuccess));
        assert_eq!(f.presence.get("u1").await.unwrap().unwrap().broker_id, "node-b");
    }

    #[tokio::test]
    async fn business_messages_need_login_and_respect_rate_limit() {
        let f = fixture();
        let (conn, mut written) = recording_connection(16);
        let id = identity("u1", "web");
        let message = || {
            Envelope::builder(MessageType::SingleMessage)
                .request_id(Some("m".into()))
                .build()
        };

        f.service.forward(&id, &conn, message()).await;
        assert_eq!(written.recv().await.unwrap().kind(), Some(MessageType::NotLoggedIn));

        f.service.login(&id, &conn, &login_request()).await;
        written.recv().await.unwrap();
        f.service.forward(&id, &conn, message()).await;
        f.service.forward(&id, &conn, message()).await;
        f.service.forward(&id, &conn, message()).await;

        assert_eq!(f.forwarder.count(), 2);
        assert_eq!(written.recv().await.unwrap().kind(), Some(MessageType::RateLimited));
    }
}
