//! 设备会话表
//!
//! 节点内 `userId → {设备分组 → 会话}` 的映射。同一 (用户, 分组) 至多一个会话；
//! 关闭多端时同一用户至多一个会话。单个用户的读改写在 DashMap 分片锁内完成，
//! 驱逐与插入对同一用户是线性化的。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_signaling_common::metadata_keys;
use nimbus_signaling_common::{DeviceGroup, Envelope, MessageType};
use tracing::{debug, info, warn};

use crate::domain::model::{ConnectionHandle, Session};

/// 会话被替换的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickReason {
    /// 同一分组的新连接
    SameGroup,
    /// 单设备模式下其他分组的新连接
    OtherDevice,
    /// 总线下发的强制下线
    Forced,
}

impl KickReason {
    pub fn message(self) -> &'static str {
        match self {
            KickReason::SameGroup => "logged in from another device of the same type",
            KickReason::OtherDevice => "logged in from another device",
            KickReason::Forced => "forced logout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub multi_device_enabled: bool,
    /// 替换通知写出的最长等待，超时后直接关闭
    pub kick_flush_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            multi_device_enabled: false,
            kick_flush_timeout: Duration::from_millis(500),
        }
    }
}

/// `add_session` 的结果
#[derive(Debug)]
pub struct AddSessionOutcome {
    pub session: Session,
    pub evicted: Vec<(Session, KickReason)>,
}

/// 登录准入所需的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub user_sessions: usize,
    pub node_sessions: usize,
    /// 本次登录是否只替换已有会话（不会增加会话数）
    pub replaces_existing: bool,
}

#[derive(Clone)]
pub struct DeviceSessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    users: DashMap<String, HashMap<DeviceGroup, Session>>,
    options: RegistryOptions,
    metrics: Option<ConnectMetrics>,
}

impl DeviceSessionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self::build(options, None)
    }

    pub fn with_metrics(options: RegistryOptions, metrics: ConnectMetrics) -> Self {
        Self::build(options, Some(metrics))
    }

    fn build(options: RegistryOptions, metrics: Option<ConnectMetrics>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                users: DashMap::new(),
                options,
                metrics,
            }),
        }
    }

    /// 注册会话，驱逐冲突会话并为新连接注册关闭回调
    ///
    /// 连接已绑定过分组时沿用原分组。被驱逐的连接收到一次 FORCE_LOGOUT 通知，
    /// 写出后（或等待超时后）关闭。
    pub fn add_session(
        &self,
        user_id: &str,
        handle: Arc<ConnectionHandle>,
        device_type: Option<&str>,
    ) -> AddSessionOutcome {
        let requested = DeviceGroup::from_device_type(device_type);
        let group = handle.bind(user_id, requested).device_group;
        let session = Session::new(
            user_id,
            device_type.map(str::to_string),
            group,
            handle.clone(),
        );

        let mut evicted = Vec::new();
        {
            let mut sessions = self.inner.users.entry(user_id.to_string()).or_default();

            if let Some(existing) = sessions.remove(&group) {
                if !existing.is_same_connection(&handle) {
                    info!(
                        user_id = %user_id,
                        device_group = %group,
                        old_session = %existing.session_id(),
                        new_session = %handle.id(),
                        "Evicting session of the same device group"
                    );
                    evicted.push((existing, KickReason::SameGroup));
                }
            }

            if !self.inner.options.multi_device_enabled {
                let others: Vec<DeviceGroup> = sessions
                    .keys()
                    .filter(|g| **g != group)
                    .copied()
                    .collect();
                for other in others {
                    if let Some(existing) = sessions.remove(&other) {
                        info!(
                            user_id = %user_id,
                            device_group = %group,
                            kicked_group = %other,
                            "Evicting session for single-device login"
                        );
                        evicted.push((existing, KickReason::OtherDevice));
                    }
                }
            }

            sessions.insert(group, session.clone());
        }

        self.refresh_gauges();
        for (old, reason) in &evicted {
            self.kick(old.clone(), *reason);
        }
        self.watch_close(&handle);

        debug!(
            user_id = %user_id,
            device_group = %group,
            session_id = %handle.id(),
            evicted = evicted.len(),
            "Session registered"
        );

        AddSessionOutcome { session, evicted }
    }

    pub fn get_session(&self, user_id: &str, group: DeviceGroup) -> Option<Session> {
        self.inner
            .users
            .get(user_id)
            .and_then(|sessions| sessions.get(&group).cloned())
    }

    pub fn get_all_sessions(&self, user_id: &str) -> Vec<Session> {
        self.inner
            .users
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_sessions(&self, user_id: &str) -> bool {
        self.inner
            .users
            .get(user_id)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// 删除指定分组的会话，`close` 为 true 时同时关闭连接
    pub fn remove_session(&self, user_id: &str, group: DeviceGroup, close: bool) -> Option<Session> {
        let removed = match self.inner.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&group);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };

        if let Some(session) = &removed {
            self.refresh_gauges();
            if close {
                session.handle.close();
            }
            debug!(user_id = %user_id, device_group = %group, close, "Session removed");
        }
        removed
    }

    /// 强制下线：删除并通知指定分组（`None` 为全部分组）的会话
    ///
    /// 会话不存在时什么也不做，重复投递是安全的。
    pub fn kick_sessions(&self, user_id: &str, group: Option<DeviceGroup>) -> usize {
        let removed: Vec<Session> = match self.inner.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = match group {
                    Some(group) => entry.get_mut().remove(&group).into_iter().collect(),
                    None => entry.get_mut().drain().map(|(_, s)| s).collect(),
                };
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => Vec::new(),
        };

        if !removed.is_empty() {
            self.refresh_gauges();
            info!(user_id = %user_id, device_group = ?group, count = removed.len(), "Sessions force logged out");
        }
        let count = removed.len();
        for session in removed {
            self.kick(session, KickReason::Forced);
        }
        count
    }

    /// 按连接删除会话
    ///
    /// 只有当前登记的会话仍是这条连接时才删除，迟到的关闭回调不会误删替换它的新会话。
    pub fn remove_by_transport(&self, handle: &ConnectionHandle) -> Option<Session> {
        let binding = handle.binding()?;
        let removed = match self.inner.users.entry(binding.user_id.clone()) {
            Entry::Occupied(mut entry) => {
                let owned = entry
                    .get()
                    .get(&binding.device_group)
                    .is_some_and(|s| s.is_same_connection(handle));
                let removed = if owned {
                    entry.get_mut().remove(&binding.device_group)
                } else {
                    None
                };
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };

        if removed.is_some() {
            self.refresh_gauges();
            debug!(
                user_id = %binding.user_id,
                device_group = %binding.device_group,
                session_id = %handle.id(),
                "Session removed by transport"
            );
        }
        removed
    }

    /// 登录准入快照
    pub fn admission(&self, user_id: &str, group: DeviceGroup, handle: &ConnectionHandle) -> AdmissionSnapshot {
        // 先释放该用户分片的读锁，再遍历全表计数
        let (user_sessions, replaces_existing) = match self.inner.users.get(user_id) {
            Some(sessions) => {
                let same_group = sessions.contains_key(&group);
                let already_bound = sessions.values().any(|s| s.is_same_connection(handle));
                let replaces = same_group
                    || already_bound
                    || (!self.inner.options.multi_device_enabled && !sessions.is_empty());
                (sessions.len(), replaces)
            }
            None => (0, false),
        };
        AdmissionSnapshot {
            user_sessions,
            node_sessions: self.session_count(),
            replaces_existing,
        }
    }

    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.users.iter().map(|entry| entry.value().len()).sum()
    }

    fn refresh_gauges(&self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.online_users.set(self.user_count() as i64);
        }
    }

    fn kick(&self, session: Session, reason: KickReason) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.sessions_kicked_total.inc();
        }

        let mut notice = Envelope::builder(MessageType::ForceLogout)
            .metadata(metadata_keys::PLATFORM, session.device_group.as_str())
            .message(reason.message());
        if let Some(device_type) = &session.device_type {
            notice = notice
                .device_type(device_type.clone())
                .metadata(metadata_keys::DEVICE_TYPE, device_type.clone());
        }
        let notice = notice.ids(vec![session.user_id.clone()]).build();
        let timeout = self.inner.options.kick_flush_timeout;

        tokio::spawn(async move {
            let handle = session.handle;
            match handle.send(notice) {
                Ok(()) => {
                    if !handle.flush(timeout).await {
                        debug!(session_id = %handle.id(), "kick notice not flushed before timeout");
                    }
                }
                Err(err) => {
                    warn!(session_id = %handle.id(), error = %err, "failed to queue kick notice");
                }
            }
            handle.close();
        });
    }

    fn watch_close(&self, handle: &Arc<ConnectionHandle>) {
        if !handle.mark_close_watched() {
            return;
        }
        let registry = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.shutdown_token().cancelled().await;
            registry.remove_by_transport(&handle);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Outbound;
    use tokio::sync::mpsc;

    fn registry(multi_device_enabled: bool) -> DeviceSessionRegistry {
        DeviceSessionRegistry::new(RegistryOptions {
            multi_device_enabled,
            kick_flush_timeout: Duration::from_millis(200),
        })
    }

    /// 模拟写任务：收集写出的消息并回执 flush
    fn connection() -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Envelope>) {
        let (handle, mut rx) = ConnectionHandle::new(None, 16);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Envelope(env) => {
                        let _ = written_tx.send(env);
                    }
                    Outbound::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        (handle, written_rx)
    }

    async fn wait_closed(handle: &ConnectionHandle) {
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown_token().cancelled())
            .await
            .expect("connection should be closed");
    }

    #[tokio::test]
    async fn same_group_login_evicts_old_connection_once() {
        let registry = registry(true);
        let (old, mut old_written) = connection();
        let (new, _new_written) = connection();

        registry.add_session("u1", old.clone(), Some("web"));
        let outcome = registry.add_session("u1", new.clone(), Some("h5"));

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].1, KickReason::SameGroup);
        let current = registry.get_session("u1", DeviceGroup::Web).unwrap();
        assert_eq!(current.session_id(), new.id());

        wait_closed(&old).await;
        let notice = old_written.recv().await.unwrap();
        assert_eq!(notice.kind(), Some(MessageType::ForceLogout));
        assert!(old_written.try_recv().is_err());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn multi_device_keeps_other_groups() {
        let registry = registry(true);
        let (web, _) = connection();
        let (mobile, _) = connection();

        registry.add_session("u1", web.clone(), Some("web"));
        let outcome = registry.add_session("u1", mobile, Some("ios"));

        assert!(outcome.evicted.is_empty());
        assert_eq!(registry.get_all_sessions("u1").len(), 2);
        assert!(!web.is_closed());
    }

    #[tokio::test]
    async fn single_device_mode_evicts_every_other_group() {
        let registry = registry(false);
        let (web, _) = connection();
        let (desktop, _) = connection();
        let (mobile, _) = connection();

        registry.add_session("u1", web.clone(), Some("web"));
        registry.add_session("u1", desktop.clone(), Some("mac"));
        let outcome = registry.add_session("u1", mobile.clone(), Some("android"));

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].1, KickReason::OtherDevice);
        assert_eq!(registry.get_all_sessions("u1").len(), 1);
        wait_closed(&web).await;
        wait_closed(&desktop).await;
        assert!(!mobile.is_closed());
    }

    #[tokio::test]
    async fn relogin_on_same_connection_is_not_an_eviction() {
        let registry = registry(false);
        let (conn, _) = connection();

        registry.add_session("u1", conn.clone(), Some("ios"));
        // 连接已绑定 MOBILE，后续登录沿用原分组
        let outcome = registry.add_session("u1", conn.clone(), Some("web"));

        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.session.device_group, DeviceGroup::Mobile);
        assert_eq!(registry.session_count(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn stale_close_does_not_remove_replacement() {
        let registry = registry(true);
        let (old, _) = connection();
        let (new, _) = connection();

        registry.add_session("u1", old.clone(), Some("web"));
        registry.add_session("u1", new.clone(), Some("web"));

        assert!(registry.remove_by_transport(&old).is_none());
        assert_eq!(
            registry.get_session("u1", DeviceGroup::Web).unwrap().session_id(),
            new.id()
        );

        assert!(registry.remove_by_transport(&new).is_some());
        assert!(!registry.has_sessions("u1"));
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn close_callback_removes_session() {
        let registry = registry(true);
        let (conn, _) = connection();
        registry.add_session("u1", conn.clone(), None);
        assert!(registry.get_session("u1", DeviceGroup::Web).is_some());

        conn.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.has_sessions("u1") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("close callback should remove the session");
    }

    #[tokio::test]
    async fn remove_session_optionally_closes() {
        let registry = registry(true);
        let (web, _) = connection();
        let (mobile, _) = connection();
        registry.add_session("u1", web.clone(), Some("web"));
        registry.add_session("u1", mobile.clone(), Some("ios"));

        assert!(registry.remove_session("u1", DeviceGroup::Web, false).is_some());
        assert!(!web.is_closed());
        assert!(registry.remove_session("u1", DeviceGroup::Mobile, true).is_some());
        assert!(mobile.is_closed());
        assert!(registry.remove_session("u1", DeviceGroup::Mobile, true).is_none());
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_same_group_logins_leave_one_session() {
        let registry = registry(true);
        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let (conn, _) = connection();
            handles.push(conn.clone());
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.add_session("u1", conn, Some("ios")).evicted.len()
            }));
        }
        let mut evicted = 0;
        for task in tasks {
            evicted += task.await.unwrap();
        }

        assert_eq!(registry.session_count(), 1);
        assert_eq!(evicted, 15);
        let survivor = registry.get_session("u1", DeviceGroup::Mobile).unwrap();
        for handle in &handles {
            if handle.id() != survivor.session_id() {
                wait_closed(handle).await;
            }
        }
    }

    #[tokio::test]
    async fn kick_sessions_by_group_or_all() {
        let registry = registry(true);
        let (web, mut web_written) = connection();
        let (mobile, _) = connection();
        let (desktop, _) = connection();
        registry.add_session("u1", web.clone(), Some("web"));
        registry.add_session("u1", mobile.clone(), Some("ios"));
        registry.add_session("u1", desktop.clone(), Some("mac"));

        assert_eq!(registry.kick_sessions("u1", Some(DeviceGroup::Web)), 1);
        wait_closed(&web).await;
        let notice = web_written.recv().await.unwrap();
        assert_eq!(notice.kind(), Some(MessageType::ForceLogout));
        assert_eq!(registry.kick_sessions("u1", Some(DeviceGroup::Web)), 0);

        assert_eq!(registry.kick_sessions("u1", None), 2);
        wait_closed(&mobile).await;
        wait_closed(&desktop).await;
        assert!(!registry.has_sessions("u1"));
        assert_eq!(registry.kick_sessions("nobody", None), 0);
    }

    #[tokio::test]
    async fn admission_detects_replacement() {
        let registry = registry(true);
        let (web, _) = connection();
        let (candidate, _) = connection();
        registry.add_session("u1", web, Some("web"));

        let same = registry.admission("u1", DeviceGroup::Web, &candidate);
        assert!(same.replaces_existing);
        let other = registry.admission("u1", DeviceGroup::Mobile, &candidate);
        assert!(!other.replaces_existing);
        assert_eq!(other.user_sessions, 1);
        assert_eq!(other.node_sessions, 1);
    }
}
