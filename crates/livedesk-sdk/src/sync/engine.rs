//! 会话同步引擎
//!
//! 功能包括：
//! - 快照刷新与合并（去抖、同一时刻只允许一个在途请求）
//! - 推送事件处理（补丁已知会话、触发未知会话的快照刷新）
//! - 乐观认领与服务端拒绝后的回滚
//! - 可见性门闩下的主面板消息路由
//!
//! 推送事件只是提示：引擎从不把推送内容当作权威状态，权威状态
//! 永远来自快照接口。刷新失败只发 SyncError 事件，不立即重试，
//! 由下一个轮询周期自愈。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection_state::{ConnectionStateManager, ConnectionStatus};
use crate::entities::{AgentSession, Conversation, ConversationCounts, DashboardSettings};
use crate::error::{LiveDeskSDKError, Result};
use crate::events::{event_builders, DeskEvent, EventManager};
use crate::http_client::DeskGateway;
use crate::push::PushEvent;
use crate::sync::state::SyncState;
use crate::sync::visibility::{VisibilityGate, VisibilityPolicy};
use crate::typing::TypingThrottle;
use crate::utils::now_ts;

/// 在途请求守卫，Drop 时释放标志位
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 会话同步引擎
#[derive(Clone)]
pub struct ConversationSyncEngine {
    gateway: Arc<dyn DeskGateway>,
    state: Arc<RwLock<SyncState>>,
    events: Arc<EventManager>,
    connection: Arc<ConnectionStateManager>,
    session: Arc<RwLock<Option<AgentSession>>>,
    settings: Arc<RwLock<DashboardSettings>>,
    typing: Arc<TypingThrottle>,
    fetch_in_flight: Arc<AtomicBool>,
    /// 在途的可见性探测任务，停止同步时一并中止
    probe_tasks: Arc<tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    min_refresh_interval: Duration,
    visibility_policy: VisibilityPolicy,
}

impl ConversationSyncEngine {
    pub fn new(
        gateway: Arc<dyn DeskGateway>,
        events: Arc<EventManager>,
        connection: Arc<ConnectionStateManager>,
        min_refresh_interval: Duration,
        visibility_policy: VisibilityPolicy,
    ) -> Self {
        Self {
            gateway,
            state: Arc::new(RwLock::new(SyncState::new())),
            events,
            connection,
            session: Arc::new(RwLock::new(None)),
            settings: Arc::new(RwLock::new(DashboardSettings::default())),
            typing: Arc::new(TypingThrottle::default()),
            fetch_in_flight: Arc::new(AtomicBool::new(false)),
            probe_tasks: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            min_refresh_interval,
            visibility_policy,
        }
    }

    // ========================================================================
    // 会话与设置
    // ========================================================================

    pub async fn set_session(&self, session: AgentSession) {
        *self.session.write().await = Some(session);
    }

    pub async fn clear_session(&self) {
        *self.session.write().await = None;
    }

    pub async fn current_agent(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.username.clone())
    }

    pub async fn settings(&self) -> DashboardSettings {
        self.settings.read().await.clone()
    }

    pub async fn store_settings(&self, settings: DashboardSettings) {
        *self.settings.write().await = settings;
    }

    pub fn typing(&self) -> &Arc<TypingThrottle> {
        &self.typing
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// 推送通道状态的当前值（决定轮询节奏）
    pub async fn connection_status(&self) -> ConnectionStatus {
        self.connection.status().await
    }

    /// 清空登录会话期间积累的全部本地状态
    ///
    /// 会话列表、主面板会话和设置都属于已登出的坐席，
    /// 不能泄漏给下一个登录者。
    pub(crate) async fn reset(&self) {
        self.state.write().await.clear();
        *self.settings.write().await = DashboardSettings::default();
    }

    /// 会话失效：清掉本地会话并通知上层重新登录
    pub(crate) async fn notify_session_expired(&self) {
        self.clear_session().await;
        self.events
            .emit(DeskEvent::SessionExpired { timestamp: now_ts() })
            .await;
    }

    // ========================================================================
    // 状态读取
    // ========================================================================

    /// 按最近更新时间排序的可见会话列表
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversation_list()
    }

    pub async fn conversation(&self, conversation_id: u64) -> Option<Conversation> {
        self.state.read().await.conversation(conversation_id).cloned()
    }

    /// 当前坐席视角的分组计数
    pub async fn counts(&self) -> ConversationCounts {
        let agent = self.current_agent().await;
        self.state.read().await.counts(agent.as_deref())
    }

    /// 设置主面板当前打开的会话
    pub async fn set_active_conversation(&self, conversation_id: Option<u64>) {
        self.state.write().await.active_conversation_id = conversation_id;
    }

    pub async fn active_conversation(&self) -> Option<u64> {
        self.state.read().await.active_conversation_id
    }

    // ========================================================================
    // 快照刷新
    // ========================================================================

    /// 去抖刷新：距上次成功对账不足最小间隔时跳过
    pub async fn refresh(&self) -> Result<()> {
        let recently_reconciled = {
            let state = self.state.read().await;
            state
                .last_reconcile_at
                .map(|at| at.elapsed() < self.min_refresh_interval)
                .unwrap_or(false)
        };
        if recently_reconciled {
            debug!("刷新被去抖跳过");
            return Ok(());
        }
        self.force_refresh().await
    }

    /// 立即刷新快照并对账
    ///
    /// 同一时刻只允许一个在途请求，并发调用会直接返回（等价于
    /// 搭上已在途的那次刷新）。
    pub async fn force_refresh(&self) -> Result<()> {
        if self
            .fetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("已有在途的快照请求，合并本次刷新");
            return Ok(());
        }
        let _guard = InFlightGuard(self.fetch_in_flight.clone());

        match self.gateway.fetch_conversations().await {
            Ok(snapshot) => {
                {
                    let mut state = self.state.write().await;
                    state.reconcile_snapshot(snapshot);
                }
                self.emit_list_changed().await;
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ 快照刷新失败: {}", e);
                self.events
                    .emit(event_builders::sync_error(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn emit_list_changed(&self) {
        let counts = self.counts().await;
        self.events
            .emit(event_builders::conversation_list_changed(counts))
            .await;
    }

    // ========================================================================
    // 推送事件处理
    // ========================================================================

    /// 处理一条推送事件
    ///
    /// 返回错误仅在会话失效时（认证错误），由调度器决定停止同步。
    pub async fn handle_push_event(&self, event: PushEvent) -> Result<()> {
        match event {
            PushEvent::NewMessage {
                conversation_id,
                message,
                sender,
            } => {
                self.connection.record_event().await;
                self.typing.clear(conversation_id).await;

                let (known, is_active, displayable) = {
                    let mut state = self.state.write().await;
                    let known = state.patch_preview(conversation_id, &message);
                    (
                        known,
                        state.active_conversation_id == Some(conversation_id),
                        state.should_display_in_active_panel(conversation_id),
                    )
                };

                if known {
                    self.emit_list_changed().await;
                } else {
                    // 未知会话：推送只是提示，通过快照刷新补全
                    let _ = self.refresh().await;
                }

                if displayable {
                    self.events
                        .emit(DeskEvent::ActiveMessageArrived {
                            conversation_id,
                            sender,
                            message,
                            timestamp: now_ts(),
                        })
                        .await;
                } else if is_active {
                    // 主面板正开着这个会话但本地还认为它不可见，
                    // 后台探测可见性，探测通过后再补发消息事件
                    self.spawn_visibility_probe(conversation_id, sender, message)
                        .await;
                }
            }
            PushEvent::Handoff {
                conversation_id,
                agent,
            } => {
                self.connection.record_event().await;
                let known = self
                    .state
                    .write()
                    .await
                    .set_assignment(conversation_id, agent);
                if known {
                    self.emit_list_changed().await;
                } else {
                    let _ = self.refresh().await;
                }
            }
            PushEvent::Handback { conversation_id } => {
                self.connection.record_event().await;
                let known = self.state.write().await.set_assignment(conversation_id, None);
                if known {
                    self.emit_list_changed().await;
                } else {
                    let _ = self.refresh().await;
                }
            }
            PushEvent::RefreshConversations => {
                self.connection.record_event().await;
                let _ = self.refresh().await;
            }
            PushEvent::SettingsUpdated { ai_enabled } => {
                self.connection.record_event().await;
                self.settings.write().await.ai_enabled = ai_enabled;
                self.events
                    .emit(DeskEvent::SettingsChanged {
                        ai_enabled,
                        timestamp: now_ts(),
                    })
                    .await;
            }
            PushEvent::Typing {
                conversation_id,
                agent,
            } => {
                // 自己触发的输入事件不用提示自己
                if let (Some(me), Some(who)) = (self.current_agent().await, agent.as_ref()) {
                    if &me == who {
                        return Ok(());
                    }
                }
                if self.typing.should_notify(conversation_id).await {
                    self.events
                        .emit(DeskEvent::TypingIndicator {
                            conversation_id,
                            agent,
                            timestamp: now_ts(),
                        })
                        .await;
                }
            }
            PushEvent::Connected => {
                self.transition_connection(ConnectionStatus::Connected).await;
            }
            PushEvent::Disconnected => {
                // 通道会自动重连，标记为重连中以提速兜底轮询
                self.transition_connection(ConnectionStatus::Reconnecting).await;
            }
            PushEvent::Reconnected => {
                self.transition_connection(ConnectionStatus::Connected).await;
                // 断线期间可能漏掉任意多的推送，强制全量对账一次
                info!("🔄 推送通道已恢复，执行补偿刷新");
                if let Err(e) = self.force_refresh().await {
                    if e.is_auth() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn transition_connection(&self, new_status: ConnectionStatus) {
        if let Some(old) = self.connection.transition(new_status).await {
            self.state.write().await.connection_status = new_status;
            self.events
                .emit(event_builders::connection_changed(old, new_status))
                .await;
        }
    }

    /// 中止所有在途的可见性探测（登出/停止同步时调用）
    pub(crate) async fn abort_probes(&self) {
        let mut tasks = self.probe_tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    async fn spawn_visibility_probe(
        &self,
        conversation_id: u64,
        sender: crate::entities::Sender,
        message: String,
    ) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let gate =
                VisibilityGate::new(engine.gateway.clone(), engine.visibility_policy.clone());
            match gate.wait_until_visible(conversation_id).await {
                Ok(true) => {
                    let still_active = {
                        let mut state = engine.state.write().await;
                        state.mark_visible(conversation_id);
                        // 探测期间用户可能已经切走
                        state.should_display_in_active_panel(conversation_id)
                    };
                    if still_active {
                        engine
                            .events
                            .emit(DeskEvent::ActiveMessageArrived {
                                conversation_id,
                                sender,
                                message,
                                timestamp: now_ts(),
                            })
                            .await;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("可见性探测中止: {}", e);
                }
            }
        });

        let mut tasks = self.probe_tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // ========================================================================
    // 认领 / 交还
    // ========================================================================

    /// 认领会话（乐观更新，服务端拒绝时回滚）
    pub async fn claim(&self, conversation_id: u64) -> Result<()> {
        let agent = self
            .current_agent()
            .await
            .ok_or_else(|| LiveDeskSDKError::Auth("未登录".to_string()))?;

        let previous = {
            let mut state = self.state.write().await;
            state.apply_local_claim(conversation_id, &agent)
        }
        .ok_or_else(|| {
            LiveDeskSDKError::InvalidOperation(format!("未知会话: {}", conversation_id))
        })?;
        self.emit_list_changed().await;

        match self.gateway.handoff(conversation_id).await {
            Ok(()) => {
                info!("✅ 会话 {} 已认领给 {}", conversation_id, agent);
                self.events
                    .emit(DeskEvent::ClaimConfirmed {
                        conversation_id,
                        agent,
                        timestamp: now_ts(),
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!("❌ 认领会话 {} 被拒绝: {}", conversation_id, e);
                self.state
                    .write()
                    .await
                    .set_assignment(conversation_id, previous);
                self.emit_list_changed().await;
                self.events
                    .emit(DeskEvent::ClaimRejected {
                        conversation_id,
                        error: e.to_string(),
                        timestamp: now_ts(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// 把会话交还给 AI（乐观更新，失败时回滚）
    pub async fn hand_back(&self, conversation_id: u64) -> Result<()> {
        let previous = {
            let mut state = self.state.write().await;
            let previous = state
                .conversation(conversation_id)
                .map(|c| c.assigned_agent.clone());
            if previous.is_some() {
                state.set_assignment(conversation_id, None);
            }
            previous
        }
        .ok_or_else(|| {
            LiveDeskSDKError::InvalidOperation(format!("未知会话: {}", conversation_id))
        })?;
        self.emit_list_changed().await;

        match self.gateway.handback_to_ai(conversation_id).await {
            Ok(()) => {
                info!("会话 {} 已交还给 AI", conversation_id);
                Ok(())
            }
            Err(e) => {
                self.state
                    .write()
                    .await
                    .set_assignment(conversation_id, previous);
                self.emit_list_changed().await;
                Err(e)
            }
        }
    }

    /// 发送坐席消息后更新本地预览
    pub async fn note_outgoing_message(&self, conversation_id: u64, message: &str) {
        let known = self
            .state
            .write()
            .await
            .patch_preview(conversation_id, message);
        if known {
            self.emit_list_changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Sender;
    use crate::http_client::tests::MockGateway;

    fn conv(id: u64, assigned: Option<&str>) -> Conversation {
        Conversation {
            id,
            participant: format!("user{}", id),
            channel: Default::default(),
            assigned_agent: assigned.map(|s| s.to_string()),
            latest_message: None,
            visible: true,
            last_updated: None,
        }
    }

    fn engine_with(gateway: Arc<MockGateway>) -> ConversationSyncEngine {
        ConversationSyncEngine::new(
            gateway,
            Arc::new(EventManager::new(64)),
            Arc::new(ConnectionStateManager::new()),
            Duration::from_secs(1),
            VisibilityPolicy::default(),
        )
    }

    async fn logged_in_engine(gateway: Arc<MockGateway>, agent: &str) -> ConversationSyncEngine {
        let engine = engine_with(gateway);
        engine
            .set_session(AgentSession {
                username: agent.to_string(),
                logged_in_at: now_ts(),
            })
            .await;
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_coalesces() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.fetch_delay.lock() = Some(Duration::from_millis(100));
        let engine = engine_with(gateway.clone());

        let (a, b) = tokio::join!(engine.force_refresh(), engine.force_refresh());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_refresh_debounced_after_recent_reconcile() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine_with(gateway.clone());

        engine.refresh().await.unwrap();
        engine.refresh().await.unwrap();
        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_claim_rollback_on_rejection() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![conv(7, Some("bob"))];
        *gateway.handoff_error.lock() = Some(LiveDeskSDKError::ServerRejected(
            "already assigned".to_string(),
        ));
        let engine = logged_in_engine(gateway.clone(), "alice").await;
        engine.force_refresh().await.unwrap();

        let mut receiver = engine.events.subscribe();
        assert!(engine.claim(7).await.is_err());

        // 回滚后归属恢复
        assert!(engine.conversation(7).await.unwrap().is_assigned_to("bob"));

        // 事件序列里必须出现认领被拒
        let mut saw_rejected = false;
        while let Ok(event) = receiver.try_recv() {
            if matches!(event, DeskEvent::ClaimRejected { conversation_id: 7, .. }) {
                saw_rejected = true;
            }
        }
        assert!(saw_rejected);
    }

    #[tokio::test]
    async fn test_claim_confirmed_on_success() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![conv(3, None)];
        let engine = logged_in_engine(gateway.clone(), "alice").await;
        engine.force_refresh().await.unwrap();

        engine.claim(3).await.unwrap();
        assert!(engine.conversation(3).await.unwrap().is_assigned_to("alice"));
        assert_eq!(
            gateway.handoff_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_reconnect_triggers_single_resync() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine_with(gateway.clone());

        engine.handle_push_event(PushEvent::Connected).await.unwrap();
        engine
            .handle_push_event(PushEvent::Disconnected)
            .await
            .unwrap();
        engine
            .handle_push_event(PushEvent::Reconnected)
            .await
            .unwrap();

        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(
            engine.connection.status().await,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_new_message_for_unknown_conversation_refreshes() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![conv(9, None)];
        let engine = engine_with(gateway.clone());

        engine
            .handle_push_event(PushEvent::NewMessage {
                conversation_id: 9,
                message: "hello".to_string(),
                sender: Sender::User,
            })
            .await
            .unwrap();

        // 推送里的未知会话通过快照刷新补全
        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(engine.conversation(9).await.is_some());
    }

    #[tokio::test]
    async fn test_new_message_patches_known_preview() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![conv(2, None)];
        let engine = engine_with(gateway.clone());
        engine.force_refresh().await.unwrap();

        engine
            .handle_push_event(PushEvent::NewMessage {
                conversation_id: 2,
                message: "订单还没到".to_string(),
                sender: Sender::User,
            })
            .await
            .unwrap();

        assert_eq!(
            engine
                .conversation(2)
                .await
                .unwrap()
                .latest_message
                .as_deref(),
            Some("订单还没到")
        );
        // 已知会话走补丁，不触发额外的快照请求
        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_gated_active_message() {
        let gateway = Arc::new(MockGateway::default());
        let mut hidden = conv(5, None);
        hidden.visible = false;
        *gateway.conversations.lock() = vec![hidden];
        gateway
            .visible_after
            .store(2, std::sync::atomic::Ordering::SeqCst);

        let engine = engine_with(gateway.clone());
        engine.force_refresh().await.unwrap();
        engine.set_active_conversation(Some(5)).await;

        let mut receiver = engine.events.subscribe();
        engine
            .handle_push_event(PushEvent::NewMessage {
                conversation_id: 5,
                message: "在吗".to_string(),
                sender: Sender::User,
            })
            .await
            .unwrap();

        // 后台探测通过后补发主面板消息事件
        loop {
            match receiver.recv().await.unwrap() {
                DeskEvent::ActiveMessageArrived {
                    conversation_id,
                    message,
                    ..
                } => {
                    assert_eq!(conversation_id, 5);
                    assert_eq!(message, "在吗");
                    break;
                }
                _ => continue,
            }
        }
        assert!(engine.conversation(5).await.unwrap().visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_aborted_on_teardown() {
        let gateway = Arc::new(MockGateway::default());
        let mut hidden = conv(5, None);
        hidden.visible = false;
        *gateway.conversations.lock() = vec![hidden];
        gateway
            .visible_after
            .store(5, std::sync::atomic::Ordering::SeqCst);

        let engine = engine_with(gateway.clone());
        engine.force_refresh().await.unwrap();
        engine.set_active_conversation(Some(5)).await;

        engine
            .handle_push_event(PushEvent::NewMessage {
                conversation_id: 5,
                message: "在吗".to_string(),
                sender: Sender::User,
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;

        // 停止同步后探测任务必须中止，不再打可见性接口也不再发事件
        engine.abort_probes().await;
        let mut receiver = engine.events.subscribe();
        let calls_at_abort = gateway
            .visibility_calls
            .load(std::sync::atomic::Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(
            gateway
                .visibility_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            calls_at_abort
        );
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typing_from_self_is_filtered() {
        let gateway = Arc::new(MockGateway::default());
        let engine = logged_in_engine(gateway, "alice").await;
        let mut receiver = engine.events.subscribe();

        engine
            .handle_push_event(PushEvent::Typing {
                conversation_id: 1,
                agent: Some("alice".to_string()),
            })
            .await
            .unwrap();
        assert!(receiver.try_recv().is_err());

        engine
            .handle_push_event(PushEvent::Typing {
                conversation_id: 1,
                agent: Some("bob".to_string()),
            })
            .await
            .unwrap();
        assert!(matches!(
            receiver.try_recv().unwrap(),
            DeskEvent::TypingIndicator { conversation_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_settings_updated_event() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine_with(gateway);
        let mut receiver = engine.events.subscribe();

        engine
            .handle_push_event(PushEvent::SettingsUpdated { ai_enabled: false })
            .await
            .unwrap();

        assert!(!engine.settings().await.ai_enabled);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            DeskEvent::SettingsChanged { ai_enabled: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_refresh_failure_emits_sync_error() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.fetch_error.lock() =
            Some(LiveDeskSDKError::Network("connection refused".to_string()));
        let engine = engine_with(gateway.clone());
        let mut receiver = engine.events.subscribe();

        assert!(engine.force_refresh().await.is_err());
        assert!(matches!(
            receiver.try_recv().unwrap(),
            DeskEvent::SyncError { .. }
        ));
        // 失败不触发立即重试
        assert_eq!(
            gateway.fetch_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
