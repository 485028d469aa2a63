//! LiveDesk SDK 主接口
//!
//! 功能包括：
//! - SDK 配置与分层初始化
//! - 坐席登录/登出与同步生命周期
//! - 会话打开、消息发送、认领/交还的门面方法
//! - 陈旧响应丢弃（快速切换会话时旧请求的结果作废）

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection_state::{ConnectionStateManager, ConnectionStatus};
use crate::entities::{Conversation, ConversationCounts, DashboardSettings, Message};
use crate::error::{LiveDeskSDKError, Result};
use crate::events::{DeskEvent, EventManager};
use crate::http_client::{DeskGateway, DeskHttpClient, HttpClientConfig};
use crate::push::{OutboundFrame, PushChannel, WsPushChannel};
use crate::scheduler::{SchedulerConfig, SyncScheduler};
use crate::sync::{ConversationSyncEngine, VisibilityPolicy};
use crate::typing::TypingThrottle;
use crate::version::SDK_VERSION;

/// SDK 配置
#[derive(Debug, Clone)]
pub struct LiveDeskConfig {
    /// 后端地址，如 `http://localhost:5000`
    pub server_url: String,
    /// 推送通道地址，缺省时从 server_url 推导（http → ws + /socket）
    pub push_url: Option<String>,
    /// 推送正常时的兜底轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 推送降级时的轮询间隔（秒）
    pub degraded_poll_interval_secs: u64,
    /// 两次快照刷新之间的最小间隔（毫秒）
    pub min_refresh_interval_ms: u64,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 可见性探测策略
    pub visibility: VisibilityPolicy,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for LiveDeskConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            push_url: None,
            poll_interval_secs: 30,
            degraded_poll_interval_secs: 5,
            min_refresh_interval_ms: 1000,
            http: HttpClientConfig::default(),
            visibility: VisibilityPolicy::default(),
            event_buffer_size: 1000,
            debug_mode: false,
        }
    }
}

impl LiveDeskConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn with_push_url(mut self, push_url: impl Into<String>) -> Self {
        self.push_url = Some(push_url.into());
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_degraded_poll_interval(mut self, secs: u64) -> Self {
        self.degraded_poll_interval_secs = secs;
        self
    }

    pub fn with_min_refresh_interval_ms(mut self, ms: u64) -> Self {
        self.min_refresh_interval_ms = ms;
        self
    }

    pub fn with_visibility(mut self, policy: VisibilityPolicy) -> Self {
        self.visibility = policy;
        self
    }

    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    /// 校验配置并解析推送地址
    pub fn resolve_push_url(&self) -> Result<Url> {
        if let Some(push_url) = &self.push_url {
            return Url::parse(push_url)
                .map_err(|e| LiveDeskSDKError::Config(format!("无效的推送地址: {}", e)));
        }
        let base = Url::parse(&self.server_url)
            .map_err(|e| LiveDeskSDKError::Config(format!("无效的服务端地址: {}", e)))?;
        let scheme = match base.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(LiveDeskSDKError::Config(format!(
                    "不支持的协议: {}",
                    other
                )))
            }
        };
        let host = base
            .host_str()
            .ok_or_else(|| LiveDeskSDKError::Config("服务端地址缺少主机名".to_string()))?;
        let raw = match base.port() {
            Some(port) => format!("{}://{}:{}/socket", scheme, host, port),
            None => format!("{}://{}/socket", scheme, host),
        };
        Url::parse(&raw).map_err(|e| LiveDeskSDKError::Config(format!("推送地址推导失败: {}", e)))
    }
}

/// LiveDesk SDK
///
/// 面向坐席工作台 UI 的门面。内部组合 HTTP 网关、推送通道、
/// 同步引擎和调度器，UI 只和这里的方法与事件流打交道。
pub struct LiveDeskSDK {
    config: LiveDeskConfig,
    gateway: Arc<dyn DeskGateway>,
    push: Arc<dyn PushChannel>,
    engine: ConversationSyncEngine,
    scheduler: SyncScheduler,
    events: Arc<EventManager>,
    /// 坐席自己的输入状态去抖（上行方向）
    outbound_typing: TypingThrottle,
    /// 打开会话的代数计数，用于丢弃陈旧响应
    open_generation: AtomicU64,
    running: RwLock<bool>,
}

impl LiveDeskSDK {
    /// 初始化 SDK
    pub async fn initialize(config: LiveDeskConfig) -> Result<Arc<Self>> {
        info!("🚀 初始化 LiveDesk SDK v{}", SDK_VERSION);

        let push_url = config.resolve_push_url()?;
        let gateway: Arc<dyn DeskGateway> =
            Arc::new(DeskHttpClient::new(&config.server_url, &config.http)?);
        info!("✅ HTTP 网关就绪: {}", config.server_url);

        let push: Arc<dyn PushChannel> =
            Arc::new(WsPushChannel::new(push_url, config.event_buffer_size));
        info!("✅ 推送通道就绪");

        Self::assemble(config, gateway, push).await
    }

    /// 用外部提供的网关和推送通道组装 SDK（测试入口）
    pub(crate) async fn assemble(
        config: LiveDeskConfig,
        gateway: Arc<dyn DeskGateway>,
        push: Arc<dyn PushChannel>,
    ) -> Result<Arc<Self>> {
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let connection = Arc::new(ConnectionStateManager::new());

        let engine = ConversationSyncEngine::new(
            gateway.clone(),
            events.clone(),
            connection,
            Duration::from_millis(config.min_refresh_interval_ms),
            config.visibility.clone(),
        );
        info!("✅ 同步引擎就绪");

        let scheduler = SyncScheduler::new(
            engine.clone(),
            push.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_secs(config.poll_interval_secs),
                degraded_poll_interval: Duration::from_secs(config.degraded_poll_interval_secs),
            },
        );

        info!("✅ SDK 初始化完成");
        Ok(Arc::new(Self {
            config,
            gateway,
            push,
            engine,
            scheduler,
            events,
            outbound_typing: TypingThrottle::default(),
            open_generation: AtomicU64::new(0),
            running: RwLock::new(false),
        }))
    }

    pub fn config(&self) -> &LiveDeskConfig {
        &self.config
    }

    // ========================================================================
    // 登录 / 登出
    // ========================================================================

    /// 坐席登录并启动同步
    ///
    /// 身份以服务端确认的登录响应为准，而不是调用方传入的用户名。
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let session = self.gateway.login(username, password).await?;
        self.engine.set_session(session).await;

        self.scheduler.start().await?;
        self.engine.typing().start_cleanup().await;
        *self.running.write().await = true;

        // 首屏数据：快照失败不阻塞登录，下一个轮询周期会补上
        if let Err(e) = self.engine.force_refresh().await {
            warn!("首次快照拉取失败: {}", e);
        }
        match self.gateway.fetch_settings().await {
            Ok(settings) => self.engine.store_settings(settings).await,
            Err(e) => debug!("设置拉取失败: {}", e),
        }

        info!("✅ 登录完成，同步已启动");
        Ok(())
    }

    /// 登出并停止同步
    pub async fn logout(&self) -> Result<()> {
        self.stop_sync().await;
        // 服务端登出失败不影响本地清理
        if let Err(e) = self.gateway.logout().await {
            debug!("服务端登出失败: {}", e);
        }
        self.engine.clear_session().await;
        self.engine.reset().await;
        info!("已登出");
        Ok(())
    }

    async fn stop_sync(&self) {
        let mut running = self.running.write().await;
        if *running {
            self.scheduler.stop().await;
            self.engine.typing().stop_cleanup().await;
            *running = false;
        }
    }

    /// 关闭 SDK，释放所有后台任务
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_sync().await;
        self.engine.clear_session().await;
        self.engine.reset().await;
        info!("SDK 已关闭");
        Ok(())
    }

    // ========================================================================
    // 会话操作
    // ========================================================================

    /// 打开会话并拉取消息历史
    ///
    /// 快速连续切换会话时，先发出但后返回的请求结果已经陈旧，
    /// 返回 `Ok(None)` 表示本次结果作废，调用方应忽略。
    pub async fn open_conversation(&self, conversation_id: u64) -> Result<Option<Vec<Message>>> {
        let generation = self.open_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.engine.set_active_conversation(Some(conversation_id)).await;

        let messages = self
            .check_auth(self.gateway.fetch_messages(conversation_id).await)
            .await?;

        if self.open_generation.load(Ordering::SeqCst) != generation {
            debug!("会话 {} 的消息结果已陈旧，丢弃", conversation_id);
            return Ok(None);
        }
        Ok(Some(messages))
    }

    /// 关闭主面板会话
    pub async fn close_conversation(&self) {
        self.open_generation.fetch_add(1, Ordering::SeqCst);
        self.engine.set_active_conversation(None).await;
    }

    /// 发送坐席消息
    pub async fn send_message(
        &self,
        conversation_id: u64,
        message: &str,
    ) -> Result<Option<String>> {
        let echoed = self
            .check_auth(self.gateway.send_chat(conversation_id, message).await)
            .await?;
        self.engine
            .note_outgoing_message(conversation_id, message)
            .await;
        Ok(echoed)
    }

    /// 认领会话
    pub async fn claim(&self, conversation_id: u64) -> Result<()> {
        self.check_auth(self.engine.claim(conversation_id).await)
            .await
    }

    /// 把会话交还给 AI
    pub async fn hand_back(&self, conversation_id: u64) -> Result<()> {
        self.check_auth(self.engine.hand_back(conversation_id).await)
            .await
    }

    /// 通知对端坐席正在输入（按会话去抖，通道未连接时静默丢弃）
    pub async fn notify_typing(&self, conversation_id: u64) -> Result<()> {
        if !self.outbound_typing.should_notify(conversation_id).await {
            return Ok(());
        }
        match self.push.send(OutboundFrame::Typing { conversation_id }).await {
            Ok(()) => Ok(()),
            Err(LiveDeskSDKError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // 设置
    // ========================================================================

    pub async fn settings(&self) -> DashboardSettings {
        self.engine.settings().await
    }

    /// 更新 AI 自动回复开关
    pub async fn set_ai_enabled(&self, enabled: bool) -> Result<()> {
        let settings = DashboardSettings {
            ai_enabled: enabled,
        };
        self.check_auth(self.gateway.update_settings(&settings).await)
            .await?;
        self.engine.store_settings(settings).await;
        Ok(())
    }

    // ========================================================================
    // 状态读取与事件订阅
    // ========================================================================

    /// 订阅 SDK 事件流
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<DeskEvent> {
        self.events.subscribe()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.engine.conversations().await
    }

    pub async fn conversation(&self, conversation_id: u64) -> Option<Conversation> {
        self.engine.conversation(conversation_id).await
    }

    pub async fn counts(&self) -> ConversationCounts {
        self.engine.counts().await
    }

    pub async fn current_agent(&self) -> Option<String> {
        self.engine.current_agent().await
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.engine.connection_status().await
    }

    /// 手动触发一次刷新（如 UI 的刷新按钮）
    pub async fn refresh(&self) -> Result<()> {
        self.check_auth(self.engine.force_refresh().await).await
    }

    /// 认证错误的统一处理：停止同步、清理会话、通知 UI 重新登录
    async fn check_auth<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_auth() {
                warn!("❌ 会话已失效: {}", e);
                self.stop_sync().await;
                self.engine.notify_session_expired().await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::tests::MockGateway;
    use crate::push::PushEvent;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct NoopPush {
        sender: broadcast::Sender<PushEvent>,
        sent: std::sync::atomic::AtomicU32,
    }

    impl NoopPush {
        fn new() -> Arc<Self> {
            let (sender, _) = broadcast::channel(16);
            Arc::new(Self {
                sender,
                sent: std::sync::atomic::AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PushChannel for NoopPush {
        async fn start(&self) -> Result<broadcast::Receiver<PushEvent>> {
            Ok(self.sender.subscribe())
        }

        async fn send(&self, _frame: OutboundFrame) -> Result<()> {
            self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {}
    }

    /// 生命周期测试打开日志，便于排查任务启停顺序
    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    async fn sdk_with(gateway: Arc<MockGateway>) -> Arc<LiveDeskSDK> {
        LiveDeskSDK::assemble(LiveDeskConfig::default(), gateway, NoopPush::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_push_url_derivation() {
        let config = LiveDeskConfig::new("http://localhost:5000");
        assert_eq!(
            config.resolve_push_url().unwrap().as_str(),
            "ws://localhost:5000/socket"
        );

        let config = LiveDeskConfig::new("https://desk.example.com");
        assert_eq!(
            config.resolve_push_url().unwrap().as_str(),
            "wss://desk.example.com/socket"
        );

        let config =
            LiveDeskConfig::new("http://localhost:5000").with_push_url("ws://other:9000/push");
        assert_eq!(
            config.resolve_push_url().unwrap().as_str(),
            "ws://other:9000/push"
        );
    }

    #[test]
    fn test_invalid_server_url_rejected() {
        let config = LiveDeskConfig::new("ftp://example.com");
        assert!(config.resolve_push_url().is_err());

        let config = LiveDeskConfig::new("not a url");
        assert!(config.resolve_push_url().is_err());
    }

    #[tokio::test]
    async fn test_login_starts_sync_and_fetches_snapshot() {
        init_test_logging();
        let gateway = Arc::new(MockGateway::default());
        let sdk = sdk_with(gateway.clone()).await;

        sdk.login("alice", "secret").await.unwrap();
        assert_eq!(sdk.current_agent().await.as_deref(), Some("alice"));
        assert!(
            gateway
                .fetch_calls
                .load(std::sync::atomic::Ordering::SeqCst)
                >= 1
        );

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_tears_down_local_state() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![Conversation {
            id: 11,
            participant: "user11".to_string(),
            channel: Default::default(),
            assigned_agent: None,
            latest_message: None,
            visible: true,
            last_updated: None,
        }];
        let sdk = sdk_with(gateway).await;

        sdk.login("alice", "secret").await.unwrap();
        sdk.open_conversation(11).await.unwrap();
        assert_eq!(sdk.conversations().await.len(), 1);

        sdk.logout().await.unwrap();

        // 上一个会话的列表、主面板和身份都不能留给下一个登录者
        assert_eq!(sdk.current_agent().await, None);
        assert!(sdk.conversations().await.is_empty());
        assert_eq!(sdk.counts().await.all, 0);
        assert_eq!(sdk.engine.active_conversation().await, None);
    }

    #[tokio::test]
    async fn test_relogin_after_logout_restarts_sync() {
        init_test_logging();
        let gateway = Arc::new(MockGateway::default());
        let sdk = sdk_with(gateway.clone()).await;

        sdk.login("alice", "secret").await.unwrap();
        sdk.logout().await.unwrap();

        // 同一个 SDK 实例上重新登录必须能恢复同步
        sdk.login("bob", "secret").await.unwrap();
        assert_eq!(sdk.current_agent().await.as_deref(), Some("bob"));
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_conversation_invalidates_open() {
        let gateway = Arc::new(MockGateway::default());
        let sdk = sdk_with(gateway).await;

        // 打开后立即关闭，代数前进，后续的打开结果仍然有效
        let messages = sdk.open_conversation(1).await.unwrap();
        assert!(messages.is_some());
        sdk.close_conversation().await;

        let messages = sdk.open_conversation(2).await.unwrap();
        assert!(messages.is_some());
        assert_eq!(sdk.engine.active_conversation().await, Some(2));
    }

    #[tokio::test]
    async fn test_notify_typing_debounced() {
        let gateway = Arc::new(MockGateway::default());
        let push = NoopPush::new();
        let sdk = LiveDeskSDK::assemble(LiveDeskConfig::default(), gateway, push.clone())
            .await
            .unwrap();

        sdk.notify_typing(1).await.unwrap();
        sdk.notify_typing(1).await.unwrap();
        sdk.notify_typing(2).await.unwrap();

        // 去抖窗口内同一会话只发一帧
        assert_eq!(push.sent.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_message_updates_preview() {
        let gateway = Arc::new(MockGateway::default());
        *gateway.conversations.lock() = vec![Conversation {
            id: 4,
            participant: "user4".to_string(),
            channel: Default::default(),
            assigned_agent: None,
            latest_message: None,
            visible: true,
            last_updated: None,
        }];
        let sdk = sdk_with(gateway).await;
        sdk.login("alice", "secret").await.unwrap();

        sdk.send_message(4, "您好，请问有什么可以帮您？").await.unwrap();
        assert_eq!(
            sdk.conversation(4).await.unwrap().latest_message.as_deref(),
            Some("您好，请问有什么可以帮您？")
        );

        sdk.shutdown().await.unwrap();
    }
}
