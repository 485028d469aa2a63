//! 同步调度器
//!
//! 功能包括：
//! - 推送事件的消费与分发（交给同步引擎处理）
//! - 兜底轮询（已连接时慢轮询，降级时快轮询）
//! - 认证失效时停止同步并通知上层
//!
//! 轮询是兜底而不是主路径：推送正常时轮询只是兜住漏掉的事件。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::push::PushChannel;
use crate::sync::ConversationSyncEngine;

/// 调度配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 推送正常时的轮询间隔
    pub poll_interval: Duration,
    /// 推送降级时的轮询间隔
    pub degraded_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            degraded_poll_interval: Duration::from_secs(5),
        }
    }
}

/// 同步调度器
pub struct SyncScheduler {
    engine: ConversationSyncEngine,
    push: Arc<dyn PushChannel>,
    config: SchedulerConfig,
    push_task: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        engine: ConversationSyncEngine,
        push: Arc<dyn PushChannel>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            push,
            config,
            push_task: Mutex::new(None),
            poll_task: Mutex::new(None),
        }
    }

    /// 启动推送消费任务和兜底轮询任务
    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.push.start().await?;

        let engine = self.engine.clone();
        let push_handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(e) = engine.handle_push_event(event).await {
                            if e.is_auth() {
                                warn!("❌ 会话已失效，停止推送处理");
                                engine.notify_session_expired().await;
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // 消费不过来时事件被挤掉，用一次全量刷新兜底
                        warn!("⚠️ 推送消费滞后，丢弃 {} 条事件", n);
                        let _ = engine.refresh().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("推送通道已关闭，退出消费任务");
                        break;
                    }
                }
            }
        });
        *self.push_task.lock().await = Some(push_handle);

        let engine = self.engine.clone();
        let config = self.config.clone();
        let poll_handle = tokio::spawn(async move {
            loop {
                let interval = if engine.connection_status().await.is_degraded() {
                    config.degraded_poll_interval
                } else {
                    config.poll_interval
                };
                tokio::time::sleep(interval).await;

                if let Err(e) = engine.refresh().await {
                    if e.is_auth() {
                        warn!("❌ 会话已失效，停止兜底轮询");
                        engine.notify_session_expired().await;
                        break;
                    }
                    // 其他错误等下一个周期自愈
                }
            }
        });
        *self.poll_task.lock().await = Some(poll_handle);

        info!(
            "✅ 同步调度器已启动 (轮询 {:?} / 降级 {:?})",
            self.config.poll_interval, self.config.degraded_poll_interval
        );
        Ok(())
    }

    /// 停止所有同步任务
    pub async fn stop(&self) {
        if let Some(handle) = self.push_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        self.engine.abort_probes().await;
        self.push.stop().await;
        info!("同步调度器已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_state::ConnectionStateManager;
    use crate::events::EventManager;
    use crate::http_client::tests::MockGateway;
    use crate::push::PushEvent;
    use crate::sync::VisibilityPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    struct StubPush {
        sender: broadcast::Sender<PushEvent>,
    }

    impl StubPush {
        fn new() -> (Arc<Self>, broadcast::Sender<PushEvent>) {
            let (sender, _) = broadcast::channel(16);
            (
                Arc::new(Self {
                    sender: sender.clone(),
                }),
                sender,
            )
        }
    }

    #[async_trait]
    impl PushChannel for StubPush {
        async fn start(&self) -> Result<broadcast::Receiver<PushEvent>> {
            Ok(self.sender.subscribe())
        }

        async fn send(&self, _frame: crate::push::OutboundFrame) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn engine_with(gateway: Arc<MockGateway>) -> ConversationSyncEngine {
        ConversationSyncEngine::new(
            gateway,
            Arc::new(EventManager::new(64)),
            Arc::new(ConnectionStateManager::new()),
            Duration::from_millis(0),
            VisibilityPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cadence_follows_connection_state() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine_with(gateway.clone());
        let (push, sender) = StubPush::new();

        let scheduler = SyncScheduler::new(engine.clone(), push, SchedulerConfig::default());
        scheduler.start().await.unwrap();

        // 默认断开状态走降级轮询 (5s)
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert!(gateway.fetch_calls.load(Ordering::SeqCst) >= 1);

        // 连接建立后改走慢轮询 (30s)
        sender.send(PushEvent::Connected).unwrap();
        tokio::task::yield_now().await;
        // 已排定的降级周期还会触发最后一次，等它过去再取基准
        tokio::time::sleep(Duration::from_millis(5500)).await;
        let baseline = gateway.fetch_calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.fetch_calls.load(Ordering::SeqCst), baseline);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(gateway.fetch_calls.load(Ordering::SeqCst) > baseline);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_events_routed_to_engine() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine_with(gateway.clone());
        let (push, sender) = StubPush::new();

        let scheduler = SyncScheduler::new(engine.clone(), push, SchedulerConfig::default());
        scheduler.start().await.unwrap();

        sender.send(PushEvent::RefreshConversations).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(gateway.fetch_calls.load(Ordering::SeqCst) >= 1);
        scheduler.stop().await;
    }
}
