//! 输入状态节流模块
//!
//! 功能包括：
//! - 对端输入事件的去抖（同一会话短时间内只发一次提示）
//! - 输入状态的自动过期清理
//!
//! 推送通道里的 typing 事件很密集（每次按键都可能触发一条），
//! 不做节流会把事件流刷爆。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// 节流配置
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// 同一会话两次提示之间的最小间隔
    pub debounce: Duration,
    /// 输入状态多久未刷新后自动清理
    pub auto_clear: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            auto_clear: Duration::from_secs(5),
        }
    }
}

/// 输入状态节流器
pub struct TypingThrottle {
    config: TypingConfig,
    last_notified: Arc<RwLock<HashMap<u64, Instant>>>,
    cleanup_task: RwLock<Option<JoinHandle<()>>>,
}

impl TypingThrottle {
    pub fn new(config: TypingConfig) -> Self {
        Self {
            config,
            last_notified: Arc::new(RwLock::new(HashMap::new())),
            cleanup_task: RwLock::new(None),
        }
    }

    /// 判断该会话的输入事件是否应该向外通知
    pub async fn should_notify(&self, conversation_id: u64) -> bool {
        let mut map = self.last_notified.write().await;
        let now = Instant::now();
        match map.get(&conversation_id) {
            Some(last) if now.duration_since(*last) < self.config.debounce => false,
            _ => {
                map.insert(conversation_id, now);
                true
            }
        }
    }

    /// 清除某会话的输入状态（如收到正式消息后）
    pub async fn clear(&self, conversation_id: u64) {
        self.last_notified.write().await.remove(&conversation_id);
    }

    /// 启动过期清理任务
    pub async fn start_cleanup(&self) {
        let map = self.last_notified.clone();
        let auto_clear = self.config.auto_clear;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(auto_clear);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut map = map.write().await;
                let before = map.len();
                map.retain(|_, last| now.duration_since(*last) < auto_clear);
                if map.len() < before {
                    debug!("清理了 {} 个过期输入状态", before - map.len());
                }
            }
        });
        *self.cleanup_task.write().await = Some(handle);
    }

    /// 停止清理任务
    pub async fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup_task.write().await.take() {
            handle.abort();
        }
    }
}

impl Default for TypingThrottle {
    fn default() -> Self {
        Self::new(TypingConfig::default())
    }
}
