//! 连接状态管理模块
//!
//! 功能包括：
//! - 推送通道连接状态跟踪（断开/连接中/已连接/重连中）
//! - 状态转换时间记录
//! - 推送事件计数统计
//!
//! 连接状态决定兜底轮询的节奏：已连接时慢轮询，降级时快轮询。

use std::sync::Arc;
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// 推送通道连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

impl ConnectionStatus {
    /// 是否处于降级模式（推送不可靠，轮询需要提速）
    pub fn is_degraded(&self) -> bool {
        !matches!(self, ConnectionStatus::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
        }
    }
}

#[derive(Debug)]
struct ConnectionStateInner {
    status: ConnectionStatus,
    connected_at: Option<Instant>,
    last_change_at: Option<Instant>,
    events_received: u64,
}

/// 连接状态管理器
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    inner: Arc<RwLock<ConnectionStateInner>>,
}

impl ConnectionStateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConnectionStateInner {
                status: ConnectionStatus::Disconnected,
                connected_at: None,
                last_change_at: None,
                events_received: 0,
            })),
        }
    }

    /// 获取当前连接状态
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    /// 设置连接状态，返回旧状态（状态未变化时返回 None）
    pub async fn transition(&self, new_status: ConnectionStatus) -> Option<ConnectionStatus> {
        let mut inner = self.inner.write().await;
        if inner.status == new_status {
            return None;
        }
        let old = inner.status;
        inner.status = new_status;
        inner.last_change_at = Some(Instant::now());
        if new_status == ConnectionStatus::Connected {
            inner.connected_at = Some(Instant::now());
        }
        debug!("连接状态变更: {} -> {}", old, new_status);
        Some(old)
    }

    /// 记录一次收到的推送事件
    pub async fn record_event(&self) {
        self.inner.write().await.events_received += 1;
    }

    /// 获取收到的推送事件总数
    pub async fn events_received(&self) -> u64 {
        self.inner.read().await.events_received
    }

    /// 获取连接摘要（用于调试日志）
    pub async fn summary(&self) -> String {
        let inner = self.inner.read().await;
        let uptime = inner
            .connected_at
            .map(|t| format!("{}s", t.elapsed().as_secs()))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "status={} uptime={} events={}",
            inner.status, uptime, inner.events_received
        )
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transition_returns_old_status() {
        let manager = ConnectionStateManager::new();
        assert_eq!(manager.status().await, ConnectionStatus::Disconnected);

        let old = manager.transition(ConnectionStatus::Connecting).await;
        assert_eq!(old, Some(ConnectionStatus::Disconnected));

        let old = manager.transition(ConnectionStatus::Connected).await;
        assert_eq!(old, Some(ConnectionStatus::Connecting));
        assert_eq!(manager.status().await, ConnectionStatus::Connected);

        // 重复设置相同状态不触发变更
        assert_eq!(manager.transition(ConnectionStatus::Connected).await, None);
    }

    #[tokio::test]
    async fn test_degraded_detection() {
        assert!(ConnectionStatus::Disconnected.is_degraded());
        assert!(ConnectionStatus::Reconnecting.is_degraded());
        assert!(!ConnectionStatus::Connected.is_degraded());
    }

    #[tokio::test]
    async fn test_event_counter() {
        let manager = ConnectionStateManager::new();
        manager.record_event().await;
        manager.record_event().await;
        assert_eq!(manager.events_received().await, 2);
    }
}
