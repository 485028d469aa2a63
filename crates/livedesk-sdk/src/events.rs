//! 事件系统模块 - 工作台 UI 的订阅出口
//!
//! 功能包括：
//! - 会话列表变更事件（计数 + 列表重渲染的触发源）
//! - 主面板新消息事件（已通过可见性门闩）
//! - 认领确认 / 认领被拒事件
//! - 连接状态变更、设置变更、输入状态事件
//! - 事件广播和订阅机制
//!
//! SDK 不做任何渲染；UI 层订阅本模块的广播流，把事件投影成界面更新。

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection_state::ConnectionStatus;
use crate::entities::{ConversationCounts, Sender};
use crate::utils::now_ts;

/// SDK 对外事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeskEvent {
    /// 会话列表发生变化（快照对账或单条补丁之后）
    ConversationListChanged {
        counts: ConversationCounts,
        timestamp: u64,
    },
    /// 主面板新消息（仅当目标会话可见时才会发出）
    ActiveMessageArrived {
        conversation_id: u64,
        sender: Sender,
        message: String,
        timestamp: u64,
    },
    /// 认领成功（服务端确认）
    ClaimConfirmed {
        conversation_id: u64,
        agent: String,
        timestamp: u64,
    },
    /// 认领被服务端拒绝，本地乐观状态已回滚
    ClaimRejected {
        conversation_id: u64,
        error: String,
        timestamp: u64,
    },
    /// 连接状态变更
    ConnectionChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        timestamp: u64,
    },
    /// 工作台设置变更
    SettingsChanged { ai_enabled: bool, timestamp: u64 },
    /// 对端正在输入
    TypingIndicator {
        conversation_id: u64,
        agent: Option<String>,
        timestamp: u64,
    },
    /// 会话失效，需要重新登录（同步已停止）
    SessionExpired { timestamp: u64 },
    /// 瞬态同步错误（可忽略的提示条，下一个周期会自愈）
    SyncError { message: String, timestamp: u64 },
}

impl DeskEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            DeskEvent::ConversationListChanged { .. } => "conversation_list_changed",
            DeskEvent::ActiveMessageArrived { .. } => "active_message_arrived",
            DeskEvent::ClaimConfirmed { .. } => "claim_confirmed",
            DeskEvent::ClaimRejected { .. } => "claim_rejected",
            DeskEvent::ConnectionChanged { .. } => "connection_changed",
            DeskEvent::SettingsChanged { .. } => "settings_changed",
            DeskEvent::TypingIndicator { .. } => "typing_indicator",
            DeskEvent::SessionExpired { .. } => "session_expired",
            DeskEvent::SyncError { .. } => "sync_error",
        }
    }

    /// 获取事件关联的会话 ID
    pub fn conversation_id(&self) -> Option<u64> {
        match self {
            DeskEvent::ActiveMessageArrived {
                conversation_id, ..
            }
            | DeskEvent::ClaimConfirmed {
                conversation_id, ..
            }
            | DeskEvent::ClaimRejected {
                conversation_id, ..
            }
            | DeskEvent::TypingIndicator {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            DeskEvent::ConversationListChanged { timestamp, .. }
            | DeskEvent::ActiveMessageArrived { timestamp, .. }
            | DeskEvent::ClaimConfirmed { timestamp, .. }
            | DeskEvent::ClaimRejected { timestamp, .. }
            | DeskEvent::ConnectionChanged { timestamp, .. }
            | DeskEvent::SettingsChanged { timestamp, .. }
            | DeskEvent::TypingIndicator { timestamp, .. }
            | DeskEvent::SessionExpired { timestamp }
            | DeskEvent::SyncError { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
///
/// 基于 tokio broadcast 的多订阅者广播。无订阅者时 send 会失败，
/// 属正常场景（如纯后台同步、无 UI），仅打 debug。
pub struct EventManager {
    sender: broadcast::Sender<DeskEvent>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: DeskEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<DeskEvent> {
        self.sender.subscribe()
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    /// 创建会话列表变更事件
    pub fn conversation_list_changed(counts: ConversationCounts) -> DeskEvent {
        DeskEvent::ConversationListChanged {
            counts,
            timestamp: now_ts(),
        }
    }

    /// 创建连接状态变更事件
    pub fn connection_changed(old_status: ConnectionStatus, new_status: ConnectionStatus) -> DeskEvent {
        DeskEvent::ConnectionChanged {
            old_status,
            new_status,
            timestamp: now_ts(),
        }
    }

    /// 创建瞬态同步错误事件
    pub fn sync_error(message: impl Into<String>) -> DeskEvent {
        DeskEvent::SyncError {
            message: message.into(),
            timestamp: now_ts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);

        let mut receiver = manager.subscribe();

        let event = event_builders::conversation_list_changed(ConversationCounts {
            unassigned: 1,
            mine: 0,
            team: 1,
            all: 2,
        });
        manager.emit(event).await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "conversation_list_changed");

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 1);
        assert_eq!(
            stats.events_by_type.get("conversation_list_changed"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = EventManager::new(100);

        let mut receiver1 = manager.subscribe();
        let mut receiver2 = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 2);

        manager
            .emit(event_builders::sync_error("snapshot fetch failed"))
            .await;

        // 两个订阅者都应该收到事件
        assert_eq!(receiver1.recv().await.unwrap().event_type(), "sync_error");
        assert_eq!(receiver2.recv().await.unwrap().event_type(), "sync_error");
    }

    #[tokio::test]
    async fn test_event_properties() {
        let event = DeskEvent::ClaimRejected {
            conversation_id: 10,
            error: "already assigned".to_string(),
            timestamp: now_ts(),
        };
        assert_eq!(event.event_type(), "claim_rejected");
        assert_eq!(event.conversation_id(), Some(10));
        assert!(event.timestamp() > 0);

        let event = event_builders::sync_error("oops");
        assert_eq!(event.conversation_id(), None);
    }
}
