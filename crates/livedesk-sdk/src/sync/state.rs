//! 本地会话状态
//!
//! 功能包括：
//! - 会话快照的全量对账（快照是权威，整体替换本地集合）
//! - 推送补丁的就地更新（预览文本、归属、可见性）
//! - 乐观认领与回滚
//! - 分组计数与排序列表
//!
//! 纯数据结构，不做 IO；并发控制由上层引擎的锁负责。

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use crate::connection_state::ConnectionStatus;
use crate::entities::{Conversation, ConversationCounts};

/// 本地会话状态
#[derive(Debug, Default)]
pub struct SyncState {
    conversations: HashMap<u64, Conversation>,
    /// 当前在主面板打开的会话
    pub active_conversation_id: Option<u64>,
    /// 最近一次成功对账的时刻
    pub last_reconcile_at: Option<Instant>,
    /// 推送通道状态的本地镜像（决定轮询节奏）
    pub connection_status: ConnectionStatus,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用服务端快照全量对账
    ///
    /// 快照里没有的会话被移除（已关闭或不可见），重复对账是幂等的。
    pub fn reconcile_snapshot(&mut self, snapshot: Vec<Conversation>) {
        let mut next = HashMap::with_capacity(snapshot.len());
        for conv in snapshot {
            next.insert(conv.id, conv);
        }
        debug!(
            "快照对账: {} -> {} 个会话",
            self.conversations.len(),
            next.len()
        );
        self.conversations = next;
        self.last_reconcile_at = Some(Instant::now());
    }

    /// 补丁更新已知会话的预览文本，返回该会话是否存在
    pub fn patch_preview(&mut self, conversation_id: u64, message: &str) -> bool {
        match self.conversations.get_mut(&conversation_id) {
            Some(conv) => {
                conv.latest_message = Some(message.to_string());
                conv.last_updated = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// 补丁更新已知会话的归属，返回该会话是否存在
    pub fn set_assignment(&mut self, conversation_id: u64, agent: Option<String>) -> bool {
        match self.conversations.get_mut(&conversation_id) {
            Some(conv) => {
                conv.assigned_agent = agent;
                true
            }
            None => false,
        }
    }

    /// 乐观认领：立即把归属改成自己，返回之前的归属（用于回滚）
    ///
    /// 会话不存在时返回 None 的外层 None。
    pub fn apply_local_claim(
        &mut self,
        conversation_id: u64,
        agent: &str,
    ) -> Option<Option<String>> {
        self.conversations.get_mut(&conversation_id).map(|conv| {
            let previous = conv.assigned_agent.take();
            conv.assigned_agent = Some(agent.to_string());
            previous
        })
    }

    /// 标记会话可见
    pub fn mark_visible(&mut self, conversation_id: u64) -> bool {
        match self.conversations.get_mut(&conversation_id) {
            Some(conv) => {
                conv.visible = true;
                true
            }
            None => false,
        }
    }

    /// 清空全部本地状态（登出时调用，下个登录会话从零开始）
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.active_conversation_id = None;
        self.last_reconcile_at = None;
    }

    /// 获取单个会话
    pub fn conversation(&self, conversation_id: u64) -> Option<&Conversation> {
        self.conversations.get(&conversation_id)
    }

    /// 会话总数
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// 按最近更新时间倒序的会话列表（时间相同或缺失时按 ID 倒序）
    pub fn conversation_list(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .values()
            .filter(|c| c.visible)
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| b.id.cmp(&a.id))
        });
        list
    }

    /// 分组计数
    ///
    /// - unassigned: 无归属
    /// - mine: 归属于当前坐席
    /// - team: 归属于其他坐席
    /// - all: 可见会话总数
    pub fn counts(&self, current_agent: Option<&str>) -> ConversationCounts {
        let mut counts = ConversationCounts::default();
        for conv in self.conversations.values().filter(|c| c.visible) {
            counts.all += 1;
            match (&conv.assigned_agent, current_agent) {
                (None, _) => counts.unassigned += 1,
                (Some(agent), Some(me)) if agent == me => counts.mine += 1,
                (Some(_), _) => counts.team += 1,
            }
        }
        counts
    }

    /// 消息是否应该进入当前主面板
    pub fn should_display_in_active_panel(&self, conversation_id: u64) -> bool {
        self.active_conversation_id == Some(conversation_id)
            && self
                .conversations
                .get(&conversation_id)
                .map(|c| c.visible)
                .unwrap_or(false)
    }
}
