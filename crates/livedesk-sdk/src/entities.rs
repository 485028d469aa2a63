//! 核心实体定义
//!
//! 包括：
//! - 会话（Conversation）：客服工作台列表里的一行
//! - 消息（Message）：会话内一条聊天记录
//! - 坐席会话（AgentSession）：登录后服务端确认的坐席身份
//! - 会话计数（ConversationCounts）：列表上方的聚合数字
//! - 工作台设置（DashboardSettings）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{de_opt_timestamp, de_u64_lenient};

/// 接入渠道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Whatsapp,
    Telegram,
    #[default]
    Webchat,
    Sms,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Whatsapp => write!(f, "whatsapp"),
            ChannelKind::Telegram => write!(f, "telegram"),
            ChannelKind::Webchat => write!(f, "webchat"),
            ChannelKind::Sms => write!(f, "sms"),
        }
    }
}

/// 消息发送方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    Agent,
}

/// 会话（聊天线程）
///
/// `id` 由服务端分配，线程生命周期内稳定。
/// `visible` 是服务端的就绪门闩：新会话在后端置备完成前可能已经出现在
/// 推送事件里，但还不允许出现在主聊天面板中；老的快照接口不返回该字段，
/// 缺省按可见处理。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(deserialize_with = "de_u64_lenient")]
    pub id: u64,
    /// 对端显示名（终端用户）
    #[serde(rename = "username")]
    pub participant: String,
    /// 接入渠道
    #[serde(default)]
    pub channel: ChannelKind,
    /// 当前认领坐席；None 表示未认领（AI 托管）
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// 最近一条消息的预览文本
    #[serde(default, rename = "latest_message")]
    pub latest_message: Option<String>,
    /// 服务端就绪门闩
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// 最后更新时间（用于列表排序）
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_visible() -> bool {
    true
}

impl Conversation {
    /// 是否未认领（AI 托管中）
    pub fn is_unassigned(&self) -> bool {
        self.assigned_agent.is_none()
    }

    /// 是否由指定坐席认领
    pub fn is_assigned_to(&self, agent: &str) -> bool {
        self.assigned_agent.as_deref() == Some(agent)
    }
}

/// 会话内一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub sender: Sender,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// 登录后服务端确认的坐席身份
///
/// 坐席身份的唯一权威源。本地任何缓存（拼写可能过期）都不作数，
/// 认领归属判断一律以这里的 `username` 为准。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub username: String,
    /// 登录时刻（UNIX 秒）
    pub logged_in_at: u64,
}

/// 会话列表聚合计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationCounts {
    /// 未认领
    pub unassigned: usize,
    /// 认领给当前坐席
    pub mine: usize,
    /// 认领给其他坐席
    pub team: usize,
    /// 全部
    pub all: usize,
}

/// 工作台设置
///
/// 后端把 `ai_enabled` 序列化成 `"1"` / `"0"` 字符串（历史包袱），
/// 新接口偶尔直接给 bool，两种都接受；我们发出去时写字符串保持兼容。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSettings {
    #[serde(with = "ai_flag")]
    pub ai_enabled: bool,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self { ai_enabled: true }
    }
}

mod ai_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "1" } else { "0" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::Bool(b) => Ok(*b),
            serde_json::Value::String(s) => Ok(s == "1" || s.eq_ignore_ascii_case("true")),
            serde_json::Value::Number(n) => Ok(n.as_i64() == Some(1)),
            other => Err(serde::de::Error::custom(format!(
                "无效的 ai_enabled 值: {}",
                other
            ))),
        }
    }
}
