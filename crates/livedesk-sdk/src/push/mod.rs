//! 推送通道模块
//!
//! 功能包括：
//! - 服务端推送事件的解析（`{"event": ..., "data": ...}` 帧格式）
//! - 推送通道抽象（`PushChannel` trait）
//! - WebSocket 推送实现和重连退避
//!
//! 推送事件是提示性的，不携带服务端序号：收到事件后通过快照刷新
//! 对账，而不是直接把事件内容当作权威状态。

pub mod backoff;
pub mod ws;

pub use backoff::{BackoffConfig, ReconnectBackoff, ReconnectThrottled};
pub use ws::WsPushChannel;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::entities::Sender;
use crate::error::Result;
use crate::utils::value_to_u64;

/// 服务端推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// 某会话有新消息
    NewMessage {
        conversation_id: u64,
        message: String,
        sender: Sender,
    },
    /// 会话被某坐席认领
    Handoff {
        conversation_id: u64,
        agent: Option<String>,
    },
    /// 会话被交还给 AI
    Handback { conversation_id: u64 },
    /// 服务端要求刷新会话列表
    RefreshConversations,
    /// 工作台设置被更新
    SettingsUpdated { ai_enabled: bool },
    /// 对端正在输入
    Typing {
        conversation_id: u64,
        agent: Option<String>,
    },
    /// 通道首次建立
    Connected,
    /// 通道断开
    Disconnected,
    /// 通道断开后重新建立
    Reconnected,
}

/// 解析一帧推送文本
///
/// 未知事件名返回 `Ok(None)`，字段缺失或类型错误返回 `InvalidData`。
pub fn parse_frame(text: &str) -> Result<Option<PushEvent>> {
    let frame: Value = serde_json::from_str(text)?;
    let name = match frame.get("event").and_then(|v| v.as_str()) {
        Some(name) => name,
        None => {
            return Err(crate::error::LiveDeskSDKError::InvalidData(
                "推送帧缺少 event 字段".to_string(),
            ))
        }
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let event = match name {
        "new_message" => {
            let conversation_id = require_conversation_id(&data)?;
            let message = data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let sender = data
                .get("sender")
                .and_then(|v| serde_json::from_value::<Sender>(v.clone()).ok())
                .unwrap_or(Sender::User);
            Some(PushEvent::NewMessage {
                conversation_id,
                message,
                sender,
            })
        }
        "handoff" => Some(PushEvent::Handoff {
            conversation_id: require_conversation_id(&data)?,
            agent: opt_string(&data, "agent"),
        }),
        "handback" | "handback_to_ai" => Some(PushEvent::Handback {
            conversation_id: require_conversation_id(&data)?,
        }),
        "refresh_conversations" => Some(PushEvent::RefreshConversations),
        "settings_updated" => {
            let ai_enabled = match data.get("ai_enabled") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s == "1" || s == "true",
                Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
                _ => {
                    return Err(crate::error::LiveDeskSDKError::InvalidData(
                        "settings_updated 缺少 ai_enabled".to_string(),
                    ))
                }
            };
            Some(PushEvent::SettingsUpdated { ai_enabled })
        }
        "typing" => Some(PushEvent::Typing {
            conversation_id: require_conversation_id(&data)?,
            agent: opt_string(&data, "agent"),
        }),
        other => {
            debug!("忽略未知推送事件: {}", other);
            None
        }
    };
    Ok(event)
}

fn require_conversation_id(data: &Value) -> Result<u64> {
    data.get("conversation_id")
        .and_then(value_to_u64)
        .ok_or_else(|| {
            crate::error::LiveDeskSDKError::InvalidData(
                "推送帧缺少 conversation_id".to_string(),
            )
        })
}

fn opt_string(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// 上行帧（客户端 → 服务端）
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// 坐席正在输入
    Typing { conversation_id: u64 },
}

impl OutboundFrame {
    /// 编码成与下行一致的 `{"event", "data"}` 帧格式
    pub fn encode(&self) -> String {
        match self {
            OutboundFrame::Typing { conversation_id } => serde_json::json!({
                "event": "typing",
                "data": { "conversation_id": conversation_id }
            })
            .to_string(),
        }
    }
}

/// 推送通道抽象
///
/// 实现负责自己的连接生命周期（含重连），通过 broadcast 向外分发事件。
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// 启动通道，返回事件接收端
    async fn start(&self) -> Result<broadcast::Receiver<PushEvent>>;

    /// 发送一帧上行消息
    async fn send(&self, frame: OutboundFrame) -> Result<()>;

    /// 停止通道
    async fn stop(&self);
}
