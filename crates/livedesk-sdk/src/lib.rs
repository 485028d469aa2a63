//! # LiveDesk SDK
//!
//! 面向客服坐席工作台的无头同步 SDK。维护一份最终一致的本地会话视图：
//! 以服务端快照为权威，推送事件做即时补丁，兜底轮询兜住漏掉的推送。
//!
//! ## 核心特性
//!
//! - 📋 **快照对账**: 会话列表以服务端快照为准，推送只是提示
//! - ⚡ **推送补丁**: 已知会话就地更新预览/归属，未知会话触发刷新
//! - 🙋 **乐观认领**: 认领立即生效，服务端拒绝后自动回滚
//! - 👁 **可见性门闩**: 新会话首条消息等可见性确认后再进主面板
//! - 🔄 **断线自愈**: 指数退避重连，恢复后自动补偿全量刷新
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use livedesk_sdk::sdk::{LiveDeskConfig, LiveDeskSDK};
//! use livedesk_sdk::events::DeskEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LiveDeskConfig::new("http://localhost:5000");
//!     let sdk = LiveDeskSDK::initialize(config).await?;
//!
//!     sdk.login("alice", "secret").await?;
//!
//!     let mut events = sdk.subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             DeskEvent::ConversationListChanged { counts, .. } => {
//!                 println!("未分配: {} / 我的: {}", counts.unassigned, counts.mine);
//!             }
//!             DeskEvent::ActiveMessageArrived { message, .. } => {
//!                 println!("新消息: {}", message);
//!             }
//!             DeskEvent::SessionExpired { .. } => break,
//!             _ => {}
//!         }
//!     }
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod connection_state;
pub mod entities;
pub mod error;
pub mod events;
pub mod http_client;
pub mod push;
pub mod scheduler;
pub mod sdk;
pub mod sync;
pub mod typing;
pub mod utils;
pub mod version;

// 常用类型的便捷导出
pub use connection_state::ConnectionStatus;
pub use entities::{
    AgentSession, ChannelKind, Conversation, ConversationCounts, DashboardSettings, Message,
    Sender,
};
pub use error::{LiveDeskSDKError, Result};
pub use events::{DeskEvent, EventManager};
pub use sdk::{LiveDeskConfig, LiveDeskSDK};
pub use sync::ConversationSyncEngine;
pub use version::SDK_VERSION;
