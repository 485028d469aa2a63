//! 会话同步模块
//!
//! 功能包括：
//! - 本地会话状态（快照对账 + 推送补丁）
//! - 同步引擎（刷新合并、乐观认领、推送事件处理）
//! - 可见性门闩（主面板消息路由前的有界等待）

pub mod engine;
pub mod state;
pub mod visibility;

pub use engine::ConversationSyncEngine;
pub use state::SyncState;
pub use visibility::{VisibilityGate, VisibilityPolicy};
