//! 可见性门闩
//!
//! 新会话的首条消息可能先于快照到达：推送说会话 5 有消息了，
//! 但本地还不知道会话 5 是否对当前坐席可见。这里做有界等待，
//! 轮询服务端的可见性接口，直到可见或尝试次数用尽。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::http_client::DeskGateway;

/// 可见性探测策略
#[derive(Debug, Clone)]
pub struct VisibilityPolicy {
    /// 最大探测次数
    pub max_attempts: u32,
    /// 两次探测之间的间隔
    pub retry_interval: Duration,
}

impl Default for VisibilityPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// 可见性门闩
pub struct VisibilityGate {
    gateway: Arc<dyn DeskGateway>,
    policy: VisibilityPolicy,
}

impl VisibilityGate {
    pub fn new(gateway: Arc<dyn DeskGateway>, policy: VisibilityPolicy) -> Self {
        Self { gateway, policy }
    }

    /// 等待会话对当前坐席可见
    ///
    /// 返回 `Ok(true)` 表示可见，`Ok(false)` 表示尝试次数用尽仍不可见。
    /// 认证错误直接上抛（会话已失效，继续探测没有意义），其余错误
    /// 计为一次失败的尝试。
    pub async fn wait_until_visible(&self, conversation_id: u64) -> Result<bool> {
        for attempt in 1..=self.policy.max_attempts {
            match self.gateway.check_visibility(conversation_id).await {
                Ok(true) => {
                    debug!(
                        "会话 {} 在第 {} 次探测后可见",
                        conversation_id, attempt
                    );
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    debug!("可见性探测失败 (第 {} 次): {}", attempt, e);
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.retry_interval).await;
            }
        }
        warn!(
            "⚠️ 会话 {} 在 {} 次探测后仍不可见，放弃路由",
            conversation_id, self.policy.max_attempts
        );
        Ok(false)
    }
}
