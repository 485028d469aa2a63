//! 重连退避限流器
//!
//! 功能包括：
//! - 指数退避的重连间隔（1s → 2s → 4s → ... → 15s 封顶）
//! - 连接稳定一段时间后懒重置回初始间隔
//! - 退避统计信息

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// 重连被限流
#[derive(Debug, Error)]
#[error("重连过于频繁，需等待 {wait:?}")]
pub struct ReconnectThrottled {
    /// 距离下次允许重连的剩余时间
    pub wait: Duration,
}

/// 退避配置
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 初始重连间隔
    pub initial_interval: Duration,
    /// 最大重连间隔
    pub max_interval: Duration,
    /// 间隔增长倍数
    pub multiplier: f64,
    /// 连接稳定多久后重置间隔
    pub reset_after_success: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            multiplier: 2.0,
            reset_after_success: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    current_interval: Duration,
    last_attempt_at: Option<Instant>,
    last_success_at: Option<Instant>,
    attempt_count: u64,
}

/// 重连退避限流器
///
/// 使用 parking_lot 锁而非异步锁：临界区只做时间比较，不跨 await。
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    state: RwLock<BackoffState>,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial = config.initial_interval;
        Self {
            config,
            state: RwLock::new(BackoffState {
                current_interval: initial,
                last_attempt_at: None,
                last_success_at: None,
                attempt_count: 0,
            }),
        }
    }

    /// 检查当前是否允许重连
    pub fn check_reconnect(&self) -> Result<(), ReconnectThrottled> {
        self.maybe_reset();
        let state = self.state.read();
        if let Some(last) = state.last_attempt_at {
            let elapsed = last.elapsed();
            if elapsed < state.current_interval {
                return Err(ReconnectThrottled {
                    wait: state.current_interval - elapsed,
                });
            }
        }
        Ok(())
    }

    /// 记录一次重连尝试，递增下次的间隔
    pub fn record_attempt(&self) {
        let mut state = self.state.write();
        state.last_attempt_at = Some(Instant::now());
        state.attempt_count += 1;
        let next = state.current_interval.mul_f64(self.config.multiplier);
        state.current_interval = next.min(self.config.max_interval);
        debug!(
            "重连尝试 #{}, 下次间隔: {:?}",
            state.attempt_count, state.current_interval
        );
    }

    /// 记录连接成功
    ///
    /// 间隔不会立即重置，要等连接稳定 `reset_after_success` 之后，
    /// 避免"连上就掉"的场景绕过退避。
    pub fn record_success(&self) {
        self.state.write().last_success_at = Some(Instant::now());
    }

    /// 当前退避间隔
    pub fn current_interval(&self) -> Duration {
        self.maybe_reset();
        self.state.read().current_interval
    }

    /// 累计尝试次数
    pub fn attempt_count(&self) -> u64 {
        self.state.read().attempt_count
    }

    fn maybe_reset(&self) {
        let mut state = self.state.write();
        if let Some(success_at) = state.last_success_at {
            if success_at.elapsed() >= self.config.reset_after_success
                && state.current_interval > self.config.initial_interval
            {
                debug!("连接已稳定，重置重连间隔");
                state.current_interval = self.config.initial_interval;
                state.last_success_at = None;
            }
        }
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
