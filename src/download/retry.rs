//! 单章重试策略。
//!
//! 只做决策，不睡眠：等待由调度器在派发层完成，不占用 worker。

use std::time::Duration;

use crate::base_system::context::Config;
use crate::network_parser::fetcher::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 放弃，本次运行记为永久失败
    GiveUp,
    /// 等待后重新入队
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数上限（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        let min_ms = cfg.min_wait_time;
        let max_ms = cfg.max_wait_time.max(min_ms);
        Self {
            max_attempts: cfg.max_retries.max(1),
            base_delay: Duration::from_millis(min_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    /// 不等待的策略，测试与离线回放用。
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `attempt_count` 为已经完成的尝试次数（失败后至少为 1）。
    pub fn should_retry(&self, attempt_count: u32, kind: FailureKind) -> bool {
        kind == FailureKind::Transient && attempt_count < self.max_attempts
    }

    /// 第 n 次失败后的等待：base * 2^(n-1)，封顶 max_delay。
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let shift = attempt_count.saturating_sub(1).min(10);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn decide(&self, attempt_count: u32, kind: FailureKind) -> RetryDecision {
        if self.should_retry(attempt_count, kind) {
            RetryDecision::RetryAfter(self.delay_for(attempt_count))
        } else {
            RetryDecision::GiveUp
        }
    }
}
