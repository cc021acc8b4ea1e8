//! 后端健康度与速率预算
//!
//! BackendHealth：每次调用后更新；连续失败 1 次 -> Degraded，>= 3 次 -> Unhealthy，成功即恢复 Healthy。
//! RateBudget：固定窗口内的 token 用量；窗口到期才重置，不是每次调用都重置。

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 连续失败达到此值进入 Degraded
pub const DEGRADED_AFTER: u32 = 1;
/// 连续失败达到此值进入 Unhealthy
pub const UNHEALTHY_AFTER: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendHealth {
    pub id: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BackendHealth {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self) {
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.status = if self.consecutive_failures >= UNHEALTHY_AFTER {
            HealthStatus::Unhealthy
        } else if self.consecutive_failures >= DEGRADED_AFTER {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// 单个后端在滚动窗口内的 token 预算；limit 为 None 表示不限
#[derive(Clone, Debug)]
pub struct RateBudget {
    pub used: u64,
    pub limit: Option<u64>,
    pub reset_time: Instant,
    window: Duration,
}

impl RateBudget {
    pub fn new(limit: Option<u64>, window: Duration) -> Self {
        Self {
            used: 0,
            limit,
            reset_time: Instant::now() + window,
            window,
        }
    }

    /// 窗口到期则清零并开启下一个窗口
    fn roll(&mut self, now: Instant) {
        if now >= self.reset_time {
            self.used = 0;
            self.reset_time = now + self.window;
        }
    }

    pub fn is_exhausted_at(&mut self, now: Instant) -> bool {
        self.roll(now);
        self.limit.is_some_and(|limit| self.used >= limit)
    }

    pub fn is_exhausted(&mut self) -> bool {
        self.is_exhausted_at(Instant::now())
    }

    pub fn record_at(&mut self, tokens: u64, now: Instant) {
        self.roll(now);
        self.used = self.used.saturating_add(tokens);
    }

    pub fn record(&mut self, tokens: u64) {
        self.record_at(tokens, Instant::now());
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|l| l.saturating_sub(self.used))
    }
}
