/// Sliding-window rate limiting.
///
/// Every allowed action leaves a timestamp in the identifier's window; a
/// check first forgets timestamps older than the window and then admits the
/// action only while fewer than `max_requests` remain.
use std::time::Duration;

use crate::api::error;

pub mod memory;
pub mod redis;
pub mod service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateRule {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self { max_requests: max_requests.max(1), window: Duration::from_secs(window_secs.max(1)) }
    }

    /// Parses `<max>/<window_secs>`, e.g. `30/10`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (max, window) = raw.trim().split_once('/')?;
        let max = max.trim().parse::<u32>().ok()?;
        let window = window.trim().parse::<u64>().ok()?;
        if max == 0 || window == 0 {
            return None;
        }
        Some(Self::new(max, window))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    pub fn allow(remaining: u32) -> Self {
        Self { allowed: true, remaining, retry_after: None }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self { allowed: false, remaining: 0, retry_after: Some(retry_after) }
    }

    /// Whole seconds to wait, never zero for a denial.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
            .unwrap_or(0)
            .max(u64::from(!self.allowed))
    }
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        identifier: &str,
        rule: RateRule,
    ) -> Result<RateDecision, error::SystemError>;
}
