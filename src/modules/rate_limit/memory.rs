use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    api::error,
    modules::rate_limit::{RateDecision, RateLimiter, RateRule},
};

/// Process-local sliding windows, used when no shared backend is available.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_at(&self, identifier: &str, rule: RateRule, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(identifier.to_string()).or_default();

        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= rule.window {
                window.pop_front();
            } else {
                break;
            }
        }

        let used = window.len() as u32;
        if used < rule.max_requests {
            window.push_back(now);
            return RateDecision::allow(rule.max_requests - used - 1);
        }

        let retry_after = window
            .front()
            .map(|oldest| rule.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(rule.window);
        RateDecision::deny(retry_after)
    }

    /// Drops identifiers whose newest timestamp is older than `retention`.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();

        windows.retain(|_, window| {
            window.back().is_some_and(|newest| now.duration_since(*newest) < retention)
        });

        before - windows.len()
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.sweep(retention);
                if evicted > 0 {
                    log::debug!("Rate limiter evicted {evicted} idle windows");
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(
        &self,
        identifier: &str,
        rule: RateRule,
    ) -> Result<RateDecision, error::SystemError> {
        Ok(self.check_at(identifier, rule, Instant::now()))
    }
}
