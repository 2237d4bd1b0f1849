use std::{sync::Arc, time::Duration};

use crate::{
    api::error,
    constants::RateLimits,
    modules::rate_limit::{RateDecision, RateLimiter, RateRule},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// New messages.
    Message,
    /// Edits, deletes, reactions and conversation changes.
    Mutation,
    Typing,
    /// Credential attempts on the gateway; the only class that fails closed.
    Auth,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Message => "message",
            ActionClass::Mutation => "mutation",
            ActionClass::Typing => "typing",
            ActionClass::Auth => "auth",
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService {
    limiter: Arc<dyn RateLimiter>,
    limits: RateLimits,
}

impl RateLimitService {
    pub fn with_dependencies(limiter: Arc<dyn RateLimiter>, limits: RateLimits) -> Self {
        Self { limiter, limits }
    }

    pub fn rule_for(&self, action: ActionClass) -> RateRule {
        match action {
            ActionClass::Message => self.limits.message,
            ActionClass::Mutation => self.limits.mutation,
            ActionClass::Typing => self.limits.typing,
            ActionClass::Auth => self.limits.auth,
        }
    }

    /// Retention for idle windows: three times the longest configured window.
    pub fn retention(&self) -> Duration {
        [self.limits.message, self.limits.mutation, self.limits.typing, self.limits.auth]
            .iter()
            .map(|rule| rule.window)
            .max()
            .unwrap_or(Duration::from_secs(60))
            * 3
    }

    /// Returns the decision for an allowed action and `RateLimited` otherwise.
    pub async fn check(
        &self,
        action: ActionClass,
        identifier: &str,
    ) -> Result<RateDecision, error::SystemError> {
        let rule = self.rule_for(action);
        let key = format!("{}:{identifier}", action.as_str());

        let decision = match self.limiter.check(&key, rule).await {
            Ok(decision) => decision,
            Err(e) if action == ActionClass::Auth => {
                log::error!("Rate limiter unavailable for {key}, rejecting: {e}");
                return Err(error::SystemError::backend_unavailable("rate limiter"));
            }
            Err(e) => {
                log::warn!("Rate limiter unavailable for {key}, allowing: {e}");
                return Ok(RateDecision::allow(rule.max_requests));
            }
        };

        if decision.allowed {
            Ok(decision)
        } else {
            log::debug!("Rate limited {key}");
            Err(error::SystemError::RateLimited { retry_after: decision.retry_after_secs() })
        }
    }
}
