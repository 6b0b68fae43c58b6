//! Core rate limiter implementation.

use http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::key::{RateLimitKey, RequestContext};
use super::policy::Policy;
use super::response::{Denial, QuotaStatus};
use super::store::{CounterEntry, CounterStore};
use crate::config::Environment;

/// Why a request was let through without being counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "role")]
pub enum SkipReason {
    /// The policy is disabled in the test environment
    TestEnvironment,
    /// The caller's role bypasses the policy
    Role(String),
}

/// Outcome of checking one request against one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Decision {
    /// Let through without touching any counter
    Skipped(SkipReason),
    /// Counted and within quota
    Allowed(QuotaStatus),
    /// Counted and over quota
    Denied(Denial),
}

impl Decision {
    /// Whether downstream processing should proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }

    /// Quota state, if the request was counted.
    pub fn status(&self) -> Option<&QuotaStatus> {
        match self {
            Decision::Skipped(_) => None,
            Decision::Allowed(status) => Some(status),
            Decision::Denied(denial) => Some(&denial.status),
        }
    }

    /// Write the response headers this decision calls for.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        match self {
            Decision::Skipped(_) => {}
            Decision::Allowed(status) => status.apply_headers(headers),
            Decision::Denied(denial) => denial.apply_headers(headers),
        }
    }
}

/// Evaluates requests against policies using a shared counter store.
///
/// Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    environment: Environment,
}

impl RateLimiter {
    /// Create a limiter over `store`, measuring time with `clock`.
    ///
    /// `clock` must be the clock the store opens windows with.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, environment: Environment) -> Self {
        Self {
            store,
            clock,
            environment,
        }
    }

    /// The environment this limiter evaluates in.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Check a request against a policy, counting it unless a bypass applies.
    pub fn check(&self, policy: &Policy, request: &RequestContext) -> Decision {
        if policy.skip_in_test && self.environment == Environment::Test {
            trace!(policy = %policy.name, "Skipping rate limit in test environment");
            return Decision::Skipped(SkipReason::TestEnvironment);
        }

        if let Some(role) = request.role() {
            if policy.skips_role(role) {
                trace!(policy = %policy.name, role = %role, "Skipping rate limit for role");
                return Decision::Skipped(SkipReason::Role(role.to_string()));
            }
        }

        let key = self.key_for(policy, request);
        let entry = self.store.increment(&key, policy.window);
        let status = self.status(policy, key, entry);

        if status.count > policy.max_requests {
            warn!(
                target: "ratekeeper::audit",
                policy = %policy.name,
                user_id = ?request.user_id(),
                role = ?request.role(),
                address = %request.client_address(),
                key = %status.key,
                count = status.count,
                limit = status.limit,
                path = %request.path,
                "Rate limit exceeded"
            );
            return Decision::Denied(Denial {
                policy: policy.name.clone(),
                message: policy.message.clone(),
                status,
            });
        }

        debug!(
            policy = %policy.name,
            key = %status.key,
            count = status.count,
            remaining = status.remaining,
            "Request within rate limit"
        );
        Decision::Allowed(status)
    }

    /// Read the caller's bucket for `policy` without counting.
    pub fn peek(&self, policy: &Policy, request: &RequestContext) -> Option<CounterEntry> {
        self.store.get(&self.key_for(policy, request))
    }

    /// Clear the caller's bucket for `policy`, e.g. after a successful login.
    pub fn reset(&self, policy: &Policy, request: &RequestContext) {
        let key = self.key_for(policy, request);
        debug!(policy = %policy.name, key = %key, "Resetting rate limit");
        self.store.reset(&key);
    }

    fn key_for(&self, policy: &Policy, request: &RequestContext) -> RateLimitKey {
        policy.key_generator().generate(request, &policy.prefix)
    }

    fn status(&self, policy: &Policy, key: RateLimitKey, entry: CounterEntry) -> QuotaStatus {
        let until_reset_ms = (entry.reset_at - self.clock.now()).num_milliseconds().max(0);
        let retry_after_secs = u64::try_from(until_reset_ms).unwrap_or(0).div_ceil(1000);

        QuotaStatus {
            key,
            count: entry.count,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(entry.count),
            reset_at: entry.reset_at,
            retry_after_secs,
            headers_enabled: policy.headers_enabled,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("environment", &self.environment)
            .field("entries", &self.store.len())
            .finish()
    }
}
