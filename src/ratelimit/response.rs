//! HTTP surface of a rate limit decision.
//!
//! Allowed and denied requests both carry `X-RateLimit-Limit`,
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset` when the policy enables
//! headers. Denials add `Retry-After` and render as a 429 with a JSON body:
//!
//! ```json
//! { "success": false, "error": { "message": "Too many login attempts" } }
//! ```

use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::key::RateLimitKey;
use crate::error::Result;

/// `X-RateLimit-Limit` header name.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining` header name.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset` header name.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota state of one counted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    /// Bucket the request was counted against
    pub key: RateLimitKey,
    /// Requests counted in the current window, this one included
    pub count: u64,
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the window, never negative
    pub remaining: u64,
    /// End of the current window
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window ends, rounded up
    pub retry_after_secs: u64,
    /// Whether the policy wants the `X-RateLimit-*` headers
    pub headers_enabled: bool,
}

impl QuotaStatus {
    /// Window end as epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        let millis = self.reset_at.timestamp_millis();
        millis.div_euclid(1000) + i64::from(millis.rem_euclid(1000) > 0)
    }

    /// Write the `X-RateLimit-*` headers, if enabled.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if !self.headers_enabled {
            return;
        }
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs()));
    }
}

/// A request rejected for exceeding its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Name of the policy that rejected the request
    pub policy: String,
    /// Message for the caller
    pub message: String,
    /// Quota state at the time of rejection
    pub status: QuotaStatus,
}

impl Denial {
    /// Seconds the caller should wait before retrying.
    pub fn retry_after_secs(&self) -> u64 {
        self.status.retry_after_secs
    }

    /// Write `Retry-After` and, if enabled, the `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        self.status.apply_headers(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
    }

    /// The JSON body sent to the caller.
    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.message.clone())
    }

    /// Render the denial as a `429 Too Many Requests` response.
    pub fn into_response(self) -> Result<Response<String>> {
        let body = serde_json::to_string(&self.body())?;

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.apply_headers(headers);

        Ok(response)
    }
}

/// Error envelope returned on denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Always `false`
    pub success: bool,
    /// Error detail
    pub error: ErrorDetail,
}

impl ErrorBody {
    /// A failed envelope carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                message: message.into(),
            },
        }
    }
}

/// Error detail inside [`ErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable message
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status(count: u64, headers_enabled: bool) -> QuotaStatus {
        QuotaStatus {
            key: RateLimitKey::user("login", "u1"),
            count,
            limit: 5,
            remaining: 5u64.saturating_sub(count),
            reset_at: Utc.timestamp_millis_opt(1_700_000_000_250).unwrap(),
            retry_after_secs: 900,
            headers_enabled,
        }
    }

    #[test]
    fn test_reset_rounds_up_to_whole_seconds() {
        assert_eq!(status(1, true).reset_epoch_secs(), 1_700_000_001);

        let mut exact = status(1, true);
        exact.reset_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(exact.reset_epoch_secs(), 1_700_000_000);
    }

    #[test]
    fn test_allowed_headers() {
        let mut headers = HeaderMap::new();
        status(2, true).apply_headers(&mut headers);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "3");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000001");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_headers_disabled() {
        let mut headers = HeaderMap::new();
        status(2, false).apply_headers(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_denial_response() {
        let denial = Denial {
            policy: "login".to_string(),
            message: "Too many login attempts".to_string(),
            status: status(6, true),
        };

        let response = denial.into_response().unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "900");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": { "message": "Too many login attempts" }
            })
        );
    }

    #[test]
    fn test_denial_without_rate_limit_headers_keeps_retry_after() {
        let denial = Denial {
            policy: "login".to_string(),
            message: "slow down".to_string(),
            status: status(6, false),
        };

        let mut headers = HeaderMap::new();
        denial.apply_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[RETRY_AFTER], "900");
    }
}
