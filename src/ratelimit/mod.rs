//! Rate limiting logic and state management.

pub mod clock;
pub mod key;
mod lifecycle;
mod limiter;
pub mod policy;
mod response;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{
    AddressKeyGenerator, DefaultKeyGenerator, HeaderKeyGenerator, Identity, KeyGenerator,
    KeyStrategy, RateLimitKey, RequestContext, KEY_SEPARATOR,
};
pub use lifecycle::RateLimitRuntime;
pub use limiter::{Decision, RateLimiter, SkipReason};
pub use policy::{Policy, PolicyOverride, PolicySummary, PolicyTable};
pub use response::{
    Denial, ErrorBody, ErrorDetail, QuotaStatus, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use store::{CounterEntry, CounterStore, MemoryStore, SweepStats};
