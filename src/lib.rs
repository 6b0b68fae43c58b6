//! Ratekeeper - request admission for multi-tenant HTTP APIs
//!
//! This crate enforces per-identity, per-policy request quotas with
//! fixed-window counters. A single in-process counter store is owned by a
//! [`RateLimitRuntime`](ratelimit::RateLimitRuntime), which sweeps expired
//! windows in the background and hands out
//! [`RateLimiter`](ratelimit::RateLimiter)s that turn each request into an
//! allow/deny [`Decision`](ratelimit::Decision) plus response headers.

pub mod config;
pub mod error;
pub mod ratelimit;
