//! Rate limit policies and the named policy table.
//!
//! A [`Policy`] is immutable data: quota, window, denial message and bypass
//! rules. Every policy in a [`PolicyTable`] shares the same counter store and
//! is kept apart by its key prefix. The built-in table can be overridden or
//! extended from configuration with [`PolicyOverride`] entries.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::key::{KeyGenerator, KeyStrategy, KEY_SEPARATOR};
use crate::error::{RatekeeperError, Result};

/// Role that bypasses every policy unless overridden.
pub const ADMIN_ROLE: &str = "admin";

/// Default interval between store sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(300_000);

/// Names of the built-in policies.
pub mod names {
    /// Global API limit
    pub const API: &str = "api";
    /// Authentication endpoints
    pub const AUTH: &str = "auth";
    /// Login attempts
    pub const LOGIN: &str = "login";
    /// Password reset requests
    pub const PASSWORD_RESET: &str = "password-reset";
    /// One-time password requests
    pub const OTP: &str = "otp";
    /// Booking creation
    pub const BOOKING: &str = "booking";
    /// Emergency alerts
    pub const SOS: &str = "sos";
    /// Search queries
    pub const SEARCH: &str = "search";
}

const MINUTE: u64 = 60_000;

/// A named quota configuration.
#[derive(Clone)]
pub struct Policy {
    /// Policy name
    pub name: String,
    /// Key namespace
    pub prefix: String,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length
    pub window: Duration,
    /// Message returned on denial
    pub message: String,
    /// Whether `X-RateLimit-*` headers are attached
    pub headers_enabled: bool,
    /// Roles that bypass this policy
    pub skip_roles: BTreeSet<String>,
    /// Whether the policy is disabled in the test environment
    pub skip_in_test: bool,
    /// How often expired counters should be swept
    pub cleanup_interval: Duration,
    key_strategy: KeyStrategy,
    key_generator: Arc<dyn KeyGenerator>,
}

impl Policy {
    /// Create a policy with default bypass rules and keying.
    ///
    /// The prefix defaults to the policy name.
    pub fn new(name: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        let name = name.into();
        let key_strategy = KeyStrategy::default();
        Self {
            prefix: name.clone(),
            message: format!("Too many requests, please try again later ({name})"),
            name,
            max_requests,
            window,
            headers_enabled: true,
            skip_roles: BTreeSet::from([ADMIN_ROLE.to_string()]),
            skip_in_test: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            key_generator: key_strategy.generator(),
            key_strategy,
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the denial message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Enable or disable the `X-RateLimit-*` headers.
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.headers_enabled = enabled;
        self
    }

    /// Replace the set of bypass roles.
    pub fn with_skip_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable the test-environment bypass.
    pub fn with_skip_in_test(mut self, skip: bool) -> Self {
        self.skip_in_test = skip;
        self
    }

    /// Set the sweep interval hint.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Use one of the configurable key strategies.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_generator = strategy.generator();
        self.key_strategy = strategy;
        self
    }

    /// Use a custom key generator.
    pub fn with_key_generator<G>(mut self, generator: G) -> Self
    where
        G: KeyGenerator + 'static,
    {
        self.key_generator = Arc::new(generator);
        self.key_strategy = KeyStrategy::Custom;
        self
    }

    /// The generator used to derive keys for this policy.
    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// Whether `role` bypasses this policy.
    pub fn skips_role(&self, role: &str) -> bool {
        self.skip_roles.contains(role)
    }

    /// Check the policy's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RatekeeperError::Config("policy name must not be empty".into()));
        }
        if self.prefix.trim().is_empty() {
            return Err(RatekeeperError::invalid_policy(&self.name, "prefix must not be empty"));
        }
        // Keys are `prefix:kind:value`; the prefix must end at the first `:`.
        if self.prefix.contains(KEY_SEPARATOR) {
            return Err(RatekeeperError::invalid_policy(
                &self.name,
                format!("prefix '{}' must not contain '{KEY_SEPARATOR}'", self.prefix),
            ));
        }
        if self.max_requests == 0 {
            return Err(RatekeeperError::invalid_policy(
                &self.name,
                "max_requests must be positive",
            ));
        }
        if self.window.is_zero() {
            return Err(RatekeeperError::invalid_policy(&self.name, "window_ms must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(RatekeeperError::invalid_policy(
                &self.name,
                "cleanup_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Apply a partial override on top of this policy.
    pub fn apply(mut self, patch: &PolicyOverride) -> Self {
        if let Some(prefix) = &patch.prefix {
            self.prefix = prefix.clone();
        }
        if let Some(max_requests) = patch.max_requests {
            self.max_requests = max_requests;
        }
        if let Some(window_ms) = patch.window_ms {
            self.window = Duration::from_millis(window_ms);
        }
        if let Some(message) = &patch.message {
            self.message = message.clone();
        }
        if let Some(headers_enabled) = patch.headers_enabled {
            self.headers_enabled = headers_enabled;
        }
        if let Some(skip_roles) = &patch.skip_roles {
            self.skip_roles = skip_roles.iter().cloned().collect();
        }
        if let Some(skip_in_test) = patch.skip_in_test {
            self.skip_in_test = skip_in_test;
        }
        if let Some(cleanup_interval_ms) = patch.cleanup_interval_ms {
            self.cleanup_interval = Duration::from_millis(cleanup_interval_ms);
        }
        if let Some(strategy) = &patch.key {
            self = self.with_key_strategy(strategy.clone());
        }
        self
    }

    /// Serializable view of the policy.
    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            max_requests: self.max_requests,
            window_ms: duration_ms(self.window),
            message: self.message.clone(),
            headers_enabled: self.headers_enabled,
            skip_roles: self.skip_roles.iter().cloned().collect(),
            skip_in_test: self.skip_in_test,
            cleanup_interval_ms: duration_ms(self.cleanup_interval),
            key: self.key_strategy.clone(),
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("headers_enabled", &self.headers_enabled)
            .field("skip_roles", &self.skip_roles)
            .field("skip_in_test", &self.skip_in_test)
            .field("key", &self.key_strategy)
            .finish()
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Partial policy configuration, as written in config files.
///
/// Unset fields keep the value of the built-in policy of the same name, or
/// the [`Policy::new`] defaults for a new policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    /// Key namespace
    #[serde(default)]
    pub prefix: Option<String>,
    /// Requests allowed per window
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Message returned on denial
    #[serde(default)]
    pub message: Option<String>,
    /// Whether `X-RateLimit-*` headers are attached
    #[serde(default)]
    pub headers_enabled: Option<bool>,
    /// Roles that bypass the policy
    #[serde(default)]
    pub skip_roles: Option<Vec<String>>,
    /// Whether the policy is disabled in the test environment
    #[serde(default)]
    pub skip_in_test: Option<bool>,
    /// Sweep interval hint in milliseconds
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
    /// Key strategy
    #[serde(default)]
    pub key: Option<KeyStrategy>,
}

/// Serializable description of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicySummary {
    /// Policy name
    pub name: String,
    /// Key namespace
    pub prefix: String,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Message returned on denial
    pub message: String,
    /// Whether `X-RateLimit-*` headers are attached
    pub headers_enabled: bool,
    /// Roles that bypass the policy, sorted
    pub skip_roles: Vec<String>,
    /// Whether the policy is disabled in the test environment
    pub skip_in_test: bool,
    /// Sweep interval hint in milliseconds
    pub cleanup_interval_ms: u64,
    /// Key strategy
    pub key: KeyStrategy,
}

/// Registry of named policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: BTreeMap<String, Arc<Policy>>,
}

impl PolicyTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policy set.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for policy in builtin_policies() {
            table.policies.insert(policy.name.clone(), Arc::new(policy));
        }
        table
    }

    /// The built-in set with configured overrides merged on top.
    pub fn with_overrides(overrides: &HashMap<String, PolicyOverride>) -> Result<Self> {
        let mut table = Self::builtin();
        table.merge(overrides)?;
        Ok(table)
    }

    /// Load overrides from a YAML document and merge them over the built-in set.
    ///
    /// The document maps policy names to [`PolicyOverride`] entries.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: HashMap<String, PolicyOverride> = serde_yaml::from_str(yaml)?;
        Self::with_overrides(&overrides)
    }

    /// Merge overrides into this table, validating the result.
    ///
    /// On error the table is left as it was.
    pub fn merge(&mut self, overrides: &HashMap<String, PolicyOverride>) -> Result<()> {
        let mut merged = self.policies.clone();
        for (name, patch) in overrides {
            let base = match merged.get(name) {
                Some(existing) => Policy::clone(existing),
                None => {
                    let max_requests = patch.max_requests.ok_or_else(|| {
                        RatekeeperError::invalid_policy(name, "new policies must set max_requests")
                    })?;
                    let window_ms = patch.window_ms.ok_or_else(|| {
                        RatekeeperError::invalid_policy(name, "new policies must set window_ms")
                    })?;
                    Policy::new(name.clone(), max_requests, Duration::from_millis(window_ms))
                }
            };
            let policy = base.apply(patch);
            policy.validate()?;
            merged.insert(name.clone(), Arc::new(policy));
        }
        check_prefixes(&merged)?;
        self.policies = merged;
        Ok(())
    }

    /// Register a policy, replacing any policy of the same name.
    pub fn insert(&mut self, policy: Policy) -> Result<()> {
        policy.validate()?;
        let previous = self
            .policies
            .insert(policy.name.clone(), Arc::new(policy.clone()));
        if let Err(err) = check_prefixes(&self.policies) {
            match previous {
                Some(previous) => self.policies.insert(policy.name.clone(), previous),
                None => self.policies.remove(&policy.name),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// Look up a policy by name, failing if it is not registered.
    pub fn require(&self, name: &str) -> Result<Arc<Policy>> {
        self.get(name)
            .ok_or_else(|| RatekeeperError::UnknownPolicy(name.to_string()))
    }

    /// Iterate policies in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.values()
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The shortest cleanup interval among the registered policies.
    pub fn cleanup_interval(&self) -> Duration {
        self.iter()
            .map(|policy| policy.cleanup_interval)
            .min()
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL)
    }
}

fn check_prefixes(policies: &BTreeMap<String, Arc<Policy>>) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for policy in policies.values() {
        if let Some(other) = seen.insert(policy.prefix.as_str(), policy.name.as_str()) {
            return Err(RatekeeperError::invalid_policy(
                &policy.name,
                format!("prefix '{}' is already used by '{}'", policy.prefix, other),
            ));
        }
    }
    Ok(())
}

fn builtin_policies() -> Vec<Policy> {
    vec![
        Policy::new(names::API, 100, Duration::from_millis(MINUTE))
            .with_message("Too many requests, please slow down"),
        Policy::new(names::AUTH, 10, Duration::from_millis(15 * MINUTE))
            .with_message("Too many authentication attempts, please try again in 15 minutes"),
        Policy::new(names::LOGIN, 5, Duration::from_millis(15 * MINUTE))
            .with_message("Too many login attempts, please try again in 15 minutes"),
        Policy::new(names::PASSWORD_RESET, 3, Duration::from_millis(60 * MINUTE))
            .with_message("Too many password reset requests, please try again in an hour"),
        Policy::new(names::OTP, 5, Duration::from_millis(10 * MINUTE))
            .with_message("Too many verification code requests, please try again in 10 minutes"),
        Policy::new(names::BOOKING, 20, Duration::from_millis(MINUTE))
            .with_message("Too many booking requests, please slow down"),
        Policy::new(names::SOS, 5, Duration::from_millis(10 * MINUTE))
            .with_message("Too many emergency alerts sent, please contact support directly"),
        Policy::new(names::SEARCH, 30, Duration::from_millis(MINUTE))
            .with_message("Too many search requests, please slow down"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let table = PolicyTable::builtin();
        assert_eq!(table.len(), 8);

        let expected = [
            (names::API, 100, 60),
            (names::AUTH, 10, 900),
            (names::LOGIN, 5, 900),
            (names::PASSWORD_RESET, 3, 3600),
            (names::OTP, 5, 600),
            (names::BOOKING, 20, 60),
            (names::SOS, 5, 600),
            (names::SEARCH, 30, 60),
        ];
        for (name, max, window_secs) in expected {
            let policy = table.require(name).unwrap();
            assert_eq!(policy.max_requests, max, "{name}");
            assert_eq!(policy.window, Duration::from_secs(window_secs), "{name}");
            assert_eq!(policy.prefix, name);
        }
    }

    #[test]
    fn test_policy_defaults() {
        let policy = Policy::new("custom", 10, Duration::from_secs(1));

        assert!(policy.headers_enabled);
        assert!(policy.skip_in_test);
        assert!(policy.skips_role(ADMIN_ROLE));
        assert!(!policy.skips_role("rider"));
        assert_eq!(policy.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
        assert_eq!(policy.prefix, "custom");
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let policy = Policy::new("broken", 0, Duration::from_secs(1));
        assert!(matches!(
            policy.validate(),
            Err(RatekeeperError::InvalidPolicy { .. })
        ));

        let policy = Policy::new("broken", 1, Duration::ZERO);
        assert!(policy.validate().is_err());

        let policy = Policy::new("broken", 1, Duration::from_secs(1)).with_prefix(" ");
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_override_merges_over_builtin() {
        let yaml = r#"
login:
  max_requests: 10
  skip_roles: [admin, support]
search:
  headers_enabled: false
  key: address
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();

        let login = table.require(names::LOGIN).unwrap();
        assert_eq!(login.max_requests, 10);
        assert_eq!(login.window, Duration::from_secs(900));
        assert!(login.skips_role("support"));

        let search = table.require(names::SEARCH).unwrap();
        assert!(!search.headers_enabled);
        assert_eq!(search.summary().key, KeyStrategy::Address);
    }

    #[test]
    fn test_override_defines_new_policy() {
        let yaml = r#"
ride-quote:
  max_requests: 50
  window_ms: 30000
  message: Slow down on quotes
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        let policy = table.require("ride-quote").unwrap();

        assert_eq!(policy.max_requests, 50);
        assert_eq!(policy.window, Duration::from_secs(30));
        assert_eq!(policy.message, "Slow down on quotes");
        assert_eq!(policy.prefix, "ride-quote");
    }

    #[test]
    fn test_new_policy_requires_quota() {
        let yaml = r#"
ride-quote:
  window_ms: 30000
"#;
        assert!(PolicyTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
login:
  max_request: 10
"#;
        assert!(PolicyTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut table = PolicyTable::builtin();
        let clash = Policy::new("login-v2", 5, Duration::from_secs(60)).with_prefix("login");

        assert!(table.insert(clash).is_err());
        assert!(table.get("login-v2").is_none());
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn test_prefix_with_separator_rejected() {
        // "x" for user "user:1" and "x:user" for user "1" would share
        // the key "x:user:user:1".
        let mut table = PolicyTable::new();
        table
            .insert(Policy::new("a", 5, Duration::from_secs(60)).with_prefix("x"))
            .unwrap();

        let nested = Policy::new("b", 5, Duration::from_secs(60)).with_prefix("x:user");
        assert!(matches!(
            nested.validate(),
            Err(RatekeeperError::InvalidPolicy { ref name, .. }) if name == "b"
        ));
        assert!(table.insert(nested).is_err());
        assert!(table.get("b").is_none());

        let yaml = r#"
login:
  prefix: "login:v2"
"#;
        assert!(PolicyTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_failed_merge_leaves_table_unchanged() {
        let mut table = PolicyTable::builtin();
        let overrides = HashMap::from([
            (
                names::API.to_string(),
                PolicyOverride {
                    max_requests: Some(500),
                    ..PolicyOverride::default()
                },
            ),
            (
                names::LOGIN.to_string(),
                PolicyOverride {
                    prefix: Some(names::SEARCH.to_string()),
                    ..PolicyOverride::default()
                },
            ),
        ]);

        assert!(table.merge(&overrides).is_err());

        assert_eq!(table.len(), 8);
        assert_eq!(table.require(names::LOGIN).unwrap().prefix, names::LOGIN);
        assert_eq!(table.require(names::SEARCH).unwrap().prefix, names::SEARCH);
        assert_eq!(table.require(names::API).unwrap().max_requests, 100);
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_secs(90)), 90_000);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_cleanup_interval_is_minimum() {
        let mut table = PolicyTable::builtin();
        assert_eq!(table.cleanup_interval(), DEFAULT_CLEANUP_INTERVAL);

        table
            .insert(
                Policy::new("burst", 5, Duration::from_secs(1))
                    .with_cleanup_interval(Duration::from_secs(30)),
            )
            .unwrap();
        assert_eq!(table.cleanup_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_policy_lookup() {
        let table = PolicyTable::builtin();
        assert!(matches!(
            table.require("nope"),
            Err(RatekeeperError::UnknownPolicy(name)) if name == "nope"
        ));
    }
}
