//! Retry policy engine.
//!
//! Decides, per failure, whether a job attempt should be retried and how
//! long to wait before the next attempt. Error matching is by symbolic
//! kind name against a fixed registry populated at process start — a
//! policy naming an unregistered kind is rejected when the policy is
//! built, never at retry time, and no configured string is ever used to
//! construct executable matching logic.
//!
//! Both [`RetryPolicy::should_retry`] and [`RetryPolicy::next_delay`] are
//! pure functions over the policy itself, which keeps them independently
//! testable.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when building a retry policy.
#[derive(Debug, Error)]
pub enum RetryError {
    /// A configured error-kind name is not in the registry.
    #[error("unknown error kind: {0}")]
    UnknownErrorKind(String),

    /// A registered name is not a valid kind identifier.
    #[error("invalid error kind name: {0:?}")]
    InvalidKindName(String),

    /// Jitter factor outside [0, 1].
    #[error("jitter factor {0} outside [0.0, 1.0]")]
    InvalidJitter(f64),

    /// Negative or non-finite delay seconds.
    #[error("invalid delay seconds: {0}")]
    InvalidDelay(f64),
}

/// A symbolic error-kind name, resolved through [`ErrorKindRegistry`].
///
/// Instances only exist for names the registry accepted, so a policy's
/// retryable set can never hold a kind the process does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorKind(String);

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error-kind names known out of the box.
///
/// These cover the failure categories the shipped executors emit plus the
/// generic transient/infrastructure buckets callers commonly filter on.
pub const BUILTIN_ERROR_KINDS: &[&str] = &[
    "Timeout",
    "ConnectionError",
    "Transient",
    "ResourceExhausted",
    "DependencyUnavailable",
    "DataError",
    "CommandFailed",
    "SpawnError",
];

/// Fixed mapping of symbolic error-kind names, populated once at startup.
#[derive(Debug, Clone)]
pub struct ErrorKindRegistry {
    kinds: BTreeSet<String>,
}

impl ErrorKindRegistry {
    /// Create a registry seeded with [`BUILTIN_ERROR_KINDS`].
    pub fn with_builtins() -> Self {
        Self {
            kinds: BUILTIN_ERROR_KINDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create an empty registry (mostly useful in tests).
    pub fn empty() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    /// Register an additional kind name at startup.
    ///
    /// Names are plain identifiers: ASCII alphanumerics and underscores.
    pub fn register(&mut self, name: impl Into<String>) -> Result<(), RetryError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RetryError::InvalidKindName(name));
        }
        self.kinds.insert(name);
        Ok(())
    }

    /// Resolve a symbolic name into an [`ErrorKind`].
    pub fn resolve(&self, name: &str) -> Result<ErrorKind, RetryError> {
        if self.kinds.contains(name) {
            Ok(ErrorKind(name.to_string()))
        } else {
            Err(RetryError::UnknownErrorKind(name.to_string()))
        }
    }

    /// Check whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains(name)
    }

    /// Iterate over all registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().map(String::as_str)
    }
}

impl Default for ErrorKindRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Retry policy for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt (0 = none).
    pub max_retries: u32,

    /// Base delay between attempts, before jitter.
    #[serde(with = "serde_delay")]
    pub base_delay: Duration,

    /// Jitter factor in [0, 1]; the actual delay is drawn uniformly from
    /// `base_delay * (1 ± jitter_factor)`.
    pub jitter_factor: f64,

    /// Error kinds eligible for retry. Empty = retry on any error.
    #[serde(default)]
    pub retryable: BTreeSet<ErrorKind>,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            jitter_factor: 0.0,
            retryable: BTreeSet::new(),
        }
    }

    /// A policy retrying any error up to `max_retries` times.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter_factor: 0.0,
            retryable: BTreeSet::new(),
        }
    }

    /// Builder: set the jitter factor, validating its range.
    pub fn with_jitter(mut self, jitter_factor: f64) -> Result<Self, RetryError> {
        if !(0.0..=1.0).contains(&jitter_factor) || !jitter_factor.is_finite() {
            return Err(RetryError::InvalidJitter(jitter_factor));
        }
        self.jitter_factor = jitter_factor;
        Ok(self)
    }

    /// Builder: restrict retries to the named error kinds.
    ///
    /// Every name is resolved through the registry; an unknown name fails
    /// here, at construction, rather than when a job later fails.
    pub fn with_retryable<I, S>(
        mut self,
        names: I,
        registry: &ErrorKindRegistry,
    ) -> Result<Self, RetryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.retryable.insert(registry.resolve(name.as_ref())?);
        }
        Ok(self)
    }

    /// Check whether retries are possible at all.
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Decide whether a failed attempt should be retried.
    ///
    /// `attempt` is the number of retries already performed (the initial
    /// attempt is 0). Returns false once the budget is exhausted, and
    /// false for kinds outside a non-empty retryable set.
    pub fn should_retry(&self, attempt: u32, error_kind: &str) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if self.retryable.is_empty() {
            return true;
        }
        self.retryable.iter().any(|k| k.as_str() == error_kind)
    }

    /// Compute the delay before the next attempt.
    ///
    /// `base_delay * (1 + uniform(-jitter_factor, +jitter_factor))`,
    /// clamped to zero.
    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// [`Self::next_delay`] with an explicit random source.
    pub fn next_delay_with<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.jitter_factor == 0.0 {
            return self.base_delay;
        }
        let spread = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
        let secs = self.base_delay.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries.
    fn default() -> Self {
        Self::none()
    }
}

/// Serde helper: delays persisted as fractional seconds.
mod serde_delay {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid delay seconds: {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.is_enabled());
        assert!(!policy.should_retry(0, "Timeout"));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));

        assert!(policy.should_retry(0, "Timeout"));
        assert!(policy.should_retry(1, "Timeout"));
        assert!(!policy.should_retry(2, "Timeout"));
        assert!(!policy.should_retry(3, "Timeout"));
    }

    #[test]
    fn test_empty_set_retries_any_kind() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert!(policy.should_retry(0, "Timeout"));
        assert!(policy.should_retry(0, "SomethingNovel"));
    }

    #[test]
    fn test_non_member_kind_is_not_retried() {
        let registry = ErrorKindRegistry::with_builtins();
        let policy = RetryPolicy::new(3, Duration::from_secs(1))
            .with_retryable(["Timeout", "ConnectionError"], &registry)
            .unwrap();

        assert!(policy.should_retry(0, "Timeout"));
        assert!(policy.should_retry(0, "ConnectionError"));
        assert!(!policy.should_retry(0, "DataError"));
        assert!(!policy.should_retry(0, "NeverRegistered"));
    }

    #[test]
    fn test_unknown_kind_fails_at_construction() {
        let registry = ErrorKindRegistry::with_builtins();
        let err = RetryPolicy::new(3, Duration::from_secs(1))
            .with_retryable(["NoSuchKind"], &registry)
            .unwrap_err();

        match err {
            RetryError::UnknownErrorKind(name) => assert_eq!(name, "NoSuchKind"),
            other => panic!("expected UnknownErrorKind, got {:?}", other),
        }
    }

    #[test]
    fn test_registering_custom_kind() {
        let mut registry = ErrorKindRegistry::with_builtins();
        registry.register("QuotaExceeded").unwrap();

        let policy = RetryPolicy::new(1, Duration::from_secs(1))
            .with_retryable(["QuotaExceeded"], &registry)
            .unwrap();
        assert!(policy.should_retry(0, "QuotaExceeded"));
    }

    #[test]
    fn test_register_rejects_non_identifier() {
        let mut registry = ErrorKindRegistry::with_builtins();
        assert!(registry.register("").is_err());
        assert!(registry.register("has space").is_err());
        assert!(registry.register("semi;colon").is_err());
    }

    #[test]
    fn test_jitter_out_of_range_fails() {
        assert!(
            RetryPolicy::new(1, Duration::from_secs(5))
                .with_jitter(1.5)
                .is_err()
        );
        assert!(
            RetryPolicy::new(1, Duration::from_secs(5))
                .with_jitter(-0.1)
                .is_err()
        );
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5));
        for _ in 0..10 {
            assert_eq!(policy.next_delay(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_jitter_samples_stay_in_bounds() {
        let base = 10.0;
        let jitter = 0.3;
        let policy = RetryPolicy::new(1, Duration::from_secs_f64(base))
            .with_jitter(jitter)
            .unwrap();

        let lo = base * (1.0 - jitter);
        let hi = base * (1.0 + jitter);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let delay = policy.next_delay_with(&mut rng).as_secs_f64();
            assert!(delay >= lo - 1e-9, "delay {} below {}", delay, lo);
            assert!(delay <= hi + 1e-9, "delay {} above {}", delay, hi);
        }
    }

    #[test]
    fn test_full_jitter_never_negative() {
        let policy = RetryPolicy::new(1, Duration::from_secs(3))
            .with_jitter(1.0)
            .unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            // Duration can't go negative; the clamp keeps the conversion in range.
            let delay = policy.next_delay_with(&mut rng);
            assert!(delay.as_secs_f64() <= 6.0 + 1e-9);
        }
    }

    #[test]
    fn test_policy_serialization_round_trip() {
        let registry = ErrorKindRegistry::with_builtins();
        let policy = RetryPolicy::new(3, Duration::from_secs_f64(2.5))
            .with_jitter(0.25)
            .unwrap()
            .with_retryable(["Timeout"], &registry)
            .unwrap();

        let json = serde_json::to_string(&policy).expect("serialize");
        let back: RetryPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(policy, back);
    }
}
