//! Retry policy: failure classification and backoff.
//!
//! Every external operation kind goes through the same [`RetryPolicy`], so
//! retry behaviour is decided in one place instead of at each call site.
//!
//! - **Classification** is pluggable. The default [`KindClassifier`] reads a
//!   set of Transient [`ErrorKind`]s from `[retry] transient` in the config;
//!   anything else is Permanent. Callers with provider-specific knowledge
//!   install their own [`Classifier`].
//! - **Backoff** is exponential, `base * 2^(attempt - 1)` after the given
//!   attempt failed, unless the provider sent a retry-after hint. Either way
//!   the wait is capped at `max_delay`.
//! - **Budget**: a chapter gets at most `max_attempts` invocations per retry
//!   budget. Exhausting it turns the last Transient failure into a terminal
//!   Failed status.

use crate::config::RetryConfig;
use crate::invoke::{ErrorKind, InvokeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Persisted form of a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => f.write_str("transient"),
            ErrorClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// Retry decision for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient { retry_after: Option<Duration> },
    Permanent,
}

impl Classification {
    pub fn class(&self) -> ErrorClass {
        match self {
            Classification::Transient { .. } => ErrorClass::Transient,
            Classification::Permanent => ErrorClass::Permanent,
        }
    }
}

/// Decides whether an invocation failure is worth retrying.
pub trait Classifier: Send + Sync {
    fn classify(&self, error: &InvokeError) -> Classification;
}

/// Classifies by [`ErrorKind`] membership in a Transient set.
#[derive(Debug, Clone)]
pub struct KindClassifier {
    transient: HashSet<ErrorKind>,
}

impl KindClassifier {
    pub fn new(transient: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            transient: transient.into_iter().collect(),
        }
    }
}

impl Default for KindClassifier {
    fn default() -> Self {
        Self::new(RetryConfig::default().transient)
    }
}

impl Classifier for KindClassifier {
    fn classify(&self, error: &InvokeError) -> Classification {
        if self.transient.contains(&error.kind) {
            Classification::Transient {
                retry_after: error.retry_after,
            }
        } else {
            Classification::Permanent
        }
    }
}

pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    classifier: Box<dyn Classifier>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            classifier: Box::new(KindClassifier::new(config.transient.iter().copied())),
        }
    }

    /// Replace the classification table.
    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(&self, error: &InvokeError) -> Classification {
        self.classifier.classify(error)
    }

    /// Whether another attempt fits in the budget after `attempts_made`.
    pub fn has_budget(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Wait before the next attempt, after attempt number `attempt` (1-based)
    /// failed. A provider hint replaces the computed value; both are capped.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = || {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.base_delay.saturating_mul(factor)
        };
        retry_after.unwrap_or_else(computed).min(self.max_delay)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 4,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            ..Default::default()
        })
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy(100, 60_000);
        assert_eq!(p.next_delay(1, None), Duration::from_millis(100));
        assert_eq!(p.next_delay(2, None), Duration::from_millis(200));
        assert_eq!(p.next_delay(3, None), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy(1_000, 5_000);
        assert_eq!(p.next_delay(10, None), Duration::from_secs(5));
        assert_eq!(p.next_delay(200, None), Duration::from_secs(5));
    }

    #[test]
    fn hint_overrides_computed_delay_but_not_cap() {
        let p = policy(100, 10_000);
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(3))), Duration::from_secs(3));
        assert_eq!(p.next_delay(1, Some(Duration::from_secs(90))), Duration::from_secs(10));
        assert_eq!(p.next_delay(1, Some(Duration::MAX)), Duration::from_secs(10));
    }

    #[test]
    fn budget_counts_attempts_made() {
        let p = policy(0, 0);
        assert!(p.has_budget(0));
        assert!(p.has_budget(3));
        assert!(!p.has_budget(4));
    }

    #[test]
    fn default_table_splits_transient_and_permanent() {
        let c = KindClassifier::default();
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::Server,
            ErrorKind::Unavailable,
        ] {
            assert_eq!(c.classify(&InvokeError::new(kind, "x")).class(), ErrorClass::Transient);
        }
        for kind in [
            ErrorKind::InvalidInput,
            ErrorKind::Unauthorized,
            ErrorKind::QuotaExhausted,
            ErrorKind::Other,
        ] {
            assert_eq!(c.classify(&InvokeError::new(kind, "x")), Classification::Permanent);
        }
    }

    #[test]
    fn transient_classification_carries_hint() {
        let c = KindClassifier::default();
        let err = InvokeError::new(ErrorKind::RateLimited, "429")
            .with_retry_after(Duration::from_secs(7));
        assert_eq!(
            c.classify(&err),
            Classification::Transient {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    struct EverythingTransient;

    impl Classifier for EverythingTransient {
        fn classify(&self, _: &InvokeError) -> Classification {
            Classification::Transient { retry_after: None }
        }
    }

    #[test]
    fn custom_classifier_replaces_table() {
        let p = policy(0, 0).with_classifier(EverythingTransient);
        let err = InvokeError::new(ErrorKind::Unauthorized, "401");
        assert_eq!(p.classify(&err).class(), ErrorClass::Transient);
    }
}
