use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use rand::Rng;

use crate::error::{Error, TimeoutPhase, TransportErrorKind};

/// Facts about one finished attempt, handed to the retry decision.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// 1-based index of the attempt that just finished.
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timeout_phase: Option<TimeoutPhase>,
}

impl RetryDecision {
    pub(crate) fn for_status(
        attempt: usize,
        max_attempts: usize,
        method: &Method,
        uri: &str,
        status: StatusCode,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            method: method.clone(),
            uri: uri.to_owned(),
            status: Some(status),
            transport_error_kind: None,
            timeout_phase: None,
        }
    }

    /// Returns `None` for errors that are never worth another attempt.
    pub(crate) fn for_error(
        attempt: usize,
        max_attempts: usize,
        method: &Method,
        uri: &str,
        error: &Error,
    ) -> Option<Self> {
        let (transport_error_kind, timeout_phase) = match error {
            Error::Transport { kind, .. } => (Some(*kind), None),
            Error::Timeout { phase, .. } => (None, Some(*phase)),
            Error::ReadBody { .. } => (Some(TransportErrorKind::Read), None),
            _ => return None,
        };
        Some(Self {
            attempt,
            max_attempts,
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            transport_error_kind,
            timeout_phase,
        })
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

impl<F> RetryClassifier for F
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        self(decision)
    }
}

/// How many times one logical request may be sent and how long to wait in between.
///
/// `attempts` counts total tries, so a policy of 3 sends the request at most
/// three times. The delay after failed attempt `k` (0-based) is
/// `min(base_delay * backoff_multiplier^k, max_delay)`.
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retryable_timeout_phases: BTreeSet<TimeoutPhase>,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retryable_timeout_phases", &self.retryable_timeout_phases)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Single attempt, nothing is retried.
    pub fn disabled() -> Self {
        Self {
            attempts: 1,
            base_delay: Self::DEFAULT_BASE_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            backoff_multiplier: Self::DEFAULT_BACKOFF_MULTIPLIER,
            jitter_ratio: 0.0,
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retryable_timeout_phases: default_retryable_timeout_phases(),
            retry_classifier: None,
        }
    }

    pub fn standard() -> Self {
        Self::disabled().attempts(3)
    }

    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = if backoff_multiplier.is_finite() {
            backoff_multiplier.max(1.0)
        } else {
            Self::DEFAULT_BACKOFF_MULTIPLIER
        };
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retryable_timeout_phases(
        mut self,
        phases: impl IntoIterator<Item = TimeoutPhase>,
    ) -> Self {
        self.retryable_timeout_phases = phases.into_iter().collect();
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.attempts
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub(crate) fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        if let Some(kind) = decision.transport_error_kind {
            return self.retryable_transport_error_kinds.contains(&kind);
        }
        if let Some(phase) = decision.timeout_phase {
            return self.retryable_timeout_phases.contains(&phase);
        }
        false
    }

    /// Delay to wait after the failed attempt with 0-based index `failed_attempt`.
    pub fn delay_for_attempt(&self, failed_attempt: usize) -> Duration {
        let exponent = i32::try_from(failed_attempt).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw_ms = base_ms * self.backoff_multiplier.powi(exponent);
        let delay_ms = if raw_ms.is_finite() {
            raw_ms.clamp(0.0, max_ms)
        } else {
            max_ms
        };
        let delay = Duration::try_from_secs_f64(delay_ms / 1000.0).unwrap_or(self.max_delay);
        self.apply_jitter(delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return delay;
        }

        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        if delay_ms <= 1 {
            return delay;
        }
        let max_delay_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((delay_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = delay_ms.saturating_sub(jitter_span);
        let high = delay_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_delay_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

fn default_retryable_timeout_phases() -> BTreeSet<TimeoutPhase> {
    [TimeoutPhase::Transport, TimeoutPhase::ResponseBody]
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(status: Option<u16>, kind: Option<TransportErrorKind>) -> RetryDecision {
        RetryDecision {
            attempt: 1,
            max_attempts: 3,
            method: Method::GET,
            uri: "https://api.example.com/v1/items".to_owned(),
            status: status.map(|code| StatusCode::from_u16(code).expect("status")),
            transport_error_kind: kind,
            timeout_phase: None,
        }
    }

    #[test]
    fn zero_attempts_are_clamped_to_one() {
        assert_eq!(RetryPolicy::disabled().attempts(0).max_attempts(), 1);
    }

    #[test]
    fn delay_grows_exponentially_and_caps_at_max() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .backoff_multiplier(2.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(500));
    }

    #[test]
    fn unbounded_max_delay_does_not_overflow() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::MAX)
            .max_delay(Duration::MAX);
        assert_eq!(policy.delay_for_attempt(0), Duration::MAX);
        assert_eq!(policy.delay_for_attempt(5), Duration::MAX);
    }

    #[test]
    fn multiplier_below_one_is_raised() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(50))
            .backoff_multiplier(0.1);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
    }

    #[test]
    fn jittered_delay_never_exceeds_max_delay() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            assert!(policy.delay_for_attempt(3) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn default_statuses_and_kinds_are_retryable() {
        let policy = RetryPolicy::standard();
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(policy.should_retry_decision(&decision(Some(code), None)));
        }
        assert!(!policy.should_retry_decision(&decision(Some(404), None)));
        assert!(policy.should_retry_decision(&decision(None, Some(TransportErrorKind::Connect))));
        assert!(!policy.should_retry_decision(&decision(None, Some(TransportErrorKind::Tls))));
        assert!(!policy.should_retry_decision(&decision(None, None)));
    }

    #[test]
    fn classifier_overrides_builtin_sets() {
        let policy = RetryPolicy::standard().retry_classifier(Arc::new(
            |decision: &RetryDecision| decision.status == Some(StatusCode::NOT_FOUND),
        ));
        assert!(policy.should_retry_decision(&decision(Some(404), None)));
        assert!(!policy.should_retry_decision(&decision(Some(503), None)));
    }

    #[test]
    fn terminal_errors_produce_no_decision() {
        let error = Error::Cancelled {
            method: Method::GET,
            uri: "http://h/".to_owned(),
        };
        assert!(RetryDecision::for_error(1, 3, &Method::GET, "http://h/", &error).is_none());
    }
}
