use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, TimeoutPhase};
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub redirects: u64,
    pub timeout_transport: u64,
    pub timeout_response_body: u64,
    pub transport_errors: u64,
    pub read_body_errors: u64,
    pub response_too_large: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    redirects: AtomicU64,
    timeout_transport: AtomicU64,
    timeout_response_body: AtomicU64,
    transport_errors: AtomicU64,
    read_body_errors: AtomicU64,
    response_too_large: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl ClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_redirect(&self) {
        self.inner.redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(
        &self,
        result: &Result<Response, Error>,
        latency: Duration,
    ) {
        self.record_latency(latency);
        let error = match result {
            Ok(response) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status_code());
                return;
            }
            Err(error) => error,
        };

        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error.root_cause() {
            Error::Timeout { phase, .. } => {
                let counter = match phase {
                    TimeoutPhase::Transport => &self.inner.timeout_transport,
                    TimeoutPhase::ResponseBody => &self.inner.timeout_response_body,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("timeout:{phase}"));
            }
            Error::Transport { kind, .. } => {
                self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("transport:{kind}"));
            }
            Error::ReadBody { .. } => {
                self.inner.read_body_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("read_body".to_owned());
            }
            Error::ResponseTooLarge { .. } => {
                self.inner
                    .response_too_large
                    .fetch_add(1, Ordering::Relaxed);
                self.add_error_count("response_too_large".to_owned());
            }
            Error::Cancelled { .. } => {
                self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("cancelled".to_owned());
            }
            Error::HttpStatus { status, .. } => {
                self.add_status_count(*status);
                self.add_error_count(format!("http_status:{status}"));
            }
            other => self.add_error_count(other.code().as_str().to_owned()),
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let latency_samples = load(&self.inner.latency_samples);
        let latency_total_ms = load(&self.inner.latency_total_ms);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            requests_started: load(&self.inner.requests_started),
            requests_succeeded: load(&self.inner.requests_succeeded),
            requests_failed: load(&self.inner.requests_failed),
            retries: load(&self.inner.retries),
            redirects: load(&self.inner.redirects),
            timeout_transport: load(&self.inner.timeout_transport),
            timeout_response_body: load(&self.inner.timeout_response_body),
            transport_errors: load(&self.inner.transport_errors),
            read_body_errors: load(&self.inner.read_body_errors),
            response_too_large: load(&self.inner.response_too_large),
            cancelled: load(&self.inner.cancelled),
            in_flight: load(&self.inner.in_flight),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn failures_are_keyed_by_their_root_cause() {
        let metrics = ClientMetrics::default();
        metrics.record_request_started();
        let exhausted = Error::RetryExhausted {
            attempts: 3,
            method: Method::GET,
            uri: "http://example.com/".to_owned(),
            source: Box::new(Error::Timeout {
                phase: TimeoutPhase::Transport,
                timeout_ms: 100,
                method: Method::GET,
                uri: "http://example.com/".to_owned(),
            }),
        };
        metrics.record_request_completed(&Err(exhausted), Duration::from_millis(40));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_started, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.timeout_transport, 1);
        assert_eq!(snapshot.error_counts.get("timeout:transport"), Some(&1));
        assert_eq!(snapshot.latency_total_ms, 40);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let metrics = ClientMetrics::default();
        let guard = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }
}
