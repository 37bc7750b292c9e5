//! Resilience: retry with backoff and per-call timeouts
//!
//! What this module provides
//! - Cross-cutting, reusable middleware for reliability under failure
//!
//! Exports
//! - Models
//!   - `Backoff { initial, multiplier, max }`
//!   - `RetryPolicy { max_retries, backoff }`
//! - Layers
//!   - `RetryLayer<C>` where `C: ErrorClassifier`
//!   - `TimeoutLayer(Duration)` mapping elapsed deadlines to `InferenceError::Timeout`
//! - Utils
//!   - `execute(op, policy)` for call sites that are not Tower services
//!   - `ClassifyByTaxonomy` default classifier backed by `InferenceError::class`
//!
//! Implementation strategy
//! - Retry wraps the inner service; transient errors per the classifier are
//!   retried with exponential backoff, permanent and protocol errors fail fast
//! - Timeouts are retryable, so `RetryLayer` composes OUTSIDE `TimeoutLayer`
//!   for a per-attempt deadline
//!
//! Testing strategy
//! - Scripted operations (fail, fail, succeed) asserting attempt counts
//! - An unauthorized-class error asserting zero retries

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::warn;

use crate::error::{ErrorClass, InferenceError};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mult = self.multiplier.powi(attempt as i32);
        let d = self.initial.mul_f64(mult);
        if d > self.max {
            self.max
        } else {
            d
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            multiplier: 2.0,
            max: Duration::from_millis(10_000),
        }
    }
}

/// Retry budget plus its backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Run `op` under `policy`.
///
/// `op` is re-invoked to build a fresh future for every attempt, so the call
/// is reentrant: all state lives in loop-local counters. Permanent and
/// protocol-class failures are surfaced immediately; a drained budget is
/// reported as `RetriesExhausted` carrying the attempt count and last cause.
pub async fn execute<T, F, Fut>(mut op: F, policy: &RetryPolicy) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
{
    let mut attempt: usize = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.class() != ErrorClass::Transient {
                    return Err(err);
                }
                if attempt >= policy.max_retries {
                    return Err(InferenceError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }
                let delay = policy.backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Decides whether an error is worth another attempt.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn retryable(&self, error: &BoxError) -> bool;
}

/// Default classifier: consult the typed taxonomy; errors that are not an
/// `InferenceError` are assumed transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyByTaxonomy;

impl ErrorClassifier for ClassifyByTaxonomy {
    fn retryable(&self, error: &BoxError) -> bool {
        match error.downcast_ref::<InferenceError>() {
            Some(e) => e.class() == ErrorClass::Transient,
            None => true,
        }
    }
}

pub struct RetryLayer<C = ClassifyByTaxonomy> {
    policy: RetryPolicy,
    classifier: C,
}

impl RetryLayer<ClassifyByTaxonomy> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: ClassifyByTaxonomy,
        }
    }
}

impl<C> RetryLayer<C> {
    pub fn with_classifier(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }
}

pub struct Retry<S, C> {
    inner: Arc<Mutex<S>>,
    policy: RetryPolicy,
    classifier: C,
}

impl<S, C> Layer<S> for RetryLayer<C>
where
    C: Clone,
{
    type Service = Retry<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C> Clone for Retry<S, C>
where
    C: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            policy: self.policy,
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req> Service<Req> for Retry<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    C: ErrorClassifier + Clone + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let policy = self.policy;
        let classifier = self.classifier.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut attempt: usize = 0;
            loop {
                let result = {
                    let mut guard = inner.lock().await;
                    ServiceExt::ready(&mut *guard).await?.call(req.clone()).await
                };
                match result {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if !classifier.retryable(&e) {
                            return Err(e);
                        }
                        if attempt >= policy.max_retries {
                            let last = InferenceError::from_boxed(e);
                            return Err(Box::new(InferenceError::RetriesExhausted {
                                attempts: attempt + 1,
                                last: Box::new(last),
                            }) as BoxError);
                        }
                        let delay = policy.backoff.delay_for_attempt(attempt);
                        attempt += 1;
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying service call"
                        );
                        sleep(delay).await;
                    }
                }
            }
        })
    }
}

pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

impl<S: Clone> Clone for Timeout<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dur: self.dur,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let dur = self.dur;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(InferenceError::Timeout(dur)) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Backoff::exponential(
                Duration::from_millis(1),
                2.0,
                Duration::from_millis(4),
            ),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::default();
        let delays: Vec<u64> = (0..5)
            .map(|a| b.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
        // Non-decreasing and capped at max thereafter.
        assert_eq!(b.delay_for_attempt(9), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn execute_succeeds_after_two_retries() {
        let calls = AtomicUsize::new(0);
        let out = execute(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(InferenceError::Transport {
                        message: "reset".into(),
                    })
                } else {
                    Ok(42u32)
                }
            },
            &fast_policy(3),
        )
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
    }

    #[tokio::test]
    async fn execute_fails_fast_on_auth() {
        let calls = AtomicUsize::new(0);
        let err = execute(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(InferenceError::Auth {
                    message: "401 unauthorized".into(),
                })
            },
            &fast_policy(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InferenceError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1); // zero retries
    }

    #[tokio::test]
    async fn execute_reports_attempts_when_exhausted() {
        let err = execute(
            || async {
                Err::<(), _>(InferenceError::Upstream {
                    status: 503,
                    message: "unavailable".into(),
                })
            },
            &fast_policy(2),
        )
        .await
        .unwrap_err();
        match err {
            InferenceError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, InferenceError::Upstream { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn retry_layer_eventually_succeeds() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let svc = service_fn(|()| async move {
            let n = COUNT.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err::<u32, BoxError>(Box::new(InferenceError::Transport {
                    message: "reset".into(),
                }))
            } else {
                Ok::<u32, BoxError>(7)
            }
        });
        let mut svc = RetryLayer::new(fast_policy(5)).layer(svc);
        let out = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn retry_layer_does_not_retry_protocol_errors() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let svc = service_fn(|()| async move {
            COUNT.fetch_add(1, Ordering::SeqCst);
            Err::<u32, BoxError>(Box::new(InferenceError::Protocol("bad shape".into())))
        });
        let mut svc = RetryLayer::new(fast_policy(5)).layer(svc);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert!(matches!(
            InferenceError::from_boxed(err),
            InferenceError::Protocol(_)
        ));
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_typed_error() {
        let svc = service_fn(|()| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<(), BoxError>(())
        });
        let mut svc = TimeoutLayer::new(Duration::from_millis(5)).layer(svc);
        let err = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(())
            .await
            .unwrap_err();
        assert!(matches!(
            InferenceError::from_boxed(err),
            InferenceError::Timeout(_)
        ));
    }
}
