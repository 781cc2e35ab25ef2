//! Failure classification and retry with exponential backoff.
//!
//! [`RetryController`] wraps store operations: it acquires a pooled
//! connection per attempt, classifies every failure, and retries
//! transient ones with a capped, jittered exponential backoff. Version
//! conflicts and fatal failures are surfaced immediately, never retried.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;

use crate::pool::{AcquireError, ConnectionPool, PooledConnection};

/// Boxed future tied to the borrow of the connection it operates on.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a failed store operation means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connection reset, timeout, temporary unavailability. Retried
    /// with backoff up to the policy's attempt bound.
    Transient,
    /// Optimistic concurrency conflict. Surfaced immediately; the
    /// caller must re-read and recompute.
    Conflict,
    /// Auth rejected or protocol mismatch. Surfaced immediately; the
    /// connection is closed.
    Fatal,
}

impl FailureClass {
    /// Classify a gRPC status.
    pub fn of_status(status: &tonic::Status) -> Self {
        match status.code() {
            tonic::Code::FailedPrecondition => Self::Conflict,
            tonic::Code::Unauthenticated
            | tonic::Code::PermissionDenied
            | tonic::Code::Unimplemented
            | tonic::Code::InvalidArgument => Self::Fatal,
            _ => Self::Transient,
        }
    }
}

/// Retry bounds and backoff shape for transient failures.
///
/// The delay before attempt `n` (zero-based) is
/// `min(base_delay * 2^n, max_delay)` plus a random jitter of up to
/// `jitter_factor` of the capped delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries per logical operation, the first included.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Cap on the computed delay, jitter excluded.
    pub max_delay: Duration,
    /// Fraction of the capped delay added as random jitter (0.0 - 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay before retry attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay.as_millis() as u64);

        // Jitter spreads concurrent retriers out to avoid a thundering
        // herd against a recovering store.
        let jitter = if self.jitter_factor > 0.0 {
            let range = (capped as f64 * self.jitter_factor).floor() as u64;
            rand::thread_rng().gen_range(0..=range)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter))
    }

    /// Fresh per-operation retry state.
    pub fn state(&self) -> RetryState {
        RetryState {
            policy: self.clone(),
            attempt: 0,
            last_class: None,
        }
    }
}

/// Ephemeral state scoped to one logical operation.
///
/// Tracks the attempt count, the next backoff delay, and the most
/// recent failure classification.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    last_class: Option<FailureClass>,
}

impl RetryState {
    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Classification of the most recent failure, if any.
    pub fn last_class(&self) -> Option<FailureClass> {
        self.last_class
    }

    /// Record a transient failure and return the delay before the next
    /// try, or `None` once the attempt bound is exhausted.
    pub fn backoff(&mut self, class: FailureClass) -> Option<Duration> {
        self.last_class = Some(class);
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for(self.attempt - 1))
    }
}

/// Why a retried operation ultimately failed.
///
/// Carries enough detail for the event bus to map onto the public
/// [`BusError`](crate::BusError) taxonomy with operation context.
#[derive(Debug)]
pub(crate) enum RetryError {
    /// The pool's acquire timeout elapsed.
    PoolExhausted { waited_ms: u64 },
    /// The pool was shut down.
    PoolClosed,
    /// Optimistic concurrency conflict, surfaced on first occurrence.
    Conflict(tonic::Status),
    /// Unrecoverable protocol or auth failure.
    Fatal(tonic::Status),
    /// Transient failures exhausted the attempt bound.
    Unavailable { reason: String },
}

/// Drives store operations through the pool with bounded retries.
#[derive(Debug, Clone)]
pub(crate) struct RetryController {
    pool: ConnectionPool,
    policy: RetryPolicy,
}

impl RetryController {
    pub(crate) fn new(pool: ConnectionPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one logical store operation to completion or typed failure.
    ///
    /// Each attempt runs on a freshly acquired pooled connection, so a
    /// connection degraded by a previous attempt is never reused. The
    /// backoff delay is a non-busy wait.
    pub(crate) async fn run<T, F>(&self, op: &'static str, mut call: F) -> Result<T, RetryError>
    where
        F: for<'c> FnMut(&'c mut PooledConnection) -> BoxFuture<'c, Result<T, tonic::Status>>,
    {
        let mut state = self.policy.state();

        loop {
            let acquired = match self.pool.acquire().await {
                Ok(conn) => Ok(conn),
                Err(AcquireError::Exhausted { waited_ms }) => {
                    return Err(RetryError::PoolExhausted { waited_ms });
                }
                Err(AcquireError::Closed) => return Err(RetryError::PoolClosed),
                Err(AcquireError::Connect(status)) => Err(status),
            };

            let failure = match acquired {
                Ok(mut conn) => match call(&mut conn).await {
                    Ok(value) => return Ok(value),
                    Err(status) => status,
                },
                Err(status) => status,
            };

            match FailureClass::of_status(&failure) {
                FailureClass::Conflict => return Err(RetryError::Conflict(failure)),
                FailureClass::Fatal => {
                    tracing::error!(op, error = %failure, "fatal store failure");
                    return Err(RetryError::Fatal(failure));
                }
                FailureClass::Transient => match state.backoff(FailureClass::Transient) {
                    Some(delay) => {
                        tracing::warn!(
                            op,
                            attempt = state.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "transient store failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            op,
                            attempts = state.attempt(),
                            error = %failure,
                            "retries exhausted"
                        );
                        return Err(RetryError::Unavailable {
                            reason: failure.message().to_string(),
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ExpectedRevision;
    use crate::client::test_fixtures::spawn_store;
    use crate::config::BusOptions;
    use crate::event::ProposedEvent;
    use serde_json::json;

    #[test]
    fn classification_maps_grpc_codes() {
        let cases = [
            (tonic::Status::unavailable("down"), FailureClass::Transient),
            (
                tonic::Status::deadline_exceeded("slow"),
                FailureClass::Transient,
            ),
            (tonic::Status::aborted("raced"), FailureClass::Transient),
            (
                tonic::Status::failed_precondition("stale"),
                FailureClass::Conflict,
            ),
            (tonic::Status::unauthenticated("nope"), FailureClass::Fatal),
            (
                tonic::Status::permission_denied("nope"),
                FailureClass::Fatal,
            ),
        ];
        for (status, expected) in cases {
            assert_eq!(FailureClass::of_status(&status), expected, "{status:?}");
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.1,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(0).as_millis() as u64;
            assert!((200..=220).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn state_exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let mut state = policy.state();
        assert!(state.backoff(FailureClass::Transient).is_some());
        assert!(state.backoff(FailureClass::Transient).is_some());
        assert!(state.backoff(FailureClass::Transient).is_none());
        assert_eq!(state.attempt(), 3);
        assert_eq!(state.last_class(), Some(FailureClass::Transient));
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn transient_outage_is_retried_to_success() {
        let (store, settings) = spawn_store().await;
        let pool = ConnectionPool::connect(settings, BusOptions::default()).await;
        let controller = RetryController::new(pool, quick_policy(5));

        store.fail_next(2);
        let events = vec![ProposedEvent::new("OrderPlaced", json!({}))];
        let ack = controller
            .run("append", |conn| {
                let events = events.clone();
                Box::pin(async move {
                    conn.append("order-1", ExpectedRevision::Any, &events).await
                })
            })
            .await
            .expect("retries should recover from a short outage");
        assert_eq!(ack.next_version, 1);
        assert_eq!(store.stream_len("order-1").await, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let (store, settings) = spawn_store().await;
        let pool = ConnectionPool::connect(settings, BusOptions::default()).await;
        let controller = RetryController::new(pool, quick_policy(2));

        store.fail_next(10);
        let err = controller
            .run("read", |conn| {
                Box::pin(async move { conn.read_forward("order-1", 0, 10).await })
            })
            .await
            .expect_err("outage longer than the bound should surface");
        assert!(matches!(err, RetryError::Unavailable { .. }));
        // Two tries consumed two injected failures, no more.
        store.fail_next(0);
    }

    #[tokio::test]
    async fn version_conflict_is_never_retried() {
        let (store, settings) = spawn_store().await;
        let pool = ConnectionPool::connect(settings, BusOptions::default()).await;
        let controller = RetryController::new(pool, quick_policy(5));

        let seed = vec![ProposedEvent::new("OrderPlaced", json!({}))];
        controller
            .run("append", |conn| {
                let seed = seed.clone();
                Box::pin(
                    async move { conn.append("order-1", ExpectedRevision::Any, &seed).await },
                )
            })
            .await
            .expect("seed append should succeed");

        let stale = vec![ProposedEvent::new("OrderPaid", json!({}))];
        let err = controller
            .run("append", |conn| {
                let stale = stale.clone();
                Box::pin(async move {
                    conn.append("order-1", ExpectedRevision::Exact(0), &stale)
                        .await
                })
            })
            .await
            .expect_err("stale append should conflict");
        assert!(matches!(err, RetryError::Conflict(_)));
        // Exactly one losing write reached the store; nothing was retried.
        assert_eq!(store.stream_len("order-1").await, 1);
    }

    #[tokio::test]
    async fn fatal_failure_surfaces_immediately() {
        let (store, settings) = spawn_store().await;
        let pool = ConnectionPool::connect(settings, BusOptions::default()).await;
        let controller = RetryController::new(pool, quick_policy(5));

        store.set_reject_auth(true);
        let err = controller
            .run("read", |conn| {
                Box::pin(async move { conn.read_forward("order-1", 0, 10).await })
            })
            .await
            .expect_err("auth rejection should surface");
        assert!(matches!(err, RetryError::Fatal(_)));
    }
}
