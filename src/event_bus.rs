//! Event publication and subscription management.
//!
//! [`EventBus::publish`] persists events through the retry controller
//! and the connection pool; [`EventBus::subscribe`] spawns a delivery
//! task that tails the store. A fatal store failure trips an internal
//! gate: store-dependent operations fail fast with `StoreUnavailable`
//! (while command/query dispatch elsewhere continues) until an
//! operator-triggered [`reconnect`](EventBus::reconnect) succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};

use crate::client::ExpectedRevision;
use crate::config::BusOptions;
use crate::error::BusError;
use crate::event::ProposedEvent;
use crate::pool::ConnectionPool;
use crate::retry::{RetryController, RetryError, RetryPolicy};
use crate::subscription::{Cursor, DeliveryTask, StreamFilter, Subscription, SubscriptionMode};

/// Stream probed by [`reconnect`](EventBus::reconnect). Never written;
/// reading it exercises transport and auth without side effects.
const PROBE_STREAM: &str = "$health";

struct EventBusInner {
    controller: RetryController,
    options: BusOptions,
    /// False after a fatal store failure until a reconnect succeeds.
    store_up: AtomicBool,
    /// Broadcasts bus shutdown to every delivery task.
    shutdown_tx: watch::Sender<bool>,
    next_sub_id: AtomicU64,
}

/// Publishes events to their owning stream and delivers them to
/// subscriptions.
///
/// `Clone` is cheap: all state is behind one `Arc`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("store_up", &self.inner.store_up.load(Ordering::SeqCst))
            .finish()
    }
}

impl EventBus {
    pub(crate) fn new(pool: ConnectionPool, retry: RetryPolicy, options: BusOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(EventBusInner {
                controller: RetryController::new(pool, retry),
                options,
                store_up: AtomicBool::new(true),
                shutdown_tx,
                next_sub_id: AtomicU64::new(0),
            }),
        }
    }

    /// True while the store is considered reachable.
    ///
    /// Flips to false after a fatal failure; restored by a successful
    /// [`reconnect`](EventBus::reconnect).
    pub fn is_store_available(&self) -> bool {
        self.inner.store_up.load(Ordering::SeqCst)
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        self.inner.controller.pool()
    }

    /// Fail fast when the bus cannot currently use the store.
    fn check_gate(&self) -> Result<(), BusError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(BusError::StoreUnavailable {
                reason: "bus is shut down".to_string(),
            });
        }
        if !self.inner.store_up.load(Ordering::SeqCst) {
            return Err(BusError::StoreUnavailable {
                reason: "store marked unavailable after a fatal failure; reconnect required"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Append events to their stream with optimistic concurrency
    /// control.
    ///
    /// On success the events are durably persisted in submission order
    /// and every matching live subscription receives them, in that
    /// order, through its delivery task. Transient store failures are
    /// retried internally with backoff; the caller only sees
    /// `StoreUnavailable` once the retry bound is exhausted.
    ///
    /// # Returns
    ///
    /// The stream's new version (number of events now in the stream).
    ///
    /// # Errors
    ///
    /// [`BusError::VersionConflict`] if `expected` is stale (never
    /// retried; re-read and recompute), [`BusError::PoolExhausted`]
    /// under backpressure, [`BusError::StoreUnavailable`] after
    /// exhausted retries, or [`BusError::Fatal`] on auth/protocol
    /// rejection.
    pub async fn publish(
        &self,
        stream_id: &str,
        expected: ExpectedRevision,
        events: &[ProposedEvent],
    ) -> Result<u64, BusError> {
        self.check_gate()?;

        let result = self
            .inner
            .controller
            .run("append", |conn| {
                let stream = stream_id.to_string();
                let events = events.to_vec();
                Box::pin(async move { conn.append(&stream, expected, &events).await })
            })
            .await;

        match result {
            Ok(ack) => {
                tracing::debug!(
                    stream = %stream_id,
                    count = events.len(),
                    version = ack.next_version,
                    "events published"
                );
                Ok(ack.next_version)
            }
            Err(RetryError::Conflict(status)) => {
                tracing::debug!(stream = %stream_id, error = %status, "optimistic append lost");
                Err(BusError::VersionConflict {
                    stream_id: stream_id.to_string(),
                    expected: match expected {
                        ExpectedRevision::Exact(v) => v,
                        ExpectedRevision::NoStream | ExpectedRevision::Any => 0,
                    },
                })
            }
            Err(RetryError::Fatal(status)) => {
                self.inner.store_up.store(false, Ordering::SeqCst);
                tracing::error!(stream = %stream_id, error = %status, "store failed fatally");
                Err(BusError::Fatal {
                    reason: status.message().to_string(),
                })
            }
            Err(RetryError::Unavailable { reason }) => {
                Err(BusError::StoreUnavailable { reason })
            }
            Err(RetryError::PoolExhausted { waited_ms }) => {
                Err(BusError::PoolExhausted { waited_ms })
            }
            Err(RetryError::PoolClosed) => Err(BusError::StoreUnavailable {
                reason: "connection pool is shut down".to_string(),
            }),
        }
    }

    /// Open a subscription.
    ///
    /// With [`SubscriptionMode::CatchUpThenLive`] the subscription first
    /// replays persisted events from `from` to the end of the stream,
    /// then switches to live delivery with no gap and no duplicate at
    /// the boundary. The subscription holds one pooled connection slot
    /// until cancelled.
    ///
    /// # Errors
    ///
    /// [`BusError::StoreUnavailable`] if the bus is shut down or the
    /// store gate is closed.
    pub fn subscribe(
        &self,
        filter: StreamFilter,
        from: Cursor,
        mode: SubscriptionMode,
    ) -> Result<Subscription, BusError> {
        self.check_gate()?;

        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (out, events) = mpsc::channel(self.inner.options.subscription_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let caught_up = Arc::new(AtomicBool::new(false));
        let cursor = Arc::new(AtomicU64::new(u64::MAX));

        let task = DeliveryTask {
            id,
            controller: self.inner.controller.clone(),
            filter: filter.clone(),
            mode,
            start: from,
            out,
            cancel_rx,
            shutdown_rx: self.inner.shutdown_tx.subscribe(),
            caught_up: caught_up.clone(),
            cursor: cursor.clone(),
        };
        tokio::spawn(task.run());

        tracing::debug!(sub = id, filter = ?filter, "subscription opened");
        Ok(Subscription {
            id,
            filter,
            events,
            cancel_tx,
            caught_up,
            cursor,
        })
    }

    /// Cancel a subscription.
    ///
    /// Idempotent; releases the subscription's connection slot.
    /// Equivalent to [`Subscription::cancel`].
    pub fn cancel(&self, subscription: &Subscription) {
        subscription.cancel();
    }

    /// Operator-triggered probe that re-opens the store gate.
    ///
    /// Issues a side-effect-free read over a fresh connection. On
    /// success, store-dependent operations resume.
    ///
    /// # Errors
    ///
    /// [`BusError::Fatal`] if the store still rejects the connection,
    /// or [`BusError::StoreUnavailable`] if it stays unreachable.
    pub async fn reconnect(&self) -> Result<(), BusError> {
        let result = self
            .inner
            .controller
            .run("reconnect-probe", |conn| {
                Box::pin(async move { conn.read_forward(PROBE_STREAM, 0, 1).await })
            })
            .await;

        match result {
            Ok(_) => {
                self.inner.store_up.store(true, Ordering::SeqCst);
                tracing::info!("store reconnect probe succeeded");
                Ok(())
            }
            Err(RetryError::Fatal(status)) => Err(BusError::Fatal {
                reason: status.message().to_string(),
            }),
            Err(RetryError::PoolExhausted { waited_ms }) => {
                Err(BusError::PoolExhausted { waited_ms })
            }
            Err(other) => Err(BusError::StoreUnavailable {
                reason: format!("reconnect probe failed: {other:?}"),
            }),
        }
    }

    /// Shut the event bus down: stop every subscription (in-flight
    /// deliveries complete) and close the pool. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.controller.pool().shutdown();
        tracing::debug!("event bus shut down");
    }
}
