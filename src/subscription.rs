//! Subscription handles and the per-subscription delivery loop.
//!
//! Every subscription runs one background task that holds a pooled
//! connection, consumes the store's catch-up-then-live stream, and
//! forwards decoded events to the subscriber in strict sequence order.
//! The task reconnects with exponential backoff after stream errors,
//! resuming from the exact cursor it last delivered, so the subscriber
//! observes no gap and no duplicate across the catch-up/live boundary
//! or across reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

use crate::event::{StoredEvent, decode_stored_event};
use crate::pool::AcquireError;
use crate::proto::subscribe_response::Content;
use crate::retry::{FailureClass, RetryController};

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    /// Events of one named stream, ordered by `stream_version`.
    Stream(String),
    /// Every event in the store, ordered by `global_position`.
    All,
}

impl StreamFilter {
    /// True if the event falls under this filter.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        match self {
            Self::Stream(id) => &event.stream_id == id,
            Self::All => true,
        }
    }

    /// The sequence number a subscription with this filter orders by.
    pub(crate) fn sequence_of(&self, event: &StoredEvent) -> u64 {
        match self {
            Self::Stream(_) => event.stream_version,
            Self::All => event.global_position,
        }
    }
}

/// Where a subscription starts delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// From the beginning of the stream (or global log).
    Start,
    /// Strictly after this sequence number, the last one already
    /// delivered elsewhere.
    After(u64),
}

impl Cursor {
    /// First sequence number this cursor admits.
    fn first(self) -> u64 {
        match self {
            Self::Start => 0,
            Self::After(seq) => seq + 1,
        }
    }
}

/// Whether historical events are replayed before live delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Replay persisted events from the cursor, then switch to live
    /// delivery with no gap and no duplicate at the boundary.
    CatchUpThenLive,
    /// Deliver only events recorded after the subscription was opened.
    LiveOnly,
}

/// Sentinel for "nothing delivered yet" in the shared cursor cell.
const NO_CURSOR: u64 = u64::MAX;

/// A live subscription owned by the subscriber.
///
/// Lives until [`cancel`](Subscription::cancel) or bus shutdown.
/// Dropping the handle cancels it as well.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) filter: StreamFilter,
    pub(crate) events: mpsc::Receiver<StoredEvent>,
    pub(crate) cancel_tx: watch::Sender<bool>,
    pub(crate) caught_up: Arc<AtomicBool>,
    pub(crate) cursor: Arc<AtomicU64>,
}

impl Subscription {
    /// Identifier of this subscription, unique within the bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The filter this subscription was opened with.
    pub fn filter(&self) -> &StreamFilter {
        &self.filter
    }

    /// Receive the next event, in strict sequence order.
    ///
    /// Returns `None` once the subscription is finished: cancelled, the
    /// bus shut down, or the store stayed unreachable beyond the retry
    /// bound. [`cursor`](Subscription::cursor) then tells where a
    /// replacement subscription should resume.
    pub async fn next(&mut self) -> Option<StoredEvent> {
        self.events.recv().await
    }

    /// Last delivered sequence number, or `None` before the first
    /// delivery. Advances exactly once per delivered event.
    pub fn cursor(&self) -> Option<u64> {
        match self.cursor.load(Ordering::Acquire) {
            NO_CURSOR => None,
            seq => Some(seq),
        }
    }

    /// True once historical replay has completed at least once.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Stop further delivery. In-flight delivery of the current event
    /// still completes; events already delivered stay delivered.
    ///
    /// Idempotent: cancelling twice is a no-op the second time.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Everything the delivery task needs, bundled for the spawn site.
pub(crate) struct DeliveryTask {
    pub(crate) id: u64,
    pub(crate) controller: RetryController,
    pub(crate) filter: StreamFilter,
    pub(crate) mode: SubscriptionMode,
    pub(crate) start: Cursor,
    pub(crate) out: mpsc::Sender<StoredEvent>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) caught_up: Arc<AtomicBool>,
    pub(crate) cursor: Arc<AtomicU64>,
}

/// Outcome of consuming one subscribe stream until it ends or errors.
enum StreamOutcome {
    /// The server closed the stream cleanly.
    Ended,
    /// Delivery is finished: cancelled, shut down, or the subscriber
    /// dropped its receiver.
    Finished,
    /// The stream failed and the connection should be discarded.
    Error(tonic::Status),
}

impl DeliveryTask {
    /// Run the delivery loop to completion.
    ///
    /// Holds one pooled connection per subscribe stream; the connection
    /// slot is released whenever the stream ends and on exit, so a
    /// cancelled subscription frees its slot immediately.
    pub(crate) async fn run(mut self) {
        let policy = self.controller.policy().clone();
        // `next` is the lowest sequence number still undelivered;
        // `delivering` is false while a live-only subscription is still
        // anchoring itself at the end of history.
        let mut next = self.start.first();
        let mut delivering = self.mode == SubscriptionMode::CatchUpThenLive;
        let mut retry = policy.state();

        loop {
            if self.finished() {
                return;
            }

            let mut conn = match self.controller.pool().acquire().await {
                Ok(conn) => conn,
                Err(AcquireError::Closed) => return,
                Err(e) => {
                    tracing::warn!(sub = self.id, error = %e, "subscription connect failed");
                    if !self.backoff_or_finish(&mut retry).await {
                        return;
                    }
                    continue;
                }
            };

            let stream = match conn.subscribe(&self.filter, next).await {
                Ok(stream) => stream,
                Err(status) => {
                    if FailureClass::of_status(&status) == FailureClass::Fatal {
                        tracing::error!(sub = self.id, error = %status, "subscription rejected");
                        return;
                    }
                    drop(conn);
                    tracing::warn!(sub = self.id, error = %status, "subscribe failed");
                    if !self.backoff_or_finish(&mut retry).await {
                        return;
                    }
                    continue;
                }
            };

            let outcome = self
                .consume(stream, &mut next, &mut delivering, &mut retry)
                .await;

            match outcome {
                StreamOutcome::Finished => return,
                StreamOutcome::Ended => {
                    // Clean close. Resubscribe from the cursor; the close
                    // still counts against the reconnect budget so a
                    // fast-closing server cannot spin the loop. Progress
                    // resets the budget.
                    tracing::debug!(sub = self.id, next, "subscribe stream ended, resuming");
                    if !self.backoff_or_finish(&mut retry).await {
                        return;
                    }
                }
                StreamOutcome::Error(status) => {
                    conn.mark_degraded();
                    drop(conn);
                    tracing::warn!(sub = self.id, error = %status, "subscribe stream error");
                    if !self.backoff_or_finish(&mut retry).await {
                        return;
                    }
                }
            }
        }
    }

    /// Consume one subscribe stream, forwarding events in order.
    async fn consume(
        &mut self,
        mut stream: tonic::Streaming<crate::proto::SubscribeResponse>,
        next: &mut u64,
        delivering: &mut bool,
        retry: &mut crate::retry::RetryState,
    ) -> StreamOutcome {
        loop {
            let item = tokio::select! {
                _ = self.cancel_rx.changed() => return StreamOutcome::Finished,
                _ = self.shutdown_rx.changed() => return StreamOutcome::Finished,
                item = stream.next() => item,
            };

            match item {
                None => return StreamOutcome::Ended,
                Some(Err(status)) => return StreamOutcome::Error(status),
                Some(Ok(msg)) => match msg.content {
                    Some(Content::CaughtUp(_)) => {
                        // Replay/live boundary: live-only subscriptions
                        // are now anchored; a successful catch-up resets
                        // the reconnect budget.
                        *delivering = true;
                        self.caught_up.store(true, Ordering::Release);
                        *retry = self.controller.policy().state();
                        tracing::debug!(sub = self.id, next = *next, "subscription caught up");
                    }
                    Some(Content::Event(recorded)) => {
                        let Some(stored) = decode_stored_event(&recorded) else {
                            // Foreign or corrupt event; skip without
                            // advancing the cursor past real events.
                            continue;
                        };
                        if !self.filter.matches(&stored) {
                            continue;
                        }
                        let seq = self.filter.sequence_of(&stored);
                        if seq < *next {
                            // Duplicate from replay overlap after a
                            // reconnect.
                            continue;
                        }
                        if !*delivering {
                            // Live-only, still anchoring: note the
                            // position, skip the event.
                            *next = seq + 1;
                            continue;
                        }
                        if self.out.send(stored).await.is_err() {
                            return StreamOutcome::Finished;
                        }
                        *next = seq + 1;
                        self.cursor.store(seq, Ordering::Release);
                        *retry = self.controller.policy().state();
                    }
                    None => {}
                },
            }
        }
    }

    /// True once the subscription was cancelled or the bus shut down.
    fn finished(&self) -> bool {
        *self.cancel_rx.borrow() || *self.shutdown_rx.borrow()
    }

    /// Sleep out the next backoff delay, or report that the retry
    /// budget for this (re)connect is exhausted. Returns `false` when
    /// the loop should stop.
    async fn backoff_or_finish(&mut self, retry: &mut crate::retry::RetryState) -> bool {
        let Some(delay) = retry.backoff(FailureClass::Transient) else {
            tracing::error!(
                sub = self.id,
                attempts = retry.attempt(),
                "subscription reconnect attempts exhausted, store unavailable"
            );
            return false;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel_rx.changed() => false,
            _ = self.shutdown_rx.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_fixtures::spawn_store;
    use crate::client::{ExpectedRevision, StoreClient};
    use crate::config::{BusOptions, ConnectionSettings};
    use crate::event::ProposedEvent;
    use crate::pool::ConnectionPool;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    async fn controller_for(settings: &ConnectionSettings) -> RetryController {
        let pool = ConnectionPool::connect(settings.clone(), BusOptions::default()).await;
        RetryController::new(pool, quick_policy())
    }

    /// Spawn a delivery task and hand back the subscriber-facing handle
    /// plus the bus-shutdown sender keeping the task alive.
    fn open(
        controller: RetryController,
        filter: StreamFilter,
        mode: SubscriptionMode,
        start: Cursor,
    ) -> (Subscription, watch::Sender<bool>) {
        let (out, events) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let caught_up = Arc::new(AtomicBool::new(false));
        let cursor = Arc::new(AtomicU64::new(NO_CURSOR));

        let task = DeliveryTask {
            id: 1,
            controller,
            filter: filter.clone(),
            mode,
            start,
            out,
            cancel_rx,
            shutdown_rx,
            caught_up: caught_up.clone(),
            cursor: cursor.clone(),
        };
        tokio::spawn(task.run());

        let sub = Subscription {
            id: 1,
            filter,
            events,
            cancel_tx,
            caught_up,
            cursor,
        };
        (sub, shutdown_tx)
    }

    async fn append_ticks(settings: &ConnectionSettings, stream: &str, range: std::ops::Range<u64>) {
        let mut client = StoreClient::new(settings);
        client.connect().await.expect("connect should succeed");
        let events: Vec<_> = range
            .map(|n| ProposedEvent::new("Tick", json!({"n": n})))
            .collect();
        client
            .append(stream, ExpectedRevision::Any, &events)
            .await
            .expect("append should succeed");
    }

    async fn recv_or_timeout(sub: &mut Subscription) -> StoredEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("event should arrive in time")
            .expect("subscription should stay open")
    }

    #[test]
    fn filter_matches_and_orders_by_the_right_sequence() {
        let event = StoredEvent {
            event_id: uuid::Uuid::new_v4(),
            stream_id: "order-1".to_string(),
            stream_version: 2,
            global_position: 40,
            event_type: "OrderPlaced".to_string(),
            payload: json!({}),
            metadata: Default::default(),
            produced_at: 0,
            recorded_at: 0,
        };

        let stream = StreamFilter::Stream("order-1".to_string());
        assert!(stream.matches(&event));
        assert_eq!(stream.sequence_of(&event), 2);

        let other = StreamFilter::Stream("order-2".to_string());
        assert!(!other.matches(&event));

        assert!(StreamFilter::All.matches(&event));
        assert_eq!(StreamFilter::All.sequence_of(&event), 40);
    }

    #[test]
    fn cursor_first_admits_the_right_sequence() {
        assert_eq!(Cursor::Start.first(), 0);
        assert_eq!(Cursor::After(4).first(), 5);
    }

    #[tokio::test]
    async fn catch_up_then_live_has_no_gap_and_no_duplicate() {
        let (_store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..3).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::CatchUpThenLive,
            Cursor::Start,
        );

        for expected in 0..3 {
            let event = recv_or_timeout(&mut sub).await;
            assert_eq!(event.stream_version, expected);
        }
        assert_eq!(sub.cursor(), Some(2));

        // A subsequently published event arrives live, with no repeat of
        // the first three.
        append_ticks(&settings, "order-1", 3..4).await;
        let event = recv_or_timeout(&mut sub).await;
        assert_eq!(event.stream_version, 3);
        assert!(sub.is_caught_up());
        assert_eq!(sub.cursor(), Some(3));
    }

    #[tokio::test]
    async fn resume_cursor_skips_already_delivered_events() {
        let (_store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..4).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::CatchUpThenLive,
            Cursor::After(1),
        );

        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 2);
        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 3);
    }

    #[tokio::test]
    async fn live_only_skips_history() {
        let (_store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..3).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::LiveOnly,
            Cursor::Start,
        );

        // Wait until the subscription is anchored past history.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sub.is_caught_up() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription should anchor");

        append_ticks(&settings, "order-1", 3..4).await;
        let event = recv_or_timeout(&mut sub).await;
        assert_eq!(event.stream_version, 3, "history must be skipped");
    }

    #[tokio::test]
    async fn all_streams_filter_interleaves_by_global_position() {
        let (_store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..2).await;
        append_ticks(&settings, "order-2", 0..2).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::All,
            SubscriptionMode::CatchUpThenLive,
            Cursor::Start,
        );

        let mut positions = Vec::new();
        for _ in 0..4 {
            positions.push(recv_or_timeout(&mut sub).await.global_position);
        }
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancel_stops_delivery_and_is_idempotent() {
        let (_store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..1).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::CatchUpThenLive,
            Cursor::Start,
        );
        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 0);

        sub.cancel();
        // Cancelling again is a no-op, not an error.
        sub.cancel();

        // The channel drains and closes; no further events arrive even
        // after new appends.
        append_ticks(&settings, "order-1", 1..2).await;
        let end = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("channel should close after cancel");
        assert!(end.is_none(), "no delivery after cancellation");
    }

    #[tokio::test]
    async fn stream_break_resumes_from_cursor_without_gap_or_duplicate() {
        let (store, settings) = spawn_store().await;
        append_ticks(&settings, "order-1", 0..2).await;

        let controller = controller_for(&settings).await;
        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::CatchUpThenLive,
            Cursor::Start,
        );
        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 0);
        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 1);

        // Sever every open subscribe stream; the delivery task must
        // reconnect and resume exactly after its cursor.
        store.break_streams();
        append_ticks(&settings, "order-1", 2..4).await;

        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 2);
        assert_eq!(recv_or_timeout(&mut sub).await.stream_version, 3);
    }

    #[tokio::test]
    async fn unreachable_store_ends_subscription_after_retry_budget() {
        let settings = ConnectionSettings::new("127.0.0.1", 1).with_pool_bounds(0, 2);
        let pool = ConnectionPool::connect(settings.clone(), BusOptions::default()).await;
        let controller = RetryController::new(pool, quick_policy());

        let (mut sub, _shutdown) = open(
            controller,
            StreamFilter::Stream("order-1".to_string()),
            SubscriptionMode::CatchUpThenLive,
            Cursor::Start,
        );

        let end = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("subscription should give up within the retry budget");
        assert!(end.is_none());
        assert_eq!(sub.cursor(), None, "nothing was delivered");
    }
}
