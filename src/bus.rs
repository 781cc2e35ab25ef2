//! Top-level entry point composing the command, query, and event buses.
//!
//! [`Bus`] is the only surface the rest of the application calls:
//! handler registration, dispatch, publishing, and subscriptions. It is
//! opened via [`BusBuilder`], which resolves configuration once, warms
//! the connection pool, and wires every component together.

use crate::client::ExpectedRevision;
use crate::command::{Command, CommandBus};
use crate::config::{BusOptions, ConnectionSettings};
use crate::error::BusError;
use crate::event::ProposedEvent;
use crate::event_bus::EventBus;
use crate::pool::ConnectionPool;
use crate::query::{Query, QueryBus};
use crate::registry::HandlerError;
use crate::retry::RetryPolicy;
use crate::subscription::{Cursor, StreamFilter, Subscription, SubscriptionMode};

/// Configures and opens a [`Bus`].
///
/// # Examples
///
/// ```no_run
/// use streambus::{Bus, ConnectionSettings};
///
/// # async fn example() {
/// let bus = Bus::builder(ConnectionSettings::from_env())
///     .connect()
///     .await;
/// # let _ = bus;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BusBuilder {
    settings: ConnectionSettings,
    retry: RetryPolicy,
    options: BusOptions,
}

impl BusBuilder {
    /// Override the retry policy for store operations.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Override the pool-acquire and dispatch timeouts and the
    /// subscription buffer size.
    pub fn options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    /// Open the bus: warm the connection pool up to the configured
    /// `min` and wire the three buses together.
    ///
    /// Warm-up failures are logged and tolerated; the pool keeps
    /// dialing on demand.
    pub async fn connect(self) -> Bus {
        let pool = ConnectionPool::connect(self.settings, self.options).await;
        Bus {
            commands: CommandBus::new(self.options.dispatch_timeout),
            queries: QueryBus::new(self.options.dispatch_timeout),
            events: EventBus::new(pool, self.retry, self.options),
        }
    }
}

/// The application-tier message bus.
///
/// Routes commands and queries to in-process handlers and persists
/// domain events to the remote append-only store. `Clone` is cheap and
/// every clone shares the same registries, pool, and subscriptions.
#[derive(Debug, Clone)]
pub struct Bus {
    commands: CommandBus,
    queries: QueryBus,
    events: EventBus,
}

impl Bus {
    /// Start configuring a bus against the given store settings.
    pub fn builder(settings: ConnectionSettings) -> BusBuilder {
        BusBuilder {
            settings,
            retry: RetryPolicy::default(),
            options: BusOptions::default(),
        }
    }

    /// The command half of the bus.
    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    /// The query half of the bus.
    pub fn queries(&self) -> &QueryBus {
        &self.queries
    }

    /// The event half of the bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register the one handler for command type `C`.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateHandler`] if `C` already has one.
    pub fn register_command_handler<C, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
    {
        self.commands.register::<C, F, Fut>(handler)
    }

    /// Register the one handler for query type `Q`.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateHandler`] if `Q` already has one.
    pub fn register_query_handler<Q, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Output, HandlerError>> + Send + 'static,
    {
        self.queries.register::<Q, F, Fut>(handler)
    }

    /// Dispatch a command to its registered handler.
    pub async fn dispatch_command<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        self.commands.dispatch(command).await
    }

    /// Dispatch a query to its registered handler.
    pub async fn dispatch_query<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        self.queries.dispatch(query).await
    }

    /// Persist events to their stream and deliver them to matching
    /// subscriptions. See [`EventBus::publish`].
    pub async fn publish(
        &self,
        stream_id: &str,
        expected: ExpectedRevision,
        events: &[ProposedEvent],
    ) -> Result<u64, BusError> {
        self.events.publish(stream_id, expected, events).await
    }

    /// Open a subscription. See [`EventBus::subscribe`].
    pub fn subscribe(
        &self,
        filter: StreamFilter,
        from: Cursor,
        mode: SubscriptionMode,
    ) -> Result<Subscription, BusError> {
        self.events.subscribe(filter, from, mode)
    }

    /// Cancel a subscription. Idempotent.
    pub fn cancel_subscription(&self, subscription: &Subscription) {
        self.events.cancel(subscription);
    }

    /// True while the store is considered reachable.
    pub fn is_store_available(&self) -> bool {
        self.events.is_store_available()
    }

    /// Operator-triggered reconnect probe. See [`EventBus::reconnect`].
    pub async fn reconnect(&self) -> Result<(), BusError> {
        self.events.reconnect().await
    }

    /// Shut the bus down: stop subscriptions and close the pool.
    /// Command and query dispatch to in-process handlers keeps working.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.events.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_fixtures::spawn_store;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    struct PlaceOrder {
        order_id: String,
        total: u64,
    }

    impl Command for PlaceOrder {
        type Output = u64;
    }

    struct OrderTotal {
        order_id: String,
    }

    impl Query for OrderTotal {
        type Output = Option<u64>;
    }

    struct Ping;

    impl Command for Ping {
        type Output = &'static str;
    }

    #[tokio::test]
    async fn command_handler_publishes_and_subscriber_projects() {
        let (_store, settings) = spawn_store().await;
        let bus = Bus::builder(settings).connect().await;

        // Command handler: validates, then appends the resulting event
        // through the event bus with an optimistic version.
        let events = bus.events().clone();
        bus.register_command_handler::<PlaceOrder, _, _>(move |cmd: PlaceOrder| {
            let events = events.clone();
            async move {
                if cmd.total == 0 {
                    return Err("order total must be positive".into());
                }
                let stream = format!("order-{}", cmd.order_id);
                let event = ProposedEvent::new("OrderPlaced", json!({"total": cmd.total}));
                let version = events
                    .publish(&stream, ExpectedRevision::NoStream, &[event])
                    .await
                    .map_err(|e| -> HandlerError { Box::new(e) })?;
                Ok(version)
            }
        })
        .expect("command registration should succeed");

        // Query handler: reads a projection maintained by a subscriber.
        let read_model: Arc<RwLock<HashMap<String, u64>>> = Arc::new(RwLock::new(HashMap::new()));
        let totals = read_model.clone();
        bus.register_query_handler::<OrderTotal, _, _>(move |query: OrderTotal| {
            let totals = totals.clone();
            async move {
                let totals = totals.read().expect("read model lock poisoned");
                Ok(totals.get(&query.order_id).copied())
            }
        })
        .expect("query registration should succeed");

        // Projection: tail all streams into the read model.
        let mut sub = bus
            .subscribe(StreamFilter::All, Cursor::Start, SubscriptionMode::CatchUpThenLive)
            .expect("subscribe should succeed");
        let projection = {
            let read_model = read_model.clone();
            tokio::spawn(async move {
                while let Some(event) = sub.next().await {
                    let order_id = event
                        .stream_id
                        .strip_prefix("order-")
                        .unwrap_or(&event.stream_id)
                        .to_string();
                    let total = event.payload["total"].as_u64().unwrap_or(0);
                    read_model
                        .write()
                        .expect("read model lock poisoned")
                        .insert(order_id, total);
                }
            })
        };

        let version = bus
            .dispatch_command(PlaceOrder {
                order_id: "7".to_string(),
                total: 40,
            })
            .await
            .expect("dispatch should succeed");
        assert_eq!(version, 1);

        // The projection catches up and the query sees the new state.
        let total = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(total) = bus
                    .dispatch_query(OrderTotal {
                        order_id: "7".to_string(),
                    })
                    .await
                    .expect("query dispatch should succeed")
                {
                    return total;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("projection should observe the event");
        assert_eq!(total, 40);

        // Rejected command surfaces the handler's error, not a fault.
        let err = bus
            .dispatch_command(PlaceOrder {
                order_id: "8".to_string(),
                total: 0,
            })
            .await
            .expect_err("zero total should be rejected");
        assert!(matches!(err, BusError::Handler(_)));

        bus.shutdown();
        projection.await.expect("projection task should finish");
    }

    #[tokio::test]
    async fn store_free_handlers_keep_dispatching_while_store_is_down() {
        let (store, settings) = spawn_store().await;
        let bus = Bus::builder(settings)
            .retry_policy(quick_policy())
            .connect()
            .await;

        bus.register_command_handler::<Ping, _, _>(|_cmd: Ping| async move { Ok("pong") })
            .expect("registration should succeed");

        // The store goes dark; a store-touching publish exhausts its
        // retries and fails with StoreUnavailable.
        store.fail_next(1000);
        let err = bus
            .publish(
                "order-1",
                ExpectedRevision::Any,
                &[ProposedEvent::new("Tick", json!({}))],
            )
            .await
            .expect_err("publish should fail during the outage");
        assert!(matches!(err, BusError::StoreUnavailable { .. }));

        // A command whose handler does not touch the store still works.
        let pong = bus
            .dispatch_command(Ping)
            .await
            .expect("store-free dispatch must keep working");
        assert_eq!(pong, "pong");
    }

    #[tokio::test]
    async fn facade_rejects_duplicate_registrations() {
        let (_store, settings) = spawn_store().await;
        let bus = Bus::builder(settings).connect().await;

        bus.register_command_handler::<Ping, _, _>(|_cmd: Ping| async move { Ok("pong") })
            .expect("first registration should succeed");
        let err = bus
            .register_command_handler::<Ping, _, _>(|_cmd: Ping| async move { Ok("pong") })
            .expect_err("duplicate must be rejected");
        assert!(matches!(err, BusError::DuplicateHandler { .. }));
    }

    #[tokio::test]
    async fn builder_overrides_apply() {
        let (_store, settings) = spawn_store().await;
        let options = BusOptions {
            acquire_timeout: Duration::from_millis(50),
            dispatch_timeout: Duration::from_millis(200),
            subscription_buffer: 8,
        };
        let bus = Bus::builder(settings.with_pool_bounds(2, 3))
            .options(options)
            .retry_policy(quick_policy())
            .connect()
            .await;

        assert_eq!(bus.events().pool().bounds().max, 3);
        assert_eq!(bus.events().pool().live_connections(), 2);
    }

    #[tokio::test]
    async fn cancel_subscription_via_the_facade_is_idempotent() {
        let (_store, settings) = spawn_store().await;
        let bus = Bus::builder(settings).connect().await;

        let sub = bus
            .subscribe(
                StreamFilter::Stream("order-1".to_string()),
                Cursor::Start,
                SubscriptionMode::CatchUpThenLive,
            )
            .expect("subscribe should succeed");
        bus.cancel_subscription(&sub);
        bus.cancel_subscription(&sub);
    }
}
