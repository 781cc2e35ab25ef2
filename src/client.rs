//! Thin, typed driver over one transport session to the event store.
//!
//! [`StoreClient`] wraps the tonic-generated gRPC client and exposes
//! ergonomic async methods ([`StoreClient::append`],
//! [`StoreClient::read_forward`], [`StoreClient::subscribe`]) that accept
//! and return Rust-native types, so the pool, retry, and bus modules
//! never import tonic internals directly. Each client is one connection
//! and carries the per-connection state machine of that session.

use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};

use crate::auth::BasicAuthInterceptor;
use crate::config::ConnectionSettings;
use crate::event::{ProposedEvent, to_proto_event};
use crate::proto;
use crate::proto::event_store_client::EventStoreClient;
use crate::retry::FailureClass;
use crate::subscription::StreamFilter;

/// Authenticated gRPC client with the basic-auth interceptor attached.
type AuthClient = EventStoreClient<InterceptedService<Channel, BasicAuthInterceptor>>;

/// Lifecycle state of one transport session.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Degraded -> (Connecting | Closed)
/// ```
///
/// `Degraded` connections are not usable for new operations; the retry
/// layer either drives them back through `Connecting` or the pool
/// discards them. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session exists yet.
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// Healthy and usable for operations.
    Connected,
    /// An I/O error or disconnect was observed; not usable until
    /// reconnected.
    Degraded,
    /// Terminal: fatal protocol or auth failure, or explicit close.
    Closed,
}

/// Expected stream version for an optimistic append.
///
/// [`Exact`](ExpectedRevision::Exact) is the concurrency-control
/// primitive: the append is rejected with a version conflict if the
/// stream's current version differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must hold exactly this many events.
    Exact(u64),
}

impl ExpectedRevision {
    /// Convert to the wire [`ExpectedVersion`](proto::ExpectedVersion) message.
    pub(crate) fn to_proto(self) -> proto::ExpectedVersion {
        let kind = match self {
            Self::Any => proto::expected_version::Kind::Any(proto::Empty {}),
            Self::NoStream => proto::expected_version::Kind::NoStream(proto::Empty {}),
            Self::Exact(v) => proto::expected_version::Kind::Exact(v),
        };
        proto::ExpectedVersion { kind: Some(kind) }
    }
}

/// One transport session to the event store.
///
/// Owned exclusively by the [`ConnectionPool`](crate::pool::ConnectionPool)
/// while idle and lent to exactly one in-flight operation while busy;
/// never shared concurrently.
#[derive(Debug)]
pub struct StoreClient {
    endpoint: String,
    interceptor: BasicAuthInterceptor,
    inner: Option<AuthClient>,
    state: ConnectionState,
}

impl StoreClient {
    /// Create a disconnected client for the given settings.
    ///
    /// No I/O happens until [`connect`](Self::connect) is called.
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            endpoint: settings.endpoint_uri(),
            interceptor: BasicAuthInterceptor::new(&settings.credentials),
            inner: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Current lifecycle state of this session.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True if the session is healthy and usable for new operations.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Mark the session degraded after an external I/O observation.
    pub(crate) fn mark_degraded(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Degraded;
        }
    }

    /// Close the session terminally.
    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.inner = None;
    }

    /// Establish (or re-establish) the transport session.
    ///
    /// Transitions `Disconnected`/`Degraded -> Connecting -> Connected` on
    /// success, or back to `Degraded` on handshake failure. A `Closed`
    /// client refuses to reconnect.
    ///
    /// # Errors
    ///
    /// Returns a [`tonic::Status`] describing the handshake failure.
    pub async fn connect(&mut self) -> Result<(), tonic::Status> {
        if self.state == ConnectionState::Closed {
            return Err(tonic::Status::permission_denied(
                "connection is closed and cannot reconnect",
            ));
        }

        self.state = ConnectionState::Connecting;
        let endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| tonic::Status::invalid_argument(format!("bad endpoint: {e}")))?;

        match endpoint.connect().await {
            Ok(channel) => {
                self.inner = Some(EventStoreClient::with_interceptor(
                    channel,
                    self.interceptor.clone(),
                ));
                self.state = ConnectionState::Connected;
                tracing::debug!(endpoint = %self.endpoint, "store connection established");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Degraded;
                tracing::warn!(endpoint = %self.endpoint, error = %e, "store handshake failed");
                Err(tonic::Status::unavailable(format!("connect failed: {e}")))
            }
        }
    }

    /// Borrow the inner client, failing if the session is not usable.
    fn usable_inner(&self) -> Result<&AuthClient, tonic::Status> {
        if self.state != ConnectionState::Connected {
            return Err(tonic::Status::unavailable(format!(
                "connection is {:?}, not usable",
                self.state
            )));
        }
        self.inner
            .as_ref()
            .ok_or_else(|| tonic::Status::unavailable("connection has no transport"))
    }

    /// Record the outcome of an RPC on the session state machine.
    ///
    /// Transient I/O failures degrade the session; fatal protocol or auth
    /// failures close it. Version conflicts are logical outcomes and
    /// leave the session healthy.
    fn observe(&mut self, status: &tonic::Status) {
        match FailureClass::of_status(status) {
            FailureClass::Transient => self.mark_degraded(),
            FailureClass::Fatal => self.mark_closed(),
            FailureClass::Conflict => {}
        }
    }

    /// Append events to a stream with optimistic concurrency control.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream key.
    /// * `expected` - Expected current stream version.
    /// * `events` - Events to append, in submission order.
    ///
    /// # Returns
    ///
    /// The store's [`AppendResponse`](proto::AppendResponse) carrying the
    /// assigned stream versions and global positions.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] on transport errors, version conflicts
    /// (`FAILED_PRECONDITION`), or server-side failures.
    pub async fn append(
        &mut self,
        stream_id: &str,
        expected: ExpectedRevision,
        events: &[ProposedEvent],
    ) -> Result<proto::AppendResponse, tonic::Status> {
        let request = proto::AppendRequest {
            stream_id: stream_id.to_string(),
            expected_version: Some(expected.to_proto()),
            events: events.iter().map(to_proto_event).collect(),
        };

        // Clone the inner tonic client per RPC. This is cheap: it wraps
        // the channel, which is an Arc'd hyper connection.
        let result = self.usable_inner()?.clone().append(request).await;
        match result {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.observe(&status);
                Err(status)
            }
        }
    }

    /// Read events from a single stream starting at a given version.
    ///
    /// Restartable: a caller holding the last seen version can resume
    /// with `from_version` one past it.
    ///
    /// # Returns
    ///
    /// Recorded events in stream-version order. A stream that has never
    /// been written to reads as empty rather than erroring, so catch-up
    /// can start on streams that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] on transport or server-side errors.
    pub async fn read_forward(
        &mut self,
        stream_id: &str,
        from_version: u64,
        max_count: u64,
    ) -> Result<Vec<proto::RecordedEvent>, tonic::Status> {
        let request = proto::ReadStreamRequest {
            stream_id: stream_id.to_string(),
            from_version,
            max_count,
        };

        let result = self.usable_inner()?.clone().read_stream(request).await;
        match result {
            Ok(response) => Ok(response.into_inner().events),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(Vec::new()),
            Err(status) => {
                self.observe(&status);
                Err(status)
            }
        }
    }

    /// Open a catch-up-then-live subscription on the store.
    ///
    /// Produces a lazy, potentially infinite stream of
    /// [`SubscribeResponse`](proto::SubscribeResponse) messages: recorded
    /// events from the cursor onward, a `CaughtUp` sentinel at the
    /// replay/live boundary, then live events. Restartable by opening a
    /// new subscription from the last delivered cursor.
    ///
    /// # Arguments
    ///
    /// * `filter` - One stream or all streams.
    /// * `from` - Cursor: `stream_version` for a stream subscription,
    ///   `global_position` for an all-streams one.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::Status`] if the initial handshake fails.
    pub async fn subscribe(
        &mut self,
        filter: &StreamFilter,
        from: u64,
    ) -> Result<tonic::Streaming<proto::SubscribeResponse>, tonic::Status> {
        let target = match filter {
            StreamFilter::Stream(id) => proto::subscribe_request::Target::StreamId(id.clone()),
            StreamFilter::All => proto::subscribe_request::Target::All(proto::Empty {}),
        };
        let request = proto::SubscribeRequest {
            target: Some(target),
            from,
        };

        let result = self.usable_inner()?.clone().subscribe(request).await;
        match result {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.observe(&status);
                Err(status)
            }
        }
    }
}
