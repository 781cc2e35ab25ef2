//! Application-tier command/query/event bus backed by a remote
//! append-only event store reached over a pooled gRPC transport.

mod auth;
mod bus;
mod client;
mod command;
mod config;
mod error;
mod event;
mod event_bus;
mod pool;
mod query;
mod registry;
mod retry;
mod subscription;

/// Generated gRPC bindings for the event store wire contract.
pub mod proto {
    tonic::include_proto!("streambus");
}

pub use bus::{Bus, BusBuilder};
pub use client::{ConnectionState, ExpectedRevision, StoreClient};
pub use command::{Command, CommandBus};
pub use config::{BusOptions, ConnectionSettings, Credentials, PoolBounds};
pub use error::BusError;
pub use event::{EventMetadata, ProposedEvent, StoredEvent};
pub use event_bus::EventBus;
pub use pool::{AcquireError, ConnectionPool, PooledConnection};
pub use query::{Query, QueryBus};
pub use registry::HandlerError;
pub use retry::{FailureClass, RetryPolicy, RetryState};
pub use subscription::{Cursor, StreamFilter, Subscription, SubscriptionMode};
