//! Query routing: exactly one handler per query type.
//!
//! Queries bypass the event store entirely and go straight to
//! handler-held read models.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;
use crate::registry::{HandlerError, HandlerRegistry};

/// A read-only request with exactly one handler.
///
/// Query handlers must not mutate state. This is a correctness contract
/// enforced by convention, not checked at runtime.
pub trait Query: Send + 'static {
    /// Value produced by the handler.
    type Output: Send + 'static;
}

/// Routes each query to its single registered handler.
///
/// Behaves like [`CommandBus`](crate::CommandBus): one handler per
/// type, synchronous dispatch with a bounded deadline, handler failures
/// caught at the boundary. `Clone` is cheap.
#[derive(Debug, Clone)]
pub struct QueryBus {
    registry: Arc<HandlerRegistry>,
}

impl QueryBus {
    /// Create an empty query bus with the given dispatch deadline.
    pub(crate) fn new(dispatch_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new("query", dispatch_timeout)),
        }
    }

    /// Register the handler for query type `Q`.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateHandler`] if `Q` already has one.
    pub fn register<Q, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Output, HandlerError>> + Send + 'static,
    {
        self.registry.register::<Q, Q::Output, F, Fut>(handler)
    }

    /// Dispatch a query to its handler and await the value.
    ///
    /// # Errors
    ///
    /// [`BusError::NoHandler`] if `Q` has no registered handler, or
    /// [`BusError::Handler`] carrying the handler's failure.
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        self.registry.dispatch::<Q, Q::Output>(query).await
    }

    /// Number of registered query handlers.
    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }
}
