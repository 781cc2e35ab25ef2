//! Command routing: exactly one handler per command type.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;
use crate::registry::{HandlerError, HandlerRegistry};

/// A state-changing request with exactly one handler.
///
/// Implementations are plain data; the payload is the struct itself.
///
/// # Examples
///
/// ```
/// use streambus::Command;
///
/// struct PlaceOrder { order_id: String, total: u64 }
///
/// impl Command for PlaceOrder {
///     type Output = u64; // new stream version
/// }
/// # let _ = PlaceOrder { order_id: "o-1".into(), total: 40 };
/// ```
pub trait Command: Send + 'static {
    /// Value returned by a successful dispatch.
    type Output: Send + 'static;
}

/// Routes each command to its single registered handler.
///
/// Dispatch is synchronous from the caller's perspective (awaited to
/// completion) and does not itself retry; retries, if any, live inside
/// the handler's interaction with the event bus. `Clone` is cheap.
#[derive(Debug, Clone)]
pub struct CommandBus {
    registry: Arc<HandlerRegistry>,
}

impl CommandBus {
    /// Create an empty command bus with the given dispatch deadline.
    pub(crate) fn new(dispatch_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new("command", dispatch_timeout)),
        }
    }

    /// Register the handler for command type `C`.
    ///
    /// # Errors
    ///
    /// [`BusError::DuplicateHandler`] if `C` already has one.
    pub fn register<C, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output, HandlerError>> + Send + 'static,
    {
        self.registry.register::<C, C::Output, F, Fut>(handler)
    }

    /// Dispatch a command to its handler and await the result.
    ///
    /// Handler errors and panics are caught at this boundary and
    /// returned as [`BusError::Handler`]; a failing command cannot
    /// corrupt bus state for subsequent dispatches. The dispatch
    /// deadline bounds the wait.
    ///
    /// # Errors
    ///
    /// [`BusError::NoHandler`] if `C` has no registered handler, or
    /// [`BusError::Handler`] carrying the handler's failure.
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        self.registry.dispatch::<C, C::Output>(command).await
    }

    /// Number of registered command handlers.
    pub fn handler_count(&self) -> usize {
        self.registry.len()
    }
}
