//! Type-keyed handler registry backing the command and query buses.
//!
//! Handlers are registered explicitly at startup against the `TypeId`
//! of their message type; registration fails fast on duplicates, and
//! dispatch fails fast when no handler is present. There is no runtime
//! discovery.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::BusError;

/// Boxed error a handler may return; wrapped into
/// [`BusError::Handler`] at the bus boundary.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ErasedResult = Result<Box<dyn Any + Send>, HandlerError>;

/// Object-safe face of a registered handler.
trait ErasedHandler: Send + Sync {
    fn call(&self, msg: Box<dyn Any + Send>) -> BoxFuture<ErasedResult>;
}

type BoxedTypedHandler<M, R> =
    Box<dyn Fn(M) -> BoxFuture<Result<R, HandlerError>> + Send + Sync>;

/// Adapts a typed handler function to the erased calling convention.
struct FnHandler<M, R> {
    handler: BoxedTypedHandler<M, R>,
}

impl<M, R> ErasedHandler for FnHandler<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn call(&self, msg: Box<dyn Any + Send>) -> BoxFuture<ErasedResult> {
        // The registry keys handlers by the message's TypeId, so the
        // downcast cannot fail for messages routed through dispatch.
        let msg = msg
            .downcast::<M>()
            .expect("dispatch routed a message to a handler of another type");
        let fut = (self.handler)(*msg);
        Box::pin(async move { fut.await.map(|out| Box::new(out) as Box<dyn Any + Send>) })
    }
}

struct Registered {
    type_name: &'static str,
    handler: Arc<dyn ErasedHandler>,
}

/// Handler map plus the dispatch deadline, shared by clones of a bus.
pub(crate) struct HandlerRegistry {
    /// `"command"` or `"query"`, for logs and errors.
    kind: &'static str,
    timeout: Duration,
    handlers: RwLock<HashMap<TypeId, Registered>>,
}

/// Deadline failure surfaced as the cause of a
/// [`BusError::Handler`] error.
#[derive(Debug, thiserror::Error)]
#[error("{kind} handler for {type_name} exceeded the {timeout_ms}ms dispatch deadline")]
struct DispatchTimedOut {
    kind: &'static str,
    type_name: &'static str,
    timeout_ms: u64,
}

impl HandlerRegistry {
    pub(crate) fn new(kind: &'static str, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the one handler for message type `M`.
    pub(crate) fn register<M, R, F, Fut>(&self, handler: F) -> Result<(), BusError>
    where
        M: Send + 'static,
        R: Send + 'static,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let type_name = std::any::type_name::<M>();
        let boxed: BoxedTypedHandler<M, R> =
            Box::new(move |msg| -> BoxFuture<Result<R, HandlerError>> { Box::pin(handler(msg)) });
        let mut handlers = self.handlers.write().expect("handler registry lock poisoned");
        match handlers.entry(TypeId::of::<M>()) {
            Entry::Occupied(_) => Err(BusError::DuplicateHandler { type_name }),
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    type_name,
                    handler: Arc::new(FnHandler { handler: boxed }),
                });
                tracing::debug!(kind = self.kind, message = type_name, "handler registered");
                Ok(())
            }
        }
    }

    /// Route a message to its handler and await the result.
    ///
    /// The handler runs on its own task so a panic is contained and
    /// surfaced as a typed error instead of unwinding through the bus;
    /// the dispatch deadline aborts handlers that overrun it.
    pub(crate) async fn dispatch<M, R>(&self, msg: M) -> Result<R, BusError>
    where
        M: Send + 'static,
        R: Send + 'static,
    {
        let (type_name, handler) = {
            let handlers = self.handlers.read().expect("handler registry lock poisoned");
            match handlers.get(&TypeId::of::<M>()) {
                Some(entry) => (entry.type_name, Arc::clone(&entry.handler)),
                None => {
                    return Err(BusError::NoHandler {
                        type_name: std::any::type_name::<M>(),
                    });
                }
            }
        };

        let task = tokio::spawn(handler.call(Box::new(msg)));
        let abort = task.abort_handle();

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Err(_elapsed) => {
                abort.abort();
                tracing::warn!(
                    kind = self.kind,
                    message = type_name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "dispatch deadline exceeded"
                );
                return Err(BusError::Handler(Box::new(DispatchTimedOut {
                    kind: self.kind,
                    type_name,
                    timeout_ms: self.timeout.as_millis() as u64,
                })));
            }
            Ok(Err(join_err)) => {
                tracing::error!(
                    kind = self.kind,
                    message = type_name,
                    error = %join_err,
                    "handler task failed"
                );
                return Err(BusError::Handler(
                    format!("handler panicked: {join_err}").into(),
                ));
            }
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok(out) => Ok(*out
                .downcast::<R>()
                .expect("handler returned the registered output type")),
            Err(cause) => Err(BusError::Handler(cause)),
        }
    }

    /// Number of registered handlers.
    pub(crate) fn len(&self) -> usize {
        self.handlers
            .read()
            .expect("handler registry lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kind", &self.kind)
            .field("handlers", &self.len())
            .finish()
    }
}
