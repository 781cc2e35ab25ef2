//! Crate-level error taxonomy for bus operations.

/// Error returned by bus entry points.
///
/// Every failure a caller can observe maps onto exactly one variant:
/// concurrency conditions (`VersionConflict`) and registration mistakes
/// (`NoHandler`, `DuplicateHandler`) surface immediately for local
/// recovery, transient network failures are retried internally and only
/// surface as `StoreUnavailable` once retries are exhausted, and
/// unrecoverable protocol or auth failures surface as `Fatal`.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No pooled connection became available within the acquire timeout.
    ///
    /// The pool is at its `max` bound with every connection lent out.
    /// Backpressure condition, not a store failure.
    #[error("connection pool exhausted: no connection available within {waited_ms}ms")]
    PoolExhausted {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// An optimistic append found the stream at a different version.
    ///
    /// Never retried internally. The caller must re-read the stream and
    /// recompute before retrying with the updated version.
    #[error("version conflict on stream '{stream_id}': expected version {expected}")]
    VersionConflict {
        /// Stream the append targeted.
        stream_id: String,
        /// Version the append expected the stream to be at.
        expected: u64,
    },

    /// The store could not be reached within the configured retry bound.
    ///
    /// The bus stays alive in degraded mode: handlers that do not touch
    /// the store keep dispatching, store-dependent operations fail fast.
    #[error("event store unavailable: {reason}")]
    StoreUnavailable {
        /// Last observed failure, for the operator.
        reason: String,
    },

    /// Dispatch found no handler registered for the message type.
    #[error("no handler registered for {type_name}")]
    NoHandler {
        /// Fully qualified message type name.
        type_name: &'static str,
    },

    /// Registration found the message type already claimed.
    #[error("a handler is already registered for {type_name}")]
    DuplicateHandler {
        /// Fully qualified message type name.
        type_name: &'static str,
    },

    /// The handler itself failed (returned an error or panicked).
    ///
    /// Caught at the bus boundary so one failing dispatch cannot corrupt
    /// bus state for subsequent ones.
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Unrecoverable protocol or authentication failure.
    ///
    /// The offending connection is closed; store-dependent operations
    /// fail fast with [`StoreUnavailable`](BusError::StoreUnavailable)
    /// until a reconnect succeeds.
    #[error("fatal store failure: {reason}")]
    Fatal {
        /// What the store rejected.
        reason: String,
    },
}

impl BusError {
    /// True if the error indicates the store cannot currently be used.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_names_stream_and_version() {
        let err = BusError::VersionConflict {
            stream_id: "order-1".to_string(),
            expected: 3,
        };
        assert_eq!(
            err.to_string(),
            "version conflict on stream 'order-1': expected version 3"
        );
    }

    #[test]
    fn handler_error_displays_cause() {
        let cause: Box<dyn std::error::Error + Send + Sync> = "insufficient funds".into();
        let err = BusError::Handler(cause);
        assert!(err.to_string().contains("insufficient funds"));
    }

    #[test]
    fn store_unavailable_classification() {
        assert!(
            BusError::StoreUnavailable {
                reason: "timed out".to_string()
            }
            .is_store_unavailable()
        );
        assert!(
            BusError::Fatal {
                reason: "auth rejected".to_string()
            }
            .is_store_unavailable()
        );
        assert!(
            !BusError::NoHandler {
                type_name: "CreateOrder"
            }
            .is_store_unavailable()
        );
    }

    // Errors cross task boundaries via tokio channels, which requires
    // `Send + Sync`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<BusError>();
        }
    };
}
