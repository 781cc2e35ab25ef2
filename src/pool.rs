//! Bounded pool of live store connections.
//!
//! The pool owns every idle connection and lends each one to exactly one
//! in-flight operation at a time. Capacity is bounded by a semaphore
//! sized to the pool's `max`; callers beyond it wait (with a timeout)
//! for a release instead of opening more connections, which is the bus's
//! backpressure mechanism against the store.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, TryAcquireError};

use crate::client::StoreClient;
use crate::config::{BusOptions, ConnectionSettings, PoolBounds};

/// Why an [`acquire`](ConnectionPool::acquire) failed.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The pool stayed at `max` with every connection busy for the
    /// whole acquire timeout.
    #[error("pool exhausted: waited {waited_ms}ms")]
    Exhausted {
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// The pool has been shut down.
    #[error("pool is shut down")]
    Closed,
    /// Opening a fresh connection failed.
    #[error("connect failed: {0}")]
    Connect(tonic::Status),
}

struct PoolInner {
    settings: ConnectionSettings,
    acquire_timeout: Duration,
    /// Bounds capacity lent out at any moment. Resized via
    /// `add_permits` / forgotten permits.
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<StoreClient>>,
    /// Connections currently alive: idle plus lent out.
    live: AtomicUsize,
    bounds: Mutex<PoolBounds>,
    closed: AtomicBool,
}

impl PoolInner {
    /// Return a lent connection to the pool, discarding it if it fails
    /// the health check. Replacement happens asynchronously so release
    /// never blocks on the network.
    fn restore(self: &Arc<Self>, client: StoreClient) {
        if self.closed.load(Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let over_capacity = {
            let bounds = self.bounds.lock().expect("pool bounds lock poisoned");
            self.live.load(Ordering::SeqCst) > bounds.max
        };

        if client.is_usable() && !over_capacity {
            self.idle
                .lock()
                .expect("pool idle lock poisoned")
                .push_back(client);
        } else {
            tracing::warn!(state = ?client.state(), "discarding unhealthy connection");
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.replenish();
        }
    }

    /// Asynchronously top the pool back up to its `min` bound.
    fn replenish(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let min = {
                    let bounds = inner.bounds.lock().expect("pool bounds lock poisoned");
                    bounds.min
                };
                if inner.live.load(Ordering::SeqCst) >= min {
                    return;
                }
                inner.live.fetch_add(1, Ordering::SeqCst);
                let mut client = StoreClient::new(&inner.settings);
                match client.connect().await {
                    Ok(()) => {
                        inner
                            .idle
                            .lock()
                            .expect("pool idle lock poisoned")
                            .push_back(client);
                    }
                    Err(e) => {
                        inner.live.fetch_sub(1, Ordering::SeqCst);
                        tracing::warn!(error = %e, "connection replacement failed");
                        return;
                    }
                }
            }
        });
    }
}

/// Bounded set of live connections to the store endpoint.
///
/// `Clone` is cheap: all state is behind one `Arc`.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("live", &self.inner.live.load(Ordering::SeqCst))
            .field("bounds", &*self.inner.bounds.lock().expect("bounds lock"))
            .finish()
    }
}

impl ConnectionPool {
    /// Build a pool and warm it up to the configured `min`.
    ///
    /// Individual warm-up failures are logged and tolerated; the pool
    /// opens further connections on demand.
    pub async fn connect(settings: ConnectionSettings, options: BusOptions) -> Self {
        let bounds = settings.pool;
        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(bounds.max)),
            acquire_timeout: options.acquire_timeout,
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            bounds: Mutex::new(bounds),
            closed: AtomicBool::new(false),
            settings,
        });

        for _ in 0..bounds.min {
            let mut client = StoreClient::new(&inner.settings);
            match client.connect().await {
                Ok(()) => {
                    inner.live.fetch_add(1, Ordering::SeqCst);
                    inner
                        .idle
                        .lock()
                        .expect("pool idle lock poisoned")
                        .push_back(client);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pool warm-up connection failed");
                }
            }
        }

        tracing::debug!(
            warmed = inner.live.load(Ordering::SeqCst),
            min = bounds.min,
            max = bounds.max,
            "connection pool ready"
        );
        Self { inner }
    }

    /// Borrow a connection, waiting up to the acquire timeout for one
    /// to free up when the pool is at `max`.
    ///
    /// # Errors
    ///
    /// [`AcquireError::Exhausted`] after the bounded wait,
    /// [`AcquireError::Closed`] after shutdown, or
    /// [`AcquireError::Connect`] if a fresh connection was needed and
    /// the handshake failed.
    pub async fn acquire(&self) -> Result<PooledConnection, AcquireError> {
        let started = Instant::now();
        let timeout = self.inner.acquire_timeout;
        let permits = Arc::clone(&self.inner.permits);

        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(AcquireError::Closed),
            Err(_elapsed) => {
                return Err(AcquireError::Exhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AcquireError::Closed);
        }

        let idle = self
            .inner
            .idle
            .lock()
            .expect("pool idle lock poisoned")
            .pop_front();

        let client = match idle {
            Some(client) if client.is_usable() => client,
            stale => {
                // Either the idle set was empty or the connection died
                // while parked; open a fresh one under the same permit.
                if stale.is_some() {
                    self.inner.live.fetch_sub(1, Ordering::SeqCst);
                }
                self.inner.live.fetch_add(1, Ordering::SeqCst);
                let mut client = StoreClient::new(&self.inner.settings);
                if let Err(status) = client.connect().await {
                    self.inner.live.fetch_sub(1, Ordering::SeqCst);
                    return Err(AcquireError::Connect(status));
                }
                client
            }
        };

        Ok(PooledConnection {
            client: Some(client),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the guard; spelled out so call sites can
    /// make the handback explicit. The connection is health-checked:
    /// anything not `Connected` is discarded and replaced
    /// asynchronously rather than parked.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Adjust the pool bounds at runtime.
    ///
    /// Growth takes effect immediately. Shrinking retires capacity as
    /// in-flight operations finish; it never interrupts them.
    pub fn resize(&self, min: usize, max: usize) {
        let old_max = {
            let mut bounds = self.inner.bounds.lock().expect("pool bounds lock poisoned");
            let old = bounds.max;
            *bounds = PoolBounds { min, max };
            old
        };

        if max > old_max {
            self.inner.permits.add_permits(max - old_max);
        } else {
            for _ in 0..old_max - max {
                let permits = Arc::clone(&self.inner.permits);
                match permits.clone().try_acquire_owned() {
                    Ok(permit) => permit.forget(),
                    Err(TryAcquireError::NoPermits) => {
                        // Capacity is lent out; retire the permit once an
                        // operation releases it.
                        tokio::spawn(async move {
                            if let Ok(permit) = permits.acquire_owned().await {
                                permit.forget();
                            }
                        });
                    }
                    Err(TryAcquireError::Closed) => return,
                }
            }
        }

        self.inner.replenish();
        tracing::debug!(min, max, "pool resized");
    }

    /// Number of connections currently alive (idle plus lent out).
    pub fn live_connections(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Current pool bounds.
    pub fn bounds(&self) -> PoolBounds {
        *self.inner.bounds.lock().expect("pool bounds lock poisoned")
    }

    /// Shut the pool down: pending and future acquires fail, idle
    /// connections are dropped. Idempotent.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        let mut idle = self.inner.idle.lock().expect("pool idle lock poisoned");
        let drained = idle.len();
        idle.clear();
        self.inner.live.fetch_sub(drained, Ordering::SeqCst);
        tracing::debug!(drained, "connection pool shut down");
    }
}

/// A connection on loan from the pool.
///
/// Dereferences to [`StoreClient`]. Dropping the guard returns the
/// connection; an unhealthy connection is discarded and replaced
/// asynchronously.
pub struct PooledConnection {
    client: Option<StoreClient>,
    pool: Arc<PoolInner>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = StoreClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.restore(client);
        }
        // The permit drops afterwards, freeing capacity for waiters.
    }
}
