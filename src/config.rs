//! Connection and bus configuration.
//!
//! All configuration is resolved once at startup into plain immutable
//! values and passed by value into the component constructors. The bus
//! never reads the environment after construction.

use std::time::Duration;

/// Username/password pair presented to the event store on every RPC.
///
/// Transmitted as an HTTP basic `authorization` header by the
/// [`BasicAuthInterceptor`](crate::auth::BasicAuthInterceptor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name registered with the store.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "changeit".to_string(),
        }
    }
}

/// Lower and upper bounds on the number of live pooled connections.
///
/// The pool warms up to `min` connections at startup and opens further
/// connections on demand up to `max`. Callers beyond `max` wait (with a
/// timeout) for a release instead of opening more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    /// Connections kept alive while the pool is healthy.
    pub min: usize,
    /// Hard cap on simultaneously live connections.
    pub max: usize,
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

/// Where and how to reach the event store.
///
/// Immutable once the bus starts; owned by the caller and handed to
/// [`Bus::builder`](crate::Bus::builder) by value.
///
/// # Examples
///
/// ```
/// use streambus::ConnectionSettings;
///
/// let settings = ConnectionSettings::new("es.internal", 1113);
/// assert_eq!(settings.endpoint_uri(), "http://es.internal:1113");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Store hostname or IP address.
    pub host: String,
    /// Store TCP port.
    pub port: u16,
    /// Credentials attached to every RPC.
    pub credentials: Credentials,
    /// Pool size bounds.
    pub pool: PoolBounds,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1113,
            credentials: Credentials::default(),
            pool: PoolBounds::default(),
        }
    }
}

impl ConnectionSettings {
    /// Create settings for the given endpoint with default credentials
    /// and pool bounds.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Set the pool bounds.
    pub fn with_pool_bounds(mut self, min: usize, max: usize) -> Self {
        self.pool = PoolBounds { min, max };
        self
    }

    /// Resolve settings from the external configuration collaborator's
    /// environment variables, falling back to the defaults for anything
    /// unset or unparsable.
    ///
    /// Variables read: `EVENT_STORE_HOSTNAME`, `EVENT_STORE_TCP_PORT`,
    /// `EVENT_STORE_CREDENTIALS_USERNAME`, `EVENT_STORE_CREDENTIALS_PASSWORD`,
    /// `EVENT_STORE_POOLOPTIONS_MIN`, `EVENT_STORE_POOLOPTIONS_MAX`.
    ///
    /// Called once at startup; the returned value is immutable for the
    /// process lifetime.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            var(key)?.parse().ok()
        }

        Self {
            host: var("EVENT_STORE_HOSTNAME").unwrap_or(defaults.host),
            port: parsed("EVENT_STORE_TCP_PORT").unwrap_or(defaults.port),
            credentials: Credentials {
                username: var("EVENT_STORE_CREDENTIALS_USERNAME")
                    .unwrap_or(defaults.credentials.username),
                password: var("EVENT_STORE_CREDENTIALS_PASSWORD")
                    .unwrap_or(defaults.credentials.password),
            },
            pool: PoolBounds {
                min: parsed("EVENT_STORE_POOLOPTIONS_MIN").unwrap_or(defaults.pool.min),
                max: parsed("EVENT_STORE_POOLOPTIONS_MAX").unwrap_or(defaults.pool.max),
            },
        }
    }

    /// The gRPC endpoint URI for these settings.
    pub fn endpoint_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Timeouts bounding every blocking point in the bus.
///
/// Dispatch and pool acquisition never hang indefinitely; each converts
/// to a typed error when its deadline elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusOptions {
    /// How long an `acquire` waits for a pooled connection before
    /// failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Upper bound on a single command or query dispatch, handler
    /// execution included.
    pub dispatch_timeout: Duration,
    /// Events buffered per subscription before it falls back to
    /// catch-up reads.
    pub subscription_buffer: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            dispatch_timeout: Duration::from_secs(30),
            subscription_buffer: 256,
        }
    }
}
