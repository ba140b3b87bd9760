use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls;

use crate::connection::ConnState;

/// Callback invoked on every connection state transition with the peer's
/// socket address. Runs inline on the transitioning task; it must not block.
pub type StateObserver = Arc<dyn Fn(SocketAddr, ConnState) + Send + Sync>;

/// Server configuration. `Default` supplies production-leaning values; use
/// struct-update syntax to override the handful a deployment cares about:
///
/// ```
/// use respkit::config::Config;
///
/// let config = Config {
///     addr: "127.0.0.1:0".into(),
///     max_connections: 64,
///     ..Config::default()
/// };
/// assert_eq!(config.max_connections, 64);
/// ```
#[derive(Clone)]
pub struct Config {
    /// Listen address.
    pub addr: String,
    /// When set, accepted sockets are wrapped by a TLS handshake before any
    /// RESP bytes are read. Certificate provisioning is the embedder's job.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Deadline armed before each frame read; `None` disables it.
    pub read_timeout: Option<Duration>,
    /// Deadline armed before each response write; `None` disables it.
    pub write_timeout: Option<Duration>,
    /// Connections parked longer than this are swept. Zero disables the
    /// sweep entirely.
    pub idle_timeout: Duration,
    /// Cadence of the idle sweeper task.
    pub sweep_interval: Duration,
    /// Admission cap on concurrent connections; 0 means unbounded.
    pub max_connections: usize,
    /// Optional connection state observer.
    pub observer: Option<StateObserver>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: "127.0.0.1:6379".to_string(),
            tls: None,
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            max_connections: 1000,
            observer: None,
        }
    }
}
