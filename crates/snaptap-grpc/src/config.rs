//! Process configuration.

use std::path::PathBuf;

/// Default Unix socket the server listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/snapshotter.sock";
/// Default storage root handed to the snapshot handler.
pub const DEFAULT_ROOT: &str = "/tmp/snapshots";
/// Default path of the intercept log.
pub const DEFAULT_INTERCEPT_LOG: &str = "/tmp/snapshotter-intercepts.json";

/// Configuration for one server process.
///
/// Built once at startup and passed to [`Server::start`](crate::Server::start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Unix domain socket to listen on. Removed again on graceful shutdown.
    pub socket_path: PathBuf,
    /// Storage directory for the snapshot handler.
    pub root: PathBuf,
    /// Intercept log file, appended to across restarts.
    pub intercept_log: PathBuf,
    /// Tag each request/response pair with a shared `call_id`.
    pub correlation_ids: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            root: PathBuf::from(DEFAULT_ROOT),
            intercept_log: PathBuf::from(DEFAULT_INTERCEPT_LOG),
            correlation_ids: false,
        }
    }
}
