//! Server lifecycle: startup, serving, and graceful shutdown.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snaptap::{LogSink, SinkError};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;

use crate::config::Config;
use crate::interceptor::Interceptor;
use crate::proto::snapshots_server::{Snapshots, SnapshotsServer};
use crate::service::LoggedSnapshots;

/// Where the server is in its lifetime.
///
/// Transitions only move forward: `Starting → Listening → Draining →
/// Stopped`. A stopped server cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Acquiring the log, the handler and the socket.
    Starting,
    /// Accepting and serving calls.
    Listening,
    /// Shutdown requested; no new calls, in-flight calls finishing.
    Draining,
    /// Socket removed and log closed.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Listening => "listening",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The intercept log could not be opened.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// The snapshot handler could not be constructed.
    #[error("constructing snapshot handler: {0}")]
    Handler(#[source] Box<dyn StdError + Send + Sync>),
    /// The Unix socket could not be bound.
    #[error("binding {}: {source}", .path.display())]
    Bind {
        /// Socket path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The gRPC transport failed while serving.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A started server, bound and ready to serve.
///
/// Created by [`Server::start`], which acquires every resource up front so
/// that a server either starts completely or not at all.
pub struct Server<H> {
    config: Config,
    listener: UnixListener,
    service: LoggedSnapshots<H>,
    sink: Arc<LogSink>,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl<H> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<H: Snapshots> Server<H> {
    /// Open the intercept log, construct the handler and bind the socket.
    ///
    /// `make_handler` receives the configured storage root. If any step
    /// fails, everything acquired so far is released and the error is
    /// returned; nothing is left listening.
    ///
    /// Must be called from within a Tokio runtime, which the socket is
    /// registered with.
    pub fn start<F, E>(config: Config, make_handler: F) -> Result<Self, ServerError>
    where
        F: FnOnce(&Path) -> Result<H, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (state, _) = watch::channel(LifecycleState::Starting);
        tracing::info!(state = %LifecycleState::Starting, "starting snapshotter");

        let sink = Arc::new(LogSink::open(&config.intercept_log)?);
        tracing::info!(path = %config.intercept_log.display(), "recording calls");

        let handler = make_handler(&config.root).map_err(|e| ServerError::Handler(e.into()))?;

        let listener =
            UnixListener::bind(&config.socket_path).map_err(|source| ServerError::Bind {
                path: config.socket_path.clone(),
                source,
            })?;

        let interceptor = Arc::new(
            Interceptor::new(Arc::clone(&sink)).with_correlation_ids(config.correlation_ids),
        );
        let service = LoggedSnapshots::new(handler, interceptor);

        Ok(Self {
            config,
            listener,
            service,
            sink,
            state: Arc::new(state),
        })
    }

    /// Path of the socket the server is bound to.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Subscribe to lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Serve until an interrupt signal (Ctrl+C) arrives.
    pub async fn run(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    ///
    /// Once `signal` fires no new calls are accepted and calls already in
    /// flight run to completion. Only then is the intercept log closed and
    /// the socket file removed, whether serving succeeded or not.
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            service,
            sink,
            state,
        } = self;

        let interceptor = Arc::clone(service.interceptor());
        state.send_replace(LifecycleState::Listening);
        tracing::info!(
            state = %LifecycleState::Listening,
            socket = %config.socket_path.display(),
            "serving snapshots API"
        );

        let draining = {
            let state = Arc::clone(&state);
            async move {
                signal.await;
                state.send_replace(LifecycleState::Draining);
                tracing::info!(
                    state = %LifecycleState::Draining,
                    in_flight = interceptor.in_flight(),
                    "waiting for in-flight calls"
                );
            }
        };

        let result = tonic::transport::Server::builder()
            .add_service(SnapshotsServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), draining)
            .await;

        if let Err(e) = sink.close() {
            tracing::error!(error = %e, "failed to close intercept log");
        }
        remove_socket(&config.socket_path);

        state.send_replace(LifecycleState::Stopped);
        tracing::info!(state = %LifecycleState::Stopped, "snapshotter shut down");

        result.map_err(ServerError::from)
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(socket = %path.display(), error = %e, "failed to remove socket");
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received interrupt, initiating graceful shutdown"),
        Err(e) => {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            // Without a handler there is nothing to wait for; keep serving.
            std::future::pending::<()>().await;
        }
    }
}
