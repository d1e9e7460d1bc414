//! snaptap gRPC proxy
//!
//! Serves the containerd snapshots API on a Unix domain socket and records
//! every call that passes through it in a newline-delimited JSON log.
//!
//! # Architecture
//!
//! The server never looks inside the payloads it records. Each RPC of the
//! `Snapshots` service is routed through an [`Interceptor`] that writes the
//! request to the intercept log, hands the call to the wrapped handler, and
//! then writes the handler's response (or its failure) before returning the
//! result untouched. The handler can be any implementation of the generated
//! [`Snapshots`] trait; [`LocalSnapshotter`] is a directory-backed one.
//!
//! # Example Flow
//!
//! ```text
//! Client                 Interceptor              Handler         Log
//! │  Stat{key: "abc"}        │                       │              │
//! │ ────────────────────────>│ request ──────────────┼─────────────>│
//! │                          │ Stat{key: "abc"}      │              │
//! │                          │──────────────────────>│              │
//! │                          │   Info{name: "abc"}   │              │
//! │                          │<──────────────────────│              │
//! │                          │ response ─────────────┼─────────────>│
//! │   Info{name: "abc"}      │                       │              │
//! │<──────────────────────── │                       │              │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("containerd.services.snapshots.v1");
    include!(concat!(
        env!("OUT_DIR"),
        "/containerd.services.snapshots.v1.serde.rs"
    ));
}

mod config;
mod interceptor;
mod local;
mod server;
mod service;

pub use config::{Config, DEFAULT_INTERCEPT_LOG, DEFAULT_ROOT, DEFAULT_SOCKET_PATH};
pub use interceptor::{Accumulate, Interceptor, RecordedStream};
pub use local::{LocalSnapshotter, SnapshotError};
pub use server::{LifecycleState, Server, ServerError};
pub use service::{LoggedSnapshots, methods};

// Re-export proto types for convenience
pub use proto::{
    snapshots_client::SnapshotsClient,
    snapshots_server::{Snapshots, SnapshotsServer},
};
