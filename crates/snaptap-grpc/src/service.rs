//! The `Snapshots` service with every method routed through the interceptor.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::interceptor::{Accumulate, Interceptor, RecordedStream};
use crate::proto::{
    CleanupRequest, CommitSnapshotRequest, ListSnapshotsRequest, ListSnapshotsResponse,
    MountsRequest, MountsResponse, PrepareSnapshotRequest, PrepareSnapshotResponse,
    RemoveSnapshotRequest, StatSnapshotRequest, StatSnapshotResponse, UpdateSnapshotRequest,
    UpdateSnapshotResponse, UsageRequest, UsageResponse, ViewSnapshotRequest,
    ViewSnapshotResponse, snapshots_server::Snapshots,
};

/// Fully-qualified gRPC paths of the `Snapshots` methods, as recorded in
/// the `method` field of each log entry.
pub mod methods {
    /// `Prepare`
    pub const PREPARE: &str = "/containerd.services.snapshots.v1.Snapshots/Prepare";
    /// `View`
    pub const VIEW: &str = "/containerd.services.snapshots.v1.Snapshots/View";
    /// `Mounts`
    pub const MOUNTS: &str = "/containerd.services.snapshots.v1.Snapshots/Mounts";
    /// `Commit`
    pub const COMMIT: &str = "/containerd.services.snapshots.v1.Snapshots/Commit";
    /// `Remove`
    pub const REMOVE: &str = "/containerd.services.snapshots.v1.Snapshots/Remove";
    /// `Stat`
    pub const STAT: &str = "/containerd.services.snapshots.v1.Snapshots/Stat";
    /// `Update`
    pub const UPDATE: &str = "/containerd.services.snapshots.v1.Snapshots/Update";
    /// `List`
    pub const LIST: &str = "/containerd.services.snapshots.v1.Snapshots/List";
    /// `Usage`
    pub const USAGE: &str = "/containerd.services.snapshots.v1.Snapshots/Usage";
    /// `Cleanup`
    pub const CLEANUP: &str = "/containerd.services.snapshots.v1.Snapshots/Cleanup";
}

/// A `Snapshots` implementation that records every call to a wrapped
/// handler.
///
/// The handler sees exactly the requests the client sent, and the client
/// sees exactly what the handler returned.
#[derive(Debug)]
pub struct LoggedSnapshots<H> {
    inner: H,
    interceptor: Arc<Interceptor>,
}

impl<H> LoggedSnapshots<H> {
    /// Wrap `handler` so that its calls are recorded by `interceptor`.
    pub fn new(handler: H, interceptor: Arc<Interceptor>) -> Self {
        Self {
            inner: handler,
            interceptor,
        }
    }

    /// Get a reference to the interceptor.
    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }
}

// A `List` call is recorded as one response listing every snapshot sent.
impl Accumulate for ListSnapshotsResponse {
    fn accumulate(&mut self, next: &Self) {
        self.info.extend(next.info.iter().cloned());
    }
}

#[tonic::async_trait]
impl<H: Snapshots> Snapshots for LoggedSnapshots<H> {
    async fn prepare(
        &self,
        request: Request<PrepareSnapshotRequest>,
    ) -> Result<Response<PrepareSnapshotResponse>, Status> {
        self.interceptor
            .intercept(methods::PREPARE, request, |req| self.inner.prepare(req))
            .await
    }

    async fn view(
        &self,
        request: Request<ViewSnapshotRequest>,
    ) -> Result<Response<ViewSnapshotResponse>, Status> {
        self.interceptor
            .intercept(methods::VIEW, request, |req| self.inner.view(req))
            .await
    }

    async fn mounts(
        &self,
        request: Request<MountsRequest>,
    ) -> Result<Response<MountsResponse>, Status> {
        self.interceptor
            .intercept(methods::MOUNTS, request, |req| self.inner.mounts(req))
            .await
    }

    async fn commit(
        &self,
        request: Request<CommitSnapshotRequest>,
    ) -> Result<Response<pbjson_types::Empty>, Status> {
        self.interceptor
            .intercept(methods::COMMIT, request, |req| self.inner.commit(req))
            .await
    }

    async fn remove(
        &self,
        request: Request<RemoveSnapshotRequest>,
    ) -> Result<Response<pbjson_types::Empty>, Status> {
        self.interceptor
            .intercept(methods::REMOVE, request, |req| self.inner.remove(req))
            .await
    }

    async fn stat(
        &self,
        request: Request<StatSnapshotRequest>,
    ) -> Result<Response<StatSnapshotResponse>, Status> {
        self.interceptor
            .intercept(methods::STAT, request, |req| self.inner.stat(req))
            .await
    }

    async fn update(
        &self,
        request: Request<UpdateSnapshotRequest>,
    ) -> Result<Response<UpdateSnapshotResponse>, Status> {
        self.interceptor
            .intercept(methods::UPDATE, request, |req| self.inner.update(req))
            .await
    }

    type ListStream = RecordedStream<ListSnapshotsResponse>;

    async fn list(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        self.interceptor
            .intercept_streaming(methods::LIST, request, |req| self.inner.list(req))
            .await
    }

    async fn usage(
        &self,
        request: Request<UsageRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        self.interceptor
            .intercept(methods::USAGE, request, |req| self.inner.usage(req))
            .await
    }

    async fn cleanup(
        &self,
        request: Request<CleanupRequest>,
    ) -> Result<Response<pbjson_types::Empty>, Status> {
        self.interceptor
            .intercept(methods::CLEANUP, request, |req| self.inner.cleanup(req))
            .await
    }
}
