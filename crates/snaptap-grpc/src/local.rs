//! Directory-backed snapshot handler.
//!
//! Each snapshot is a directory under `<root>/snapshots/<id>`. Preparing a
//! snapshot on top of a committed parent copies the parent's tree, the same
//! way containerd's native snapshotter does. Snapshot metadata is kept in
//! memory for the lifetime of the process.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use pbjson_types::{Empty, Timestamp};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use crate::proto::{
    CleanupRequest, CommitSnapshotRequest, Info, Kind, ListSnapshotsRequest,
    ListSnapshotsResponse, Mount, MountsRequest, MountsResponse, PrepareSnapshotRequest,
    PrepareSnapshotResponse, RemoveSnapshotRequest, StatSnapshotRequest, StatSnapshotResponse,
    UpdateSnapshotRequest, UpdateSnapshotResponse, UsageRequest, UsageResponse,
    ViewSnapshotRequest, ViewSnapshotResponse, snapshots_server::Snapshots,
};

/// Number of snapshot infos sent per `List` response message.
const LIST_BATCH_SIZE: usize = 100;

/// Errors produced by the local snapshotter.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The named snapshot does not exist
    #[error("snapshot {0} does not exist")]
    NotFound(String),
    /// A snapshot with that name already exists
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),
    /// The snapshot is in the wrong state for the operation
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// The request was malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<SnapshotError> for Status {
    fn from(err: SnapshotError) -> Self {
        let message = err.to_string();
        match err {
            SnapshotError::NotFound(_) => Status::not_found(message),
            SnapshotError::AlreadyExists(_) => Status::already_exists(message),
            SnapshotError::FailedPrecondition(_) => Status::failed_precondition(message),
            SnapshotError::InvalidArgument(_) => Status::invalid_argument(message),
            SnapshotError::Io(_) => Status::internal(message),
        }
    }
}

/// Metadata for one snapshot.
#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    kind: Kind,
    parent: String,
    labels: HashMap<String, String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    entries: BTreeMap<String, Entry>,
}

/// A snapshotter storing snapshots as plain directories.
///
/// All mutations are serialised behind one lock, which is held across the
/// filesystem work so that metadata and directories never disagree.
#[derive(Debug)]
pub struct LocalSnapshotter {
    snapshots_dir: PathBuf,
    state: Mutex<State>,
}

impl LocalSnapshotter {
    /// Create a snapshotter rooted at `root`, creating `root/snapshots`.
    pub fn new(root: &Path) -> Result<Self, SnapshotError> {
        let snapshots_dir = root.join("snapshots");
        std::fs::create_dir_all(&snapshots_dir)?;
        tracing::debug!(root = %root.display(), "local snapshotter ready");
        Ok(Self {
            snapshots_dir,
            state: Mutex::new(State {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
        })
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.snapshots_dir.join(id.to_string())
    }

    fn mounts_for(&self, entry: &Entry) -> Vec<Mount> {
        let access = if entry.kind == Kind::View { "ro" } else { "rw" };
        vec![Mount {
            r#type: "bind".to_string(),
            source: self.snapshot_dir(entry.id).to_string_lossy().into_owned(),
            target: String::new(),
            options: vec!["rbind".to_string(), access.to_string()],
        }]
    }

    async fn create(
        &self,
        kind: Kind,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>, SnapshotError> {
        if key.is_empty() {
            return Err(SnapshotError::InvalidArgument("key must not be empty".into()));
        }

        let mut state = self.state.lock().await;
        if state.entries.contains_key(&key) {
            return Err(SnapshotError::AlreadyExists(key));
        }

        let parent_dir = if parent.is_empty() {
            None
        } else {
            let entry = state
                .entries
                .get(&parent)
                .ok_or_else(|| SnapshotError::NotFound(parent.clone()))?;
            if entry.kind != Kind::Committed {
                return Err(SnapshotError::FailedPrecondition(format!(
                    "parent {parent} is not committed"
                )));
            }
            Some(self.snapshot_dir(entry.id))
        };

        let id = state.next_id;
        state.next_id += 1;

        let dir = self.snapshot_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        if let Some(parent_dir) = parent_dir {
            let target = dir.clone();
            let copied = tokio::task::spawn_blocking(move || copy_dir(&parent_dir, &target))
                .await
                .map_err(|e| SnapshotError::Io(io::Error::other(e)))?;
            if let Err(e) = copied {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e.into());
            }
        }

        let now = now();
        let entry = Entry {
            id,
            kind,
            parent,
            labels,
            created_at: now.clone(),
            updated_at: now,
        };
        let mounts = self.mounts_for(&entry);
        tracing::debug!(key = %key, id, kind = ?kind, "created snapshot");
        state.entries.insert(key, entry);
        Ok(mounts)
    }
}

#[tonic::async_trait]
impl Snapshots for LocalSnapshotter {
    async fn prepare(
        &self,
        request: Request<PrepareSnapshotRequest>,
    ) -> Result<Response<PrepareSnapshotResponse>, Status> {
        let req = request.into_inner();
        let mounts = self
            .create(Kind::Active, req.key, req.parent, req.labels)
            .await?;
        Ok(Response::new(PrepareSnapshotResponse { mounts }))
    }

    async fn view(
        &self,
        request: Request<ViewSnapshotRequest>,
    ) -> Result<Response<ViewSnapshotResponse>, Status> {
        let req = request.into_inner();
        let mounts = self
            .create(Kind::View, req.key, req.parent, req.labels)
            .await?;
        Ok(Response::new(ViewSnapshotResponse { mounts }))
    }

    async fn mounts(
        &self,
        request: Request<MountsRequest>,
    ) -> Result<Response<MountsResponse>, Status> {
        let req = request.into_inner();
        let state = self.state.lock().await;
        let entry = state
            .entries
            .get(&req.key)
            .ok_or_else(|| SnapshotError::NotFound(req.key.clone()))?;
        if entry.kind == Kind::Committed {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {} is committed and cannot be mounted",
                req.key
            ))
            .into());
        }
        Ok(Response::new(MountsResponse {
            mounts: self.mounts_for(entry),
        }))
    }

    async fn commit(
        &self,
        request: Request<CommitSnapshotRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(SnapshotError::InvalidArgument("name must not be empty".into()).into());
        }

        let mut state = self.state.lock().await;
        if state.entries.contains_key(&req.name) {
            return Err(SnapshotError::AlreadyExists(req.name).into());
        }
        let entry = state
            .entries
            .get(&req.key)
            .ok_or_else(|| SnapshotError::NotFound(req.key.clone()))?;
        if entry.kind != Kind::Active {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {} is not active",
                req.key
            ))
            .into());
        }

        let Some(mut entry) = state.entries.remove(&req.key) else {
            return Err(SnapshotError::NotFound(req.key).into());
        };
        entry.kind = Kind::Committed;
        entry.labels = req.labels;
        entry.updated_at = now();
        tracing::debug!(key = %req.key, name = %req.name, "committed snapshot");
        state.entries.insert(req.name, entry);
        Ok(Response::new(Empty {}))
    }

    async fn remove(
        &self,
        request: Request<RemoveSnapshotRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(&req.key) {
            return Err(SnapshotError::NotFound(req.key).into());
        }
        if state.entries.values().any(|e| e.parent == req.key) {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {} has children",
                req.key
            ))
            .into());
        }

        let Some(entry) = state.entries.remove(&req.key) else {
            return Err(SnapshotError::NotFound(req.key).into());
        };
        match tokio::fs::remove_dir_all(self.snapshot_dir(entry.id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SnapshotError::Io(e).into()),
        }
        tracing::debug!(key = %req.key, id = entry.id, "removed snapshot");
        Ok(Response::new(Empty {}))
    }

    async fn stat(
        &self,
        request: Request<StatSnapshotRequest>,
    ) -> Result<Response<StatSnapshotResponse>, Status> {
        let req = request.into_inner();
        let state = self.state.lock().await;
        let entry = state
            .entries
            .get(&req.key)
            .ok_or_else(|| SnapshotError::NotFound(req.key.clone()))?;
        Ok(Response::new(StatSnapshotResponse {
            info: Some(to_info(&req.key, entry)),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateSnapshotRequest>,
    ) -> Result<Response<UpdateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let info = req
            .info
            .ok_or_else(|| SnapshotError::InvalidArgument("info is required".into()))?;
        let paths = req.update_mask.map(|mask| mask.paths).unwrap_or_default();

        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(&info.name)
            .ok_or_else(|| SnapshotError::NotFound(info.name.clone()))?;

        let labels = apply_label_mask(&entry.labels, info.labels, &paths)?;
        entry.labels = labels;
        entry.updated_at = now();

        Ok(Response::new(UpdateSnapshotResponse {
            info: Some(to_info(&info.name, entry)),
        }))
    }

    type ListStream = Pin<Box<dyn Stream<Item = Result<ListSnapshotsResponse, Status>> + Send>>;

    async fn list(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let req = request.into_inner();
        let filters = req
            .filters
            .iter()
            .map(|f| Filter::parse(f))
            .collect::<Result<Vec<_>, _>>()?;

        let infos: Vec<Info> = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .map(|(name, entry)| to_info(name, entry))
                .filter(|info| filters.is_empty() || filters.iter().any(|f| f.matches(info)))
                .collect()
        };

        let batches: Vec<Result<ListSnapshotsResponse, Status>> = infos
            .chunks(LIST_BATCH_SIZE)
            .map(|chunk| {
                Ok(ListSnapshotsResponse {
                    info: chunk.to_vec(),
                })
            })
            .collect();
        Ok(Response::new(
            Box::pin(tokio_stream::iter(batches)) as Self::ListStream
        ))
    }

    async fn usage(&self, request: Request<UsageRequest>) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();
        let dir = {
            let state = self.state.lock().await;
            let entry = state
                .entries
                .get(&req.key)
                .ok_or_else(|| SnapshotError::NotFound(req.key.clone()))?;
            self.snapshot_dir(entry.id)
        };

        let usage = tokio::task::spawn_blocking(move || disk_usage(&dir))
            .await
            .map_err(|e| SnapshotError::Io(io::Error::other(e)))?
            .map_err(SnapshotError::Io)?;
        Ok(Response::new(UsageResponse {
            size: i64::try_from(usage.size).unwrap_or(i64::MAX),
            inodes: i64::try_from(usage.inodes).unwrap_or(i64::MAX),
        }))
    }

    async fn cleanup(&self, _request: Request<CleanupRequest>) -> Result<Response<Empty>, Status> {
        let state = self.state.lock().await;
        let live: Vec<String> = state.entries.values().map(|e| e.id.to_string()).collect();

        let mut dir = tokio::fs::read_dir(&self.snapshots_dir)
            .await
            .map_err(SnapshotError::Io)?;
        while let Some(child) = dir.next_entry().await.map_err(SnapshotError::Io)? {
            let name = child.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            tracing::debug!(dir = %child.path().display(), "removing orphaned snapshot directory");
            tokio::fs::remove_dir_all(child.path())
                .await
                .map_err(SnapshotError::Io)?;
        }
        Ok(Response::new(Empty {}))
    }
}

fn to_info(name: &str, entry: &Entry) -> Info {
    Info {
        name: name.to_string(),
        parent: entry.parent.clone(),
        kind: entry.kind.into(),
        created_at: Some(entry.created_at.clone()),
        updated_at: Some(entry.updated_at.clone()),
        labels: entry.labels.clone(),
    }
}

fn now() -> Timestamp {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        seconds: i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX),
        nanos: i32::try_from(since_epoch.subsec_nanos()).unwrap_or(0),
    }
}

/// Apply an update mask to a snapshot's labels.
///
/// Only labels are mutable. An empty mask (or `labels`) replaces the whole
/// set; `labels.<key>` sets or clears a single label.
fn apply_label_mask(
    current: &HashMap<String, String>,
    mut update: HashMap<String, String>,
    paths: &[String],
) -> Result<HashMap<String, String>, SnapshotError> {
    if paths.is_empty() || paths.iter().any(|p| p == "labels") {
        return Ok(update);
    }

    let mut labels = current.clone();
    for path in paths {
        let Some(key) = path.strip_prefix("labels.") else {
            return Err(SnapshotError::InvalidArgument(format!(
                "cannot update field {path}"
            )));
        };
        match update.remove(key) {
            Some(value) => {
                labels.insert(key.to_string(), value);
            }
            None => {
                labels.remove(key);
            }
        }
    }
    Ok(labels)
}

/// A `List` filter: comma-separated `field==value` clauses that must all
/// match. Supported fields are `name`, `parent`, `kind` and `labels.<key>`.
#[derive(Debug)]
struct Filter {
    clauses: Vec<(String, String)>,
}

impl Filter {
    fn parse(filter: &str) -> Result<Self, SnapshotError> {
        let clauses = filter
            .split(',')
            .map(|clause| {
                let (field, value) = clause.split_once("==").ok_or_else(|| {
                    SnapshotError::InvalidArgument(format!("unsupported filter {clause:?}"))
                })?;
                let field = field.trim();
                if !matches!(field, "name" | "parent" | "kind") && !field.starts_with("labels.") {
                    return Err(SnapshotError::InvalidArgument(format!(
                        "unsupported filter field {field:?}"
                    )));
                }
                Ok((field.to_string(), value.trim().trim_matches('"').to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { clauses })
    }

    fn matches(&self, info: &Info) -> bool {
        self.clauses.iter().all(|(field, value)| match field.as_str() {
            "name" => &info.name == value,
            "parent" => &info.parent == value,
            "kind" => info.kind().as_str_name().eq_ignore_ascii_case(value),
            label => label
                .strip_prefix("labels.")
                .map(|key| key.trim_matches('"'))
                .and_then(|key| info.labels.get(key))
                .is_some_and(|v| v == value),
        })
    }
}

/// Recursively copy the contents of `from` into the existing directory `to`.
fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            std::fs::create_dir(&target)?;
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Usage {
    size: u64,
    inodes: u64,
}

fn disk_usage(dir: &Path) -> io::Result<Usage> {
    let mut usage = Usage::default();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        usage.inodes += 1;
        if metadata.is_dir() {
            let nested = disk_usage(&entry.path())?;
            usage.size += nested.size;
            usage.inodes += nested.inodes;
        } else {
            usage.size += metadata.len();
        }
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn empty_mask_replaces_labels() {
        let current = HashMap::from([("a".to_string(), "1".to_string())]);
        let update = HashMap::from([("b".to_string(), "2".to_string())]);
        let labels = apply_label_mask(&current, update.clone(), &[]).unwrap();
        assert_eq!(labels, update);
    }

    #[test]
    fn label_paths_set_and_clear_single_labels() {
        let current = HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let update = HashMap::from([("a".to_string(), "10".to_string())]);
        let labels = apply_label_mask(
            &current,
            update,
            &["labels.a".to_string(), "labels.b".to_string()],
        )
        .unwrap();
        assert_eq!(labels, HashMap::from([("a".to_string(), "10".to_string())]));
    }

    #[test]
    fn non_label_paths_are_rejected() {
        let err = apply_label_mask(&HashMap::new(), HashMap::new(), &["parent".to_string()])
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidArgument(_)));
    }

    #[test]
    fn filters_match_fields() {
        let info = Info {
            name: "layer-1".into(),
            parent: "base".into(),
            kind: Kind::Committed.into(),
            created_at: None,
            updated_at: None,
            labels: HashMap::from([("team".to_string(), "infra".to_string())]),
        };

        assert!(Filter::parse("name==layer-1").unwrap().matches(&info));
        assert!(Filter::parse("kind==committed,parent==base").unwrap().matches(&info));
        assert!(Filter::parse(r#"labels."team"==infra"#).unwrap().matches(&info));
        assert!(!Filter::parse("kind==ACTIVE").unwrap().matches(&info));
        assert!(Filter::parse("size>3").is_err());
        assert!(Filter::parse("owner==me").is_err());
    }

    #[test]
    fn usage_counts_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b"), b"world!").unwrap();

        let usage = disk_usage(dir.path()).unwrap();
        assert_eq!(usage.inodes, 3);
        assert_eq!(usage.size, 11);
    }
}
