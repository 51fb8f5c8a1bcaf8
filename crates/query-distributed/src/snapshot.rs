//! Snapshot storage.
//!
//! Captured stage states are opaque blobs keyed by
//! `(query, snapshot, stage, partition)`. Stores only hold bytes; which
//! snapshots are complete is tracked by the checkpoint coordinator.

use dashmap::DashMap;
use query_core::{PartitionId, QueryError, QueryId, Result, SnapshotId, StageId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotKey {
    pub query_id: QueryId,
    pub snapshot_id: SnapshotId,
    pub stage_id: StageId,
    pub partition_id: PartitionId,
}

impl SnapshotKey {
    pub fn new(
        query_id: QueryId,
        snapshot_id: SnapshotId,
        stage_id: StageId,
        partition_id: PartitionId,
    ) -> Self {
        Self {
            query_id,
            snapshot_id,
            stage_id,
            partition_id,
        }
    }
}

pub trait SnapshotStore: Send + Sync {
    fn put(&self, key: SnapshotKey, state: Vec<u8>) -> Result<()>;

    fn get(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>>;

    /// Drop every blob of one snapshot
    fn delete_snapshot(&self, query_id: QueryId, snapshot_id: SnapshotId) -> Result<()>;

    /// Drop every blob of a query
    fn delete_query(&self, query_id: QueryId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    blobs: DashMap<SnapshotKey, Vec<u8>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn put(&self, key: SnapshotKey, state: Vec<u8>) -> Result<()> {
        self.blobs.insert(key, state);
        Ok(())
    }

    fn get(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|blob| blob.value().clone()))
    }

    fn delete_snapshot(&self, query_id: QueryId, snapshot_id: SnapshotId) -> Result<()> {
        self.blobs
            .retain(|key, _| key.query_id != query_id || key.snapshot_id != snapshot_id);
        Ok(())
    }

    fn delete_query(&self, query_id: QueryId) -> Result<()> {
        self.blobs.retain(|key, _| key.query_id != query_id);
        Ok(())
    }
}

/// Local filesystem store: `<root>/<query>/<snapshot>/<stage>-<partition>.state`.
/// Blobs are written to a temporary file and renamed into place, so a reader
/// never sees a partial blob.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn query_dir(&self, query_id: QueryId) -> PathBuf {
        self.root.join(query_id.to_string())
    }

    fn snapshot_dir(&self, query_id: QueryId, snapshot_id: SnapshotId) -> PathBuf {
        self.query_dir(query_id).join(snapshot_id.to_string())
    }

    fn blob_path(&self, key: &SnapshotKey) -> PathBuf {
        self.snapshot_dir(key.query_id, key.snapshot_id)
            .join(format!("{}-{}.state", key.stage_id, key.partition_id))
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn put(&self, key: SnapshotKey, state: Vec<u8>) -> Result<()> {
        let path = self.blob_path(&key);
        let dir = self.snapshot_dir(key.query_id, key.snapshot_id);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(
            ".{}-{}.{}.tmp",
            key.stage_id,
            key.partition_id,
            std::process::id()
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&state)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(QueryError::Checkpoint(format!(
                "failed to move snapshot blob into {}: {}",
                path.display(),
                err
            )));
        }
        Ok(())
    }

    fn get(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete_snapshot(&self, query_id: QueryId, snapshot_id: SnapshotId) -> Result<()> {
        remove_dir_if_exists(&self.snapshot_dir(query_id, snapshot_id))
    }

    fn delete_query(&self, query_id: QueryId) -> Result<()> {
        remove_dir_if_exists(&self.query_dir(query_id))
    }
}
