//! Local-filesystem storage backend.
//!
//! One record file per entity under a sharded path, plus an index-blob
//! directory. Each individual file write is atomic (temp file + rename),
//! but a multi-op batch is **not**: a crash can leave a prefix of the batch
//! applied. The backend reports this through `atomic_batches() == false`
//! and the registry compensates with write-ahead ordering (the entity
//! record, the source of truth, is always the first op staged).
//!
//! # Directory layout
//!
//! ```text
//! root/
//!   LOCK                      advisory writer lock (fs2)
//!   SEQ                       commit sequence, u64 LE
//!   entities/ab/cd/<id>       entity records, sharded by id prefix
//!   edges/<id>                edge records
//!   edges_by_source/<entity>/<edge>   marker files (endpoint index)
//!   edges_by_target/<entity>/<edge>   marker files (endpoint index)
//!   blobs/<name>              opaque index blobs
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::{codec, BatchOp, StorageBackend, WriteBatch};
use crate::entity::{Edge, Entity};
use crate::error::{Result, StorageError};
use crate::types::{EdgeId, EntityId};

/// Filesystem backend rooted at a directory.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    // Serializes commits so the sequence file never tears.
    commit_lock: Mutex<()>,
    // Held for the backend's lifetime to keep other writers out.
    _lock_file: File,
}

impl FsBackend {
    /// Opens or creates a filesystem backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another process holds the writer lock.
    #[instrument(fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [
            root.clone(),
            root.join("entities"),
            root.join("edges"),
            root.join("edges_by_source"),
            root.join("edges_by_target"),
            root.join("blobs"),
        ] {
            fs::create_dir_all(&dir)?;
        }

        let lock_file = File::create(root.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        debug!("Filesystem backend opened");
        Ok(Self {
            root,
            commit_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    fn entity_path(&self, id: EntityId) -> PathBuf {
        let s = id.to_string();
        self.root
            .join("entities")
            .join(&s[0..2])
            .join(&s[2..4])
            .join(s)
    }

    fn edge_path(&self, id: EdgeId) -> PathBuf {
        self.root.join("edges").join(id.to_string())
    }

    fn endpoint_dir(&self, index: &str, id: EntityId) -> PathBuf {
        self.root.join(index).join(id.to_string())
    }

    /// Atomic single-file write: temp file in the target dir, then rename.
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_sequence(&self) -> Result<u64> {
        match self.read_file(&self.root.join("SEQ"))? {
            Some(bytes) if bytes.len() == 8 => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok(u64::from_le_bytes(arr))
            }
            Some(_) => Err(StorageError::corrupted("malformed sequence file").into()),
            None => Ok(0),
        }
    }

    fn edges_in_dir(&self, dir: &Path) -> Result<Vec<Edge>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut edges = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(edge_id) = name
                .to_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(|u| EdgeId(u))
            else {
                continue;
            };
            if let Some(bytes) = self.read_file(&self.edge_path(edge_id))? {
                edges.push(codec::decode_edge(&bytes)?);
            }
        }
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    fn unlink_edge(&self, id: EdgeId) -> Result<()> {
        if let Some(bytes) = self.read_file(&self.edge_path(id))? {
            let edge = codec::decode_edge(&bytes)?;
            let _ = fs::remove_file(
                self.endpoint_dir("edges_by_source", edge.source_id)
                    .join(id.to_string()),
            );
            let _ = fs::remove_file(
                self.endpoint_dir("edges_by_target", edge.target_id)
                    .join(id.to_string()),
            );
            fs::remove_file(self.edge_path(id))?;
        }
        Ok(())
    }
}

impl StorageBackend for FsBackend {
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        match self.read_file(&self.entity_path(id))? {
            Some(bytes) => Ok(Some(codec::decode_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        match self.read_file(&self.edge_path(id))? {
            Some(bytes) => Ok(Some(codec::decode_edge(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_entity_ids(
        &self,
        prefix: Option<&str>,
        cursor: Option<EntityId>,
        limit: usize,
    ) -> Result<(Vec<EntityId>, Option<EntityId>)> {
        if limit == 0 {
            return Ok((Vec::new(), cursor));
        }
        // Walk the two shard levels and collect. The directory tree is not
        // ordered, so collect-then-sort keeps the cursor contract.
        let mut all = Vec::new();
        let entities = self.root.join("entities");
        for shard1 in fs::read_dir(&entities)? {
            let shard1 = shard1?;
            if !shard1.file_type()?.is_dir() {
                continue;
            }
            for shard2 in fs::read_dir(shard1.path())? {
                let shard2 = shard2?;
                if !shard2.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(shard2.path())? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(id) = name.to_str().and_then(EntityId::parse) else {
                        continue;
                    };
                    if let Some(prefix) = prefix {
                        if !id.to_string().starts_with(prefix) {
                            continue;
                        }
                    }
                    all.push(id);
                }
            }
        }
        all.sort();

        let start = match cursor {
            Some(after) => all.partition_point(|&id| id <= after),
            None => 0,
        };
        let page: Vec<EntityId> = all[start..].iter().take(limit).copied().collect();
        let next = if start + page.len() < all.len() {
            page.last().copied()
        } else {
            None
        };
        Ok((page, next))
    }

    fn list_edges_by_source(&self, id: EntityId) -> Result<Vec<Edge>> {
        self.edges_in_dir(&self.endpoint_dir("edges_by_source", id))
    }

    fn list_edges_by_target(&self, id: EntityId) -> Result<Vec<Edge>> {
        self.edges_in_dir(&self.endpoint_dir("edges_by_target", id))
    }

    fn get_index_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_file(&self.root.join("blobs").join(name))
    }

    fn sequence(&self) -> Result<u64> {
        self.read_sequence()
    }

    fn commit(&self, batch: WriteBatch) -> Result<u64> {
        let _guard = self.commit_lock.lock();
        for op in batch.ops {
            match op {
                BatchOp::PutEntity(entity) => {
                    let bytes = codec::encode_entity(&entity);
                    self.write_file(&self.entity_path(entity.id), &bytes)?;
                }
                BatchOp::DeleteEntity(id) => {
                    let path = self.entity_path(id);
                    if path.exists() {
                        fs::remove_file(path)?;
                    }
                }
                BatchOp::PutEdge(edge) => {
                    let bytes = codec::encode_edge(&edge);
                    self.write_file(&self.edge_path(edge.id), &bytes)?;
                    for (index, endpoint) in [
                        ("edges_by_source", edge.source_id),
                        ("edges_by_target", edge.target_id),
                    ] {
                        let dir = self.endpoint_dir(index, endpoint);
                        fs::create_dir_all(&dir)?;
                        File::create(dir.join(edge.id.to_string()))?;
                    }
                }
                BatchOp::DeleteEdge(id) => {
                    self.unlink_edge(id)?;
                }
                BatchOp::PutBlob(name, bytes) => {
                    self.write_file(&self.root.join("blobs").join(name), &bytes)?;
                }
            }
        }
        let next = self.read_sequence()? + 1;
        self.write_file(&self.root.join("SEQ"), &next.to_le_bytes())?;
        Ok(next)
    }

    fn atomic_batches(&self) -> bool {
        // Each file write is atomic; a batch is not.
        false
    }

    fn close(self: Box<Self>) -> Result<()> {
        debug!("Filesystem backend closed");
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
