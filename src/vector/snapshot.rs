//! HNSW snapshot blob encoding.
//!
//! The index is periodically persisted through the storage backend as one
//! opaque blob. The blob carries the graph **structure** only — node ids,
//! layer assignments, neighbor lists, tombstones, and the entry point.
//! Vectors are not duplicated: they are re-read from the entity records
//! (the source of truth) at load time.
//!
//! ```text
//! [magic: "NSNP"][version: u32][dim: u32][m: u32]
//! [total_nodes: u32][entry: u32 (0xFFFF_FFFF = none)][sequence: u64]
//! per node:
//!   [entity id: 16 bytes][level: u8][deleted: u8]
//!   per layer 0..=level: [count: u16][neighbor: u32 ...]
//! [crc32 of everything above: u32]
//! ```
//!
//! All integers little-endian. A failed checksum, a dangling neighbor, a
//! missing entity record, or a parameter mismatch makes the whole blob
//! invalid; the caller rebuilds from the entity set and logs a degraded
//! startup.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;

use super::hnsw::{GraphState, HnswIndex, Node};
use crate::config::{HnswConfig, Metric};
use crate::error::{Result, StorageError};
use crate::storage::codec::Reader;
use crate::types::{EntityId, Vector};

/// Blob magic bytes.
pub const MAGIC: &[u8; 4] = b"NSNP";

/// Blob format version.
pub const VERSION: u32 = 1;

const NO_ENTRY: u32 = u32::MAX;

/// The blob name under which the snapshot is stored in the backend.
pub const BLOB_NAME: &str = "hnsw";

/// A decoded snapshot: the reconstructed index plus the commit sequence
/// it is consistent with.
#[derive(Debug)]
pub struct LoadedSnapshot {
    /// The reconstructed index.
    pub index: HnswIndex,
    /// Storage commit sequence at snapshot time; commits after it must be
    /// replayed by the caller.
    pub sequence: u64,
}

/// Encodes the graph structure into a snapshot blob.
pub(crate) fn encode(index: &HnswIndex, state: &GraphState, sequence: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + state.nodes.len() * 64);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(index.dimension() as u32).to_le_bytes());
    buf.extend_from_slice(&(index.m() as u32).to_le_bytes());
    buf.extend_from_slice(&(state.nodes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&state.entry.unwrap_or(NO_ENTRY).to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());

    for node in &state.nodes {
        buf.extend_from_slice(node.entity.as_bytes());
        buf.push(node.level as u8);
        buf.push(u8::from(node.is_deleted()));
        for layer in &node.neighbors {
            let links = layer.read();
            buf.extend_from_slice(&(links.len() as u16).to_le_bytes());
            for &neighbor in links.iter() {
                buf.extend_from_slice(&neighbor.to_le_bytes());
            }
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Decodes a snapshot blob, re-reading vectors through `fetch_vector`.
///
/// # Errors
///
/// Returns `CorruptSnapshot` on any validation failure. The caller treats
/// that as a signal to rebuild the index from the entity set.
pub fn decode(
    bytes: &[u8],
    metric: Metric,
    config: &HnswConfig,
    mut fetch_vector: impl FnMut(EntityId) -> Result<Option<Vector>>,
) -> Result<LoadedSnapshot> {
    if bytes.len() < 4 + 4 {
        return Err(corrupt("blob too short"));
    }

    // Verify the CRC over the body before parsing anything else.
    let body_len = bytes.len() - 4;
    let stored_crc = u32::from_le_bytes(
        bytes[body_len..]
            .try_into()
            .map_err(|_| corrupt("malformed footer"))?,
    );
    if crc32fast::hash(&bytes[..body_len]) != stored_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let mut r = Reader::new(&bytes[..body_len]);
    if r.take(4)? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let dim = r.u32()? as usize;
    let m = r.u32()? as usize;
    if m != config.m {
        return Err(corrupt(format!(
            "m mismatch: snapshot {}, config {}",
            m, config.m
        )));
    }
    let total = r.u32()? as usize;
    let entry = r.u32()?;
    let sequence = r.u64()?;

    if entry != NO_ENTRY && entry as usize >= total {
        return Err(corrupt("entry point out of range"));
    }

    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(total);
    let mut by_entity: HashMap<EntityId, u32> = HashMap::with_capacity(total);

    for internal in 0..total {
        let entity = EntityId::from_bytes(r.id_raw()?);
        let level = r.u8()? as usize;
        let deleted = r.u8()? != 0;

        let mut neighbors = Vec::with_capacity(level + 1);
        for _ in 0..=level {
            let count = r.u16()? as usize;
            let mut links = Vec::with_capacity(count);
            for _ in 0..count {
                let neighbor = r.u32()?;
                if neighbor as usize >= total {
                    return Err(corrupt("dangling neighbor id"));
                }
                links.push(neighbor);
            }
            neighbors.push(RwLock::new(links));
        }

        let vector = fetch_vector(entity)?
            .ok_or_else(|| corrupt(format!("entity {} missing from storage", entity)))?;
        if vector.len() != dim {
            return Err(corrupt("vector dimension drifted from snapshot"));
        }

        // Later nodes supersede earlier ones for the same entity (the
        // update path tombstones and re-links).
        by_entity.insert(entity, internal as u32);
        nodes.push(Arc::new(Node {
            entity,
            vector,
            level,
            neighbors,
            deleted: AtomicBool::new(deleted),
        }));
    }

    if r.remaining() != 0 {
        return Err(corrupt("trailing bytes after node records"));
    }

    let state = GraphState {
        nodes,
        by_entity,
        entry: if entry == NO_ENTRY { None } else { Some(entry) },
    };
    Ok(LoadedSnapshot {
        index: HnswIndex::from_parts(dim, metric, config.clone(), state),
        sequence,
    })
}

fn corrupt(reason: impl Into<String>) -> crate::error::NousError {
    StorageError::corrupt_snapshot(BLOB_NAME, reason).into()
}

impl Reader<'_> {
    /// Raw 16-byte id without the record codec's length prefix.
    fn id_raw(&mut self) -> Result<[u8; 16]> {
        let b = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::task::CancelToken;
    use crate::vector::VectorIndex;

    fn test_config() -> HnswConfig {
        HnswConfig {
            m: 8,
            ef_construction: 64,
            ef_search: 32,
        }
    }

    fn make_vector(seed: u64, dim: usize) -> Vector {
        (0..dim)
            .map(|i| (seed as f32 * 0.1 + i as f32 * 0.01).sin())
            .collect()
    }

    fn build_index(dim: usize, n: u64) -> (HnswIndex, HashMap<EntityId, Vector>) {
        let index = HnswIndex::new(dim, Metric::Cosine, test_config());
        let mut vectors = HashMap::new();
        for seed in 0..n {
            let id = EntityId::new();
            let v = make_vector(seed, dim);
            index.insert(id, &v).unwrap();
            vectors.insert(id, v);
        }
        (index, vectors)
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_results() {
        let dim = 8;
        let (index, vectors) = build_index(dim, 60);
        let blob = index.snapshot(42);

        let loaded = decode(&blob, Metric::Cosine, &test_config(), |id| {
            Ok(vectors.get(&id).cloned())
        })
        .unwrap();
        assert_eq!(loaded.sequence, 42);

        let query = make_vector(30, dim);
        let before = index
            .search(&query, 5, Some(64), None, &CancelToken::new())
            .unwrap();
        let after = loaded
            .index
            .search(&query, 5, Some(64), None, &CancelToken::new())
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_snapshot_preserves_tombstones() {
        let dim = 4;
        let (index, vectors) = build_index(dim, 10);
        let victim = *vectors.keys().next().unwrap();
        index.remove(victim).unwrap();

        let blob = index.snapshot(1);
        let loaded = decode(&blob, Metric::Cosine, &test_config(), |id| {
            Ok(vectors.get(&id).cloned())
        })
        .unwrap();

        assert!(!loaded.index.contains(victim));
        assert_eq!(loaded.index.len(), 9);
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let (index, vectors) = build_index(4, 10);
        let mut blob = index.snapshot(1);
        let mid = blob.len() / 2;
        blob[mid] ^= 0x40;

        let err = decode(&blob, Metric::Cosine, &test_config(), |id| {
            Ok(vectors.get(&id).cloned())
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptSnapshot);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let (index, vectors) = build_index(4, 10);
        let blob = index.snapshot(1);
        let err = decode(&blob[..blob.len() / 2], Metric::Cosine, &test_config(), |id| {
            Ok(vectors.get(&id).cloned())
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptSnapshot);
    }

    #[test]
    fn test_missing_entity_is_corrupt() {
        let (index, _vectors) = build_index(4, 5);
        let blob = index.snapshot(1);
        let err = decode(&blob, Metric::Cosine, &test_config(), |_| Ok(None)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptSnapshot);
    }

    #[test]
    fn test_m_mismatch_is_corrupt() {
        let (index, vectors) = build_index(4, 5);
        let blob = index.snapshot(1);
        let other = HnswConfig {
            m: 32,
            ..test_config()
        };
        let err = decode(&blob, Metric::Cosine, &other, |id| {
            Ok(vectors.get(&id).cloned())
        })
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptSnapshot);
    }

    #[test]
    fn test_empty_index_snapshot() {
        let index = HnswIndex::new(4, Metric::Cosine, test_config());
        let blob = index.snapshot(0);
        let loaded = decode(&blob, Metric::Cosine, &test_config(), |_| -> Result<Option<Vector>> {
            panic!("no entities to fetch")
        })
        .unwrap();
        assert!(loaded.index.is_empty());
        assert_eq!(loaded.sequence, 0);
    }
}
