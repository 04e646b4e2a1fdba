//! Binary record encoding for entities and edges.
//!
//! Every storage backend persists the same bytes, so records written by one
//! backend can be read by another. The layout is deliberately simple:
//!
//! ```text
//! Entity record
//!   [tag: u8 = 0x01]
//!   [id_len: u8][id bytes]
//!   [vector_present: u8] [count: u32 LE] [f32 LE ...]     (when present)
//!   [kind tag: u8]
//!   [data_len: u32 LE][utf8 bytes]
//!   [metadata map]
//!   [created_at: i64 LE][updated_at: i64 LE]
//!   [deleted_present: u8] [deleted_at: i64 LE]            (when present)
//!
//! Edge record
//!   [tag: u8 = 0x02]
//!   [id][source_id][target_id]                             (len-prefixed)
//!   [verb tag: u8]
//!   [weight_present: u8] [weight: f32 LE]                  (when present)
//!   [metadata map]
//!   [created_at: i64 LE]
//!
//! Metadata map
//!   [entry_count: u32 LE]
//!   per entry: [key_len: u16 LE][key utf8][tagged value]
//!
//! Tagged value: 0=null, 1=bool, 2=i64, 3=f64, 4=utf8 string,
//! 5=homogeneous array ([elem tag: u8][count: u32 LE][untagged elems])
//! ```
//!
//! Timestamps are i64 milliseconds since epoch. All integers little-endian.

use crate::entity::{Edge, Entity};
use crate::error::{Result, StorageError};
use crate::types::{
    EdgeId, EntityId, EntityKind, MetadataMap, MetadataValue, Timestamp, Verb,
};

/// Record tag for entity records.
pub const RECORD_ENTITY: u8 = 0x01;
/// Record tag for edge records.
pub const RECORD_EDGE: u8 = 0x02;

const VALUE_NULL: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_FLOAT: u8 = 3;
const VALUE_STR: u8 = 4;
const VALUE_ARRAY: u8 = 5;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes an entity into its binary record form.
pub fn encode_entity(entity: &Entity) -> Vec<u8> {
    // Rough capacity: header + vector + data + a little metadata slack.
    let mut buf = Vec::with_capacity(64 + entity.vector.len() * 4 + entity.data.len());
    buf.push(RECORD_ENTITY);
    put_id(&mut buf, entity.id.as_bytes());

    if entity.vector.is_empty() {
        buf.push(0);
    } else {
        buf.push(1);
        buf.extend_from_slice(&(entity.vector.len() as u32).to_le_bytes());
        for v in &entity.vector {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    buf.push(entity.kind.tag());

    buf.extend_from_slice(&(entity.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(entity.data.as_bytes());

    put_metadata(&mut buf, &entity.metadata);

    buf.extend_from_slice(&entity.created_at.as_millis().to_le_bytes());
    buf.extend_from_slice(&entity.updated_at.as_millis().to_le_bytes());

    match entity.deleted_at {
        Some(ts) => {
            buf.push(1);
            buf.extend_from_slice(&ts.as_millis().to_le_bytes());
        }
        None => buf.push(0),
    }

    buf
}

/// Encodes an edge into its binary record form.
pub fn encode_edge(edge: &Edge) -> Vec<u8> {
    let mut buf = Vec::with_capacity(80);
    buf.push(RECORD_EDGE);
    put_id(&mut buf, edge.id.as_bytes());
    put_id(&mut buf, edge.source_id.as_bytes());
    put_id(&mut buf, edge.target_id.as_bytes());
    buf.push(edge.verb.tag());
    buf.push(1);
    buf.extend_from_slice(&edge.weight.to_le_bytes());
    put_metadata(&mut buf, &edge.metadata);
    buf.extend_from_slice(&edge.created_at.as_millis().to_le_bytes());
    buf
}

fn put_id(buf: &mut Vec<u8>, id: &[u8; 16]) {
    buf.push(16);
    buf.extend_from_slice(id);
}

fn put_metadata(buf: &mut Vec<u8>, metadata: &MetadataMap) {
    buf.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    for (key, value) in metadata {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        put_value(buf, value);
    }
}

fn put_value(buf: &mut Vec<u8>, value: &MetadataValue) {
    match value {
        MetadataValue::Null => buf.push(VALUE_NULL),
        MetadataValue::Bool(b) => {
            buf.push(VALUE_BOOL);
            buf.push(u8::from(*b));
        }
        MetadataValue::Int(n) => {
            buf.push(VALUE_INT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        MetadataValue::Float(n) => {
            buf.push(VALUE_FLOAT);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        MetadataValue::Str(s) => {
            buf.push(VALUE_STR);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        MetadataValue::Array(items) => {
            buf.push(VALUE_ARRAY);
            let elem_tag = items.first().map_or(VALUE_NULL, scalar_tag);
            buf.push(elem_tag);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                put_scalar_untagged(buf, item);
            }
        }
    }
}

fn scalar_tag(value: &MetadataValue) -> u8 {
    match value {
        MetadataValue::Null => VALUE_NULL,
        MetadataValue::Bool(_) => VALUE_BOOL,
        MetadataValue::Int(_) => VALUE_INT,
        MetadataValue::Float(_) => VALUE_FLOAT,
        MetadataValue::Str(_) => VALUE_STR,
        MetadataValue::Array(_) => VALUE_ARRAY,
    }
}

fn put_scalar_untagged(buf: &mut Vec<u8>, value: &MetadataValue) {
    match value {
        MetadataValue::Null => {}
        MetadataValue::Bool(b) => buf.push(u8::from(*b)),
        MetadataValue::Int(n) => buf.extend_from_slice(&n.to_le_bytes()),
        MetadataValue::Float(n) => buf.extend_from_slice(&n.to_le_bytes()),
        MetadataValue::Str(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        // Nested arrays are rejected at validation; encode as empty.
        MetadataValue::Array(_) => {}
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes an entity record.
///
/// # Errors
///
/// Returns `StorageError::Corrupted` on truncation, bad tags, or invalid
/// UTF-8 — a record either decodes fully or not at all.
pub fn decode_entity(bytes: &[u8]) -> Result<Entity> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    if tag != RECORD_ENTITY {
        return Err(corrupt(format!("expected entity tag 0x01, found {:#04x}", tag)));
    }

    let id = EntityId::from_bytes(r.id()?);

    let vector = if r.u8()? == 1 {
        let count = r.u32()? as usize;
        let mut vector = Vec::with_capacity(count);
        for _ in 0..count {
            vector.push(r.f32()?);
        }
        vector
    } else {
        Vec::new()
    };

    let kind_tag = r.u8()?;
    let kind = EntityKind::from_tag(kind_tag)
        .ok_or_else(|| corrupt(format!("unknown entity kind tag {}", kind_tag)))?;

    let data_len = r.u32()? as usize;
    let data = r.utf8(data_len)?;

    let metadata = read_metadata(&mut r)?;

    let created_at = Timestamp::from_millis(r.i64()?);
    let updated_at = Timestamp::from_millis(r.i64()?);
    let deleted_at = if r.u8()? == 1 {
        Some(Timestamp::from_millis(r.i64()?))
    } else {
        None
    };

    Ok(Entity {
        id,
        vector,
        kind,
        data,
        metadata,
        created_at,
        updated_at,
        deleted_at,
    })
}

/// Decodes an edge record.
pub fn decode_edge(bytes: &[u8]) -> Result<Edge> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    if tag != RECORD_EDGE {
        return Err(corrupt(format!("expected edge tag 0x02, found {:#04x}", tag)));
    }

    let id = EdgeId::from_bytes(r.id()?);
    let source_id = EntityId::from_bytes(r.id()?);
    let target_id = EntityId::from_bytes(r.id()?);

    let verb_tag = r.u8()?;
    let verb = Verb::from_tag(verb_tag)
        .ok_or_else(|| corrupt(format!("unknown verb tag {}", verb_tag)))?;

    let weight = if r.u8()? == 1 {
        r.f32()?
    } else {
        crate::entity::DEFAULT_EDGE_WEIGHT
    };

    let metadata = read_metadata(&mut r)?;
    let created_at = Timestamp::from_millis(r.i64()?);

    Ok(Edge {
        id,
        source_id,
        target_id,
        verb,
        weight,
        metadata,
        created_at,
    })
}

fn read_metadata(r: &mut Reader<'_>) -> Result<MetadataMap> {
    let count = r.u32()? as usize;
    let mut map = MetadataMap::new();
    for _ in 0..count {
        let key_len = r.u16()? as usize;
        let key = r.utf8(key_len)?;
        let value = read_value(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_value(r: &mut Reader<'_>) -> Result<MetadataValue> {
    let tag = r.u8()?;
    match tag {
        VALUE_NULL => Ok(MetadataValue::Null),
        VALUE_BOOL => Ok(MetadataValue::Bool(r.u8()? != 0)),
        VALUE_INT => Ok(MetadataValue::Int(r.i64()?)),
        VALUE_FLOAT => Ok(MetadataValue::Float(r.f64()?)),
        VALUE_STR => {
            let len = r.u32()? as usize;
            Ok(MetadataValue::Str(r.utf8(len)?))
        }
        VALUE_ARRAY => {
            let elem_tag = r.u8()?;
            let count = r.u32()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_scalar_untagged(r, elem_tag)?);
            }
            Ok(MetadataValue::Array(items))
        }
        other => Err(corrupt(format!("unknown value tag {}", other))),
    }
}

fn read_scalar_untagged(r: &mut Reader<'_>, elem_tag: u8) -> Result<MetadataValue> {
    match elem_tag {
        VALUE_NULL => Ok(MetadataValue::Null),
        VALUE_BOOL => Ok(MetadataValue::Bool(r.u8()? != 0)),
        VALUE_INT => Ok(MetadataValue::Int(r.i64()?)),
        VALUE_FLOAT => Ok(MetadataValue::Float(r.f64()?)),
        VALUE_STR => {
            let len = r.u32()? as usize;
            Ok(MetadataValue::Str(r.utf8(len)?))
        }
        other => Err(corrupt(format!("invalid array element tag {}", other))),
    }
}

fn corrupt(msg: String) -> crate::error::NousError {
    StorageError::corrupted(msg).into()
}

/// Bounds-checked cursor over a record's bytes.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| corrupt(format!("record truncated at offset {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub(crate) fn id(&mut self) -> Result<[u8; 16]> {
        let len = self.u8()? as usize;
        if len != 16 {
            return Err(corrupt(format!("unsupported id length {}", len)));
        }
        let b = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    pub(crate) fn utf8(&mut self, len: usize) -> Result<String> {
        let b = self.take(len)?;
        String::from_utf8(b.to_vec())
            .map_err(|_| corrupt("invalid utf-8 in record".to_string()))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DEFAULT_EDGE_WEIGHT;

    fn sample_entity() -> Entity {
        let mut metadata = MetadataMap::new();
        metadata.insert("category".into(), MetadataValue::from("blog"));
        metadata.insert("views".into(), MetadataValue::Int(42));
        metadata.insert("rating".into(), MetadataValue::Float(4.5));
        metadata.insert("published".into(), MetadataValue::Bool(true));
        metadata.insert("draft_of".into(), MetadataValue::Null);
        metadata.insert(
            "tags".into(),
            MetadataValue::Array(vec![
                MetadataValue::from("rust"),
                MetadataValue::from("search"),
            ]),
        );
        Entity {
            id: EntityId::new(),
            vector: vec![0.25, -1.5, 3.0, 0.0],
            kind: EntityKind::Document,
            data: "an article about fused retrieval".to_string(),
            metadata,
            created_at: Timestamp::from_millis(1_700_000_000_000),
            updated_at: Timestamp::from_millis(1_700_000_100_000),
            deleted_at: None,
        }
    }

    #[test]
    fn test_entity_record_roundtrip() {
        let entity = sample_entity();
        let bytes = encode_entity(&entity);
        assert_eq!(bytes[0], RECORD_ENTITY);

        let decoded = decode_entity(&bytes).unwrap();
        assert_eq!(decoded.id, entity.id);
        assert_eq!(decoded.vector, entity.vector);
        assert_eq!(decoded.kind, entity.kind);
        assert_eq!(decoded.data, entity.data);
        assert_eq!(decoded.metadata, entity.metadata);
        assert_eq!(decoded.created_at, entity.created_at);
        assert_eq!(decoded.updated_at, entity.updated_at);
        assert_eq!(decoded.deleted_at, None);
    }

    #[test]
    fn test_tombstoned_entity_roundtrip() {
        let mut entity = sample_entity();
        entity.deleted_at = Some(Timestamp::from_millis(1_700_000_200_000));
        let decoded = decode_entity(&encode_entity(&entity)).unwrap();
        assert_eq!(decoded.deleted_at, entity.deleted_at);
    }

    #[test]
    fn test_edge_record_roundtrip() {
        let edge = Edge {
            id: EdgeId::new(),
            source_id: EntityId::new(),
            target_id: EntityId::new(),
            verb: Verb::References,
            weight: 0.75,
            metadata: MetadataMap::new(),
            created_at: Timestamp::from_millis(1_700_000_000_000),
        };
        let bytes = encode_edge(&edge);
        assert_eq!(bytes[0], RECORD_EDGE);

        let decoded = decode_edge(&bytes).unwrap();
        assert_eq!(decoded.id, edge.id);
        assert_eq!(decoded.source_id, edge.source_id);
        assert_eq!(decoded.target_id, edge.target_id);
        assert_eq!(decoded.verb, edge.verb);
        assert!((decoded.weight - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_truncated_record_is_corrupt_not_panic() {
        let bytes = encode_entity(&sample_entity());
        for cut in [0, 1, 5, bytes.len() / 2, bytes.len() - 1] {
            let result = decode_entity(&bytes[..cut]);
            assert!(result.is_err(), "cut at {} should fail", cut);
        }
    }

    #[test]
    fn test_wrong_record_tag_rejected() {
        let entity = sample_entity();
        let bytes = encode_entity(&entity);
        assert!(decode_edge(&bytes).is_err());

        let mut bad = bytes.clone();
        bad[0] = 0x7f;
        assert!(decode_entity(&bad).is_err());
    }

    #[test]
    fn test_missing_weight_defaults() {
        let edge = Edge {
            id: EdgeId::new(),
            source_id: EntityId::new(),
            target_id: EntityId::new(),
            verb: Verb::Contains,
            weight: 0.9,
            metadata: MetadataMap::new(),
            created_at: Timestamp::from_millis(0),
        };
        let mut bytes = encode_edge(&edge);
        // Flip the weight-present flag and splice out the f32.
        let flag_pos = 1 + 17 * 3 + 1;
        bytes[flag_pos] = 0;
        bytes.drain(flag_pos + 1..flag_pos + 5);
        let decoded = decode_edge(&bytes).unwrap();
        assert!((decoded.weight - DEFAULT_EDGE_WEIGHT).abs() < f32::EPSILON);
    }

    #[test]
    fn test_vectorless_entity_roundtrip() {
        let mut entity = sample_entity();
        entity.vector = Vec::new();
        let decoded = decode_entity(&encode_entity(&entity)).unwrap();
        assert!(decoded.vector.is_empty());
    }
}
