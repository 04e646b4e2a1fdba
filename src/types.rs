//! Core type definitions for NousDB identifiers, enumerations, and metadata.
//!
//! This module defines the fundamental types used throughout NousDB.
//! All ID types use UUID v7 for time-ordered unique identification.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity identifier (UUID v7 for time-ordering).
///
/// Entities are the primary stored objects — the domain calls them "nouns".
/// An id is assigned on create and never reused; a hard-deleted entity
/// re-added later receives a fresh id.
///
/// # Example
/// ```
/// use nousdb::EntityId;
///
/// let id = EntityId::new();
/// println!("Created entity: {}", id);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Creates a new EntityId with a UUID v7 (time-ordered).
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a nil (all zeros) EntityId.
    /// Useful for testing or sentinel values.
    #[inline]
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the raw UUID bytes for storage.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Creates an EntityId from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses an EntityId from its canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for EntityId {
    /// Returns a nil (all zeros) EntityId.
    ///
    /// For a new unique ID, use [`EntityId::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Edge identifier (UUID v7 for time-ordering).
///
/// Edges are directed, typed, weighted relationships between two entities —
/// the domain calls them "verbs".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    /// Creates a new EdgeId with a UUID v7 (time-ordered).
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a nil (all zeros) EdgeId.
    #[inline]
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the raw UUID bytes for storage.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Creates an EdgeId from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for EdgeId {
    /// Returns a nil (all zeros) EdgeId.
    ///
    /// For a new unique ID, use [`EdgeId::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds.
///
/// Using i64 allows representing dates far into the future and past.
/// Millisecond precision is sufficient for knowledge operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    ///
    /// If the system clock is before the Unix epoch (should never happen
    /// in practice), returns a timestamp of 0 (epoch) rather than panicking.
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp from Unix milliseconds.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as Unix milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns big-endian bytes for storage (enables lexicographic ordering).
    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Embedding vector type alias.
///
/// Vectors are f32 arrays of the database dimension (typically 384).
pub type Vector = Vec<f32>;

/// Closed enumeration of entity categories.
///
/// The kind participates in type-filtered search: queries may restrict the
/// candidate set to a subset of kinds before any other signal is evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A human or agent actor.
    Person,
    /// A document, file, or long-form text.
    Document,
    /// An abstract concept or topic.
    Concept,
    /// Something that happened at a point in time.
    Event,
    /// A conversational message.
    Message,
    /// A physical or logical location.
    Place,
    /// A generic object that fits no other category.
    Thing,
}

impl EntityKind {
    /// All kinds, in stable tag order.
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Person,
        EntityKind::Document,
        EntityKind::Concept,
        EntityKind::Event,
        EntityKind::Message,
        EntityKind::Place,
        EntityKind::Thing,
    ];

    /// Returns the stable storage tag for this kind.
    #[inline]
    pub const fn tag(&self) -> u8 {
        match self {
            EntityKind::Person => 0,
            EntityKind::Document => 1,
            EntityKind::Concept => 2,
            EntityKind::Event => 3,
            EntityKind::Message => 4,
            EntityKind::Place => 5,
            EntityKind::Thing => 6,
        }
    }

    /// Decodes a kind from its storage tag.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EntityKind::Person),
            1 => Some(EntityKind::Document),
            2 => Some(EntityKind::Concept),
            3 => Some(EntityKind::Event),
            4 => Some(EntityKind::Message),
            5 => Some(EntityKind::Place),
            6 => Some(EntityKind::Thing),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Person => "person",
            EntityKind::Document => "document",
            EntityKind::Concept => "concept",
            EntityKind::Event => "event",
            EntityKind::Message => "message",
            EntityKind::Place => "place",
            EntityKind::Thing => "thing",
        };
        f.write_str(name)
    }
}

/// Closed enumeration of relationship kinds.
///
/// Edges are directed: the semantics describe how the **source** entity
/// relates to the **target** entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Source cites or points at the target.
    References,
    /// Source contains the target.
    Contains,
    /// Source is a part of the target.
    PartOf,
    /// Source comes before the target in time or order.
    Precedes,
    /// Source comes after the target in time or order.
    Follows,
    /// General relationship with no specific semantics.
    RelatedTo,
    /// Source was derived or synthesized from the target.
    DerivedFrom,
}

impl Verb {
    /// Returns the stable storage tag for this verb.
    #[inline]
    pub const fn tag(&self) -> u8 {
        match self {
            Verb::References => 0,
            Verb::Contains => 1,
            Verb::PartOf => 2,
            Verb::Precedes => 3,
            Verb::Follows => 4,
            Verb::RelatedTo => 5,
            Verb::DerivedFrom => 6,
        }
    }

    /// Decodes a verb from its storage tag.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Verb::References),
            1 => Some(Verb::Contains),
            2 => Some(Verb::PartOf),
            3 => Some(Verb::Precedes),
            4 => Some(Verb::Follows),
            5 => Some(Verb::RelatedTo),
            6 => Some(Verb::DerivedFrom),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::References => "references",
            Verb::Contains => "contains",
            Verb::PartOf => "part_of",
            Verb::Precedes => "precedes",
            Verb::Follows => "follows",
            Verb::RelatedTo => "related_to",
            Verb::DerivedFrom => "derived_from",
        };
        f.write_str(name)
    }
}

/// Direction for neighbor lookup and graph traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Edges where the entity is the source (source → target).
    Out,
    /// Edges where the entity is the target (source → target).
    In,
    /// Both outgoing and incoming edges.
    Both,
}

/// A scalar or homogeneous-array metadata value.
///
/// Field names and value types are not schema-constrained: any entity may
/// carry any fields. Arrays hold scalars of one element type and are
/// indexed element-wise (`contains` probes the hash index).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Homogeneous array of scalars.
    Array(Vec<MetadataValue>),
}

impl MetadataValue {
    /// Returns true if this value is a scalar (not an array).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, MetadataValue::Array(_))
    }

    /// Returns the numeric value as f64 if this is Int or Float.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(n) => Some(*n as f64),
            MetadataValue::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string slice if this is a Str value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the boolean if this is a Bool value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Str(v)
    }
}

/// Metadata map: field name → scalar or homogeneous array.
///
/// BTreeMap keeps field order deterministic, which makes the binary record
/// encoding stable for a given entity state.
pub type MetadataMap = BTreeMap<String, MetadataValue>;
