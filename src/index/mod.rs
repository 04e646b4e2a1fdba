//! Metadata index: per-field hash and ordered indexes over entity metadata.
//!
//! For every metadata field the index maintains:
//! - a **hash index** (`HashMap<IndexKey, id set>`) answering equality,
//!   `one_of`, `contains`, and `exists` probes,
//! - an **ordered index** (`BTreeMap<IndexKey, id set>`) answering range
//!   operators, keyed on the field's natural ordering (strings
//!   lexicographic, numbers numeric, booleans as 0/1).
//!
//! Array fields are indexed by element. The invariant: for every field and
//! every entity, the entity id is present in that field's indexes iff the
//! current entity metadata contains a matching value. Index updates are
//! applied in the same write as the entity mutation (the registry drives
//! this ordering).
//!
//! A [`selectivity oracle`](MetadataIndex::estimate) answers approximate
//! cardinalities for the planner without materializing id sets, from
//! per-field statistics refreshed every 1000 mutations or 10% of corpus
//! size, whichever comes first.

pub mod predicate;

pub use predicate::{Filter, Leaf, Op};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::Entity;
use crate::error::Result;
use crate::task::CancelToken;
use crate::types::{EntityId, EntityKind, MetadataValue};

/// Mutation count that forces a statistics refresh.
const STATS_REFRESH_MUTATIONS: u64 = 1000;

/// Ordered, hashable key over scalar metadata values.
///
/// Int and Float collapse into one numeric key space so `year = 2003`
/// matches a stored `2003.0`. Negative zero normalizes to positive zero
/// and NaN is unindexable, keeping index probes consistent with direct
/// predicate evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum IndexKey {
    Bool(bool),
    Num(NumKey),
    Str(String),
}

/// f64 with total ordering for use as a map key.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NumKey(f64);

impl NumKey {
    fn new(value: f64) -> Option<Self> {
        if value.is_nan() {
            return None;
        }
        // Collapse -0.0 into +0.0 so equality agrees with f64 ==.
        Some(Self(if value == 0.0 { 0.0 } else { value }))
    }
}

impl PartialEq for NumKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for NumKey {}

impl std::hash::Hash for NumKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for NumKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl IndexKey {
    /// Converts a scalar value into its index key. None for Null, Array,
    /// and NaN.
    fn from_value(value: &MetadataValue) -> Option<Self> {
        match value {
            MetadataValue::Bool(b) => Some(IndexKey::Bool(*b)),
            MetadataValue::Int(n) => NumKey::new(*n as f64).map(IndexKey::Num),
            MetadataValue::Float(n) => NumKey::new(*n).map(IndexKey::Num),
            MetadataValue::Str(s) => Some(IndexKey::Str(s.clone())),
            MetadataValue::Null | MetadataValue::Array(_) => None,
        }
    }

    fn same_variant(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Indexes for one metadata field.
#[derive(Debug, Default)]
struct FieldIndex {
    /// Equality / one_of / contains probes.
    hash: HashMap<IndexKey, BTreeSet<EntityId>>,
    /// Range probes, ordered by the field's natural ordering.
    ordered: BTreeMap<IndexKey, BTreeSet<EntityId>>,
    /// Ids carrying this field with any non-null value (exists probes).
    present: BTreeSet<EntityId>,
}

impl FieldIndex {
    fn insert(&mut self, key: IndexKey, id: EntityId) {
        self.hash.entry(key.clone()).or_default().insert(id);
        self.ordered.entry(key).or_default().insert(id);
    }

    fn remove(&mut self, key: &IndexKey, id: EntityId) {
        if let Some(set) = self.hash.get_mut(key) {
            set.remove(&id);
            if set.is_empty() {
                self.hash.remove(key);
            }
        }
        if let Some(set) = self.ordered.get_mut(key) {
            set.remove(&id);
            if set.is_empty() {
                self.ordered.remove(key);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.present.is_empty() && self.hash.is_empty()
    }
}

/// Per-field cardinality statistics for the selectivity oracle.
#[derive(Clone, Debug, Default)]
struct FieldStats {
    /// Number of distinct indexed values.
    distinct: usize,
    /// Number of ids carrying the field.
    present: usize,
    /// Numeric value span, when the field holds numbers.
    numeric_span: Option<(f64, f64)>,
}

#[derive(Debug, Default)]
struct Stats {
    fields: HashMap<String, FieldStats>,
    universe: usize,
    mutations_since_refresh: u64,
}

/// The metadata index layer.
///
/// Reads take per-field shared locks; writes take the field's exclusive
/// lock plus the universe lock. The hot path (query evaluation) is
/// entirely shared.
pub struct MetadataIndex {
    fields: RwLock<HashMap<String, Arc<RwLock<FieldIndex>>>>,
    /// Dedicated kind index for type-filtered search pre-intersection.
    kinds: RwLock<HashMap<EntityKind, BTreeSet<EntityId>>>,
    universe: RwLock<BTreeSet<EntityId>>,
    stats: RwLock<Stats>,
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataIndex {
    /// Creates an empty metadata index.
    pub fn new() -> Self {
        Self {
            fields: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            universe: RwLock::new(BTreeSet::new()),
            stats: RwLock::new(Stats::default()),
        }
    }

    /// Indexes a live entity's metadata.
    ///
    /// Idempotent for an unchanged entity: keys are sets.
    pub fn index_entity(&self, entity: &Entity) {
        let id = entity.id;
        self.universe.write().insert(id);
        self.kinds.write().entry(entity.kind).or_default().insert(id);

        for (field, value) in &entity.metadata {
            let index = self.field_index(field);
            let mut index = index.write();
            match value {
                MetadataValue::Null => {}
                MetadataValue::Array(items) => {
                    index.present.insert(id);
                    for item in items {
                        if let Some(key) = IndexKey::from_value(item) {
                            index.insert(key, id);
                        }
                    }
                }
                scalar => {
                    index.present.insert(id);
                    if let Some(key) = IndexKey::from_value(scalar) {
                        index.insert(key, id);
                    }
                }
            }
        }
        self.note_mutation();
    }

    /// Removes an entity's metadata from every index.
    pub fn unindex_entity(&self, entity: &Entity) {
        let id = entity.id;
        self.universe.write().remove(&id);
        if let Some(set) = self.kinds.write().get_mut(&entity.kind) {
            set.remove(&id);
        }

        let mut emptied = Vec::new();
        {
            let fields = self.fields.read();
            for (field, value) in &entity.metadata {
                let Some(index) = fields.get(field) else {
                    continue;
                };
                let mut index = index.write();
                index.present.remove(&id);
                match value {
                    MetadataValue::Null => {}
                    MetadataValue::Array(items) => {
                        for item in items {
                            if let Some(key) = IndexKey::from_value(item) {
                                index.remove(&key, id);
                            }
                        }
                    }
                    scalar => {
                        if let Some(key) = IndexKey::from_value(scalar) {
                            index.remove(&key, id);
                        }
                    }
                }
                if index.is_empty() {
                    emptied.push(field.clone());
                }
            }
        }
        if !emptied.is_empty() {
            let mut fields = self.fields.write();
            for field in emptied {
                // Re-check under the exclusive lock; a concurrent writer
                // may have repopulated the field.
                let still_empty = fields.get(&field).is_some_and(|f| f.read().is_empty());
                if still_empty {
                    fields.remove(&field);
                }
            }
        }
        self.note_mutation();
    }

    /// Drops all index state. Used by full reindex on invariant violation.
    pub fn clear(&self) {
        self.fields.write().clear();
        self.kinds.write().clear();
        self.universe.write().clear();
        *self.stats.write() = Stats::default();
    }

    /// Number of live indexed entities.
    pub fn universe_len(&self) -> usize {
        self.universe.read().len()
    }

    /// Returns true if the id is indexed (i.e. the entity is live).
    pub fn is_live(&self, id: EntityId) -> bool {
        self.universe.read().contains(&id)
    }

    /// All live ids, ascending.
    pub fn live_ids(&self) -> Vec<EntityId> {
        self.universe.read().iter().copied().collect()
    }

    /// Union of the kind index over the given kinds.
    pub fn ids_for_kinds(&self, kinds: &[EntityKind]) -> BTreeSet<EntityId> {
        let index = self.kinds.read();
        let mut acc = BTreeSet::new();
        for kind in kinds {
            if let Some(set) = index.get(kind) {
                acc.extend(set.iter().copied());
            }
        }
        acc
    }

    /// Evaluates a filter to a sorted list of entity ids.
    ///
    /// The filter must already be validated. The token is checked between
    /// predicate leaves.
    pub fn ids_for_filter(&self, filter: &Filter, token: &CancelToken) -> Result<Vec<EntityId>> {
        let set = self.evaluate(filter, token)?;
        Ok(set.into_iter().collect())
    }

    fn evaluate(&self, filter: &Filter, token: &CancelToken) -> Result<BTreeSet<EntityId>> {
        match filter {
            Filter::Leaf(leaf) => {
                token.check()?;
                Ok(self.evaluate_leaf(leaf))
            }
            Filter::And(children) => {
                let mut positive: Vec<BTreeSet<EntityId>> = Vec::new();
                let mut negated: Vec<&Filter> = Vec::new();
                for child in children {
                    match child {
                        Filter::Not(inner) => negated.push(inner),
                        other => positive.push(self.evaluate(other, token)?),
                    }
                }

                let mut base = if positive.is_empty() {
                    self.universe.read().clone()
                } else {
                    // Intersect smallest-first; empty short-circuits.
                    positive.sort_by_key(|s| s.len());
                    let mut iter = positive.into_iter();
                    let mut acc = iter.next().unwrap_or_default();
                    for set in iter {
                        if acc.is_empty() {
                            return Ok(acc);
                        }
                        acc = acc.intersection(&set).copied().collect();
                    }
                    acc
                };

                for inner in negated {
                    if base.is_empty() {
                        break;
                    }
                    let exclude = self.evaluate(inner, token)?;
                    base = base.difference(&exclude).copied().collect();
                }
                Ok(base)
            }
            Filter::Or(children) => {
                let mut sets: Vec<BTreeSet<EntityId>> = children
                    .iter()
                    .map(|c| self.evaluate(c, token))
                    .collect::<Result<_>>()?;
                // Union largest-first: start from the biggest set and fold
                // the rest in.
                sets.sort_by_key(|s| std::cmp::Reverse(s.len()));
                let mut iter = sets.into_iter();
                let mut acc = iter.next().unwrap_or_default();
                for set in iter {
                    acc.extend(set);
                }
                Ok(acc)
            }
            Filter::Not(inner) => {
                let matched = self.evaluate(inner, token)?;
                let universe = self.universe.read();
                Ok(universe.difference(&matched).copied().collect())
            }
        }
    }

    fn evaluate_leaf(&self, leaf: &Leaf) -> BTreeSet<EntityId> {
        let fields = self.fields.read();
        let Some(index) = fields.get(&leaf.field) else {
            // Unknown field: everything except not_equals misses.
            return match &leaf.op {
                Op::NotEquals(_) => self.universe.read().clone(),
                _ => BTreeSet::new(),
            };
        };
        let index = index.read();

        match &leaf.op {
            Op::Exists => index.present.clone(),
            Op::Equals(value) | Op::Contains(value) => IndexKey::from_value(value)
                .and_then(|key| index.hash.get(&key).cloned())
                .unwrap_or_default(),
            Op::NotEquals(value) => {
                let matched = IndexKey::from_value(value)
                    .and_then(|key| index.hash.get(&key).cloned())
                    .unwrap_or_default();
                let universe = self.universe.read();
                universe.difference(&matched).copied().collect()
            }
            Op::OneOf(values) => {
                let mut acc = BTreeSet::new();
                for value in values {
                    if let Some(set) = IndexKey::from_value(value).and_then(|k| index.hash.get(&k))
                    {
                        acc.extend(set.iter().copied());
                    }
                }
                acc
            }
            Op::Between(low, high) => {
                let (Some(low), Some(high)) =
                    (IndexKey::from_value(low), IndexKey::from_value(high))
                else {
                    return BTreeSet::new();
                };
                // Mixed-type bounds are a type mismatch: empty, not an error.
                if !low.same_variant(&high) || low > high {
                    return BTreeSet::new();
                }
                Self::collect_range(index.ordered.range(low.clone()..=high), &low)
            }
            Op::GreaterThan(value) | Op::GreaterEqual(value) => {
                let Some(key) = IndexKey::from_value(value) else {
                    return BTreeSet::new();
                };
                let inclusive = matches!(leaf.op, Op::GreaterEqual(_));
                let range = if inclusive {
                    index.ordered.range(key.clone()..)
                } else {
                    use std::ops::Bound;
                    index
                        .ordered
                        .range((Bound::Excluded(key.clone()), Bound::Unbounded))
                };
                Self::collect_range(range, &key)
            }
            Op::LessThan(value) | Op::LessEqual(value) => {
                let Some(key) = IndexKey::from_value(value) else {
                    return BTreeSet::new();
                };
                let inclusive = matches!(leaf.op, Op::LessEqual(_));
                let range = if inclusive {
                    index.ordered.range(..=key.clone())
                } else {
                    index.ordered.range(..key.clone())
                };
                // Leading keys of lesser variants must be skipped, so walk
                // with the variant check rather than relying on contiguity.
                let mut acc = BTreeSet::new();
                for (k, ids) in range {
                    if k.same_variant(&key) {
                        acc.extend(ids.iter().copied());
                    }
                }
                acc
            }
        }
    }

    /// Collects ids from an ordered range, stopping at the first key of a
    /// different variant (the ordered map interleaves variants in rank
    /// order, so same-variant keys are contiguous from the start key).
    fn collect_range<'a>(
        range: impl Iterator<Item = (&'a IndexKey, &'a BTreeSet<EntityId>)>,
        variant_of: &IndexKey,
    ) -> BTreeSet<EntityId> {
        let mut acc = BTreeSet::new();
        for (key, ids) in range {
            if !key.same_variant(variant_of) {
                break;
            }
            acc.extend(ids.iter().copied());
        }
        acc
    }

    // =========================================================================
    // Selectivity oracle
    // =========================================================================

    /// Estimates the cardinality of a filter without materializing it.
    pub fn estimate(&self, filter: &Filter) -> usize {
        self.maybe_refresh_stats();
        let stats = self.stats.read();
        Self::estimate_with(&stats, filter)
    }

    /// Returns true when the filter is "selective": some leaf is an
    /// equality, `one_of`, `contains`, `exists`, or a numeric `between`
    /// spanning less than 10% of the field's observed domain.
    pub fn is_selective(&self, filter: &Filter) -> bool {
        self.maybe_refresh_stats();
        let stats = self.stats.read();
        let mut selective = false;
        filter.for_each_leaf(&mut |leaf| {
            if selective {
                return;
            }
            match &leaf.op {
                Op::Equals(_) | Op::OneOf(_) | Op::Contains(_) | Op::Exists => {
                    selective = true;
                }
                Op::Between(low, high) => {
                    if let (Some(low), Some(high)) = (low.as_number(), high.as_number()) {
                        let span = stats
                            .fields
                            .get(&leaf.field)
                            .and_then(|f| f.numeric_span)
                            .map(|(min, max)| max - min)
                            .unwrap_or(0.0);
                        if span <= 0.0 || (high - low) < span * 0.1 {
                            selective = true;
                        }
                    }
                }
                _ => {}
            }
        });
        selective
    }

    fn estimate_with(stats: &Stats, filter: &Filter) -> usize {
        match filter {
            Filter::Leaf(leaf) => {
                let Some(field) = stats.fields.get(&leaf.field) else {
                    return match leaf.op {
                        Op::NotEquals(_) => stats.universe,
                        _ => 0,
                    };
                };
                let avg_bucket = if field.distinct == 0 {
                    0
                } else {
                    field.present.div_ceil(field.distinct)
                };
                match &leaf.op {
                    Op::Exists => field.present,
                    Op::Equals(_) | Op::Contains(_) => avg_bucket,
                    Op::NotEquals(_) => stats.universe.saturating_sub(avg_bucket),
                    Op::OneOf(values) => (avg_bucket * values.len()).min(field.present),
                    Op::Between(low, high) => {
                        match (low.as_number(), high.as_number(), field.numeric_span) {
                            (Some(low), Some(high), Some((min, max))) if max > min => {
                                let fraction = ((high - low) / (max - min)).clamp(0.0, 1.0);
                                (field.present as f64 * fraction).ceil() as usize
                            }
                            _ => field.present / 2,
                        }
                    }
                    // Open ranges: assume half the field's population.
                    _ => field.present / 2,
                }
            }
            Filter::And(children) => children
                .iter()
                .map(|c| Self::estimate_with(stats, c))
                .min()
                .unwrap_or(0),
            Filter::Or(children) => children
                .iter()
                .map(|c| Self::estimate_with(stats, c))
                .sum::<usize>()
                .min(stats.universe),
            Filter::Not(inner) => stats
                .universe
                .saturating_sub(Self::estimate_with(stats, inner)),
        }
    }

    fn note_mutation(&self) {
        self.stats.write().mutations_since_refresh += 1;
    }

    fn maybe_refresh_stats(&self) {
        let needs = {
            let stats = self.stats.read();
            let threshold =
                STATS_REFRESH_MUTATIONS.min((stats.universe as u64 / 10).max(1));
            stats.mutations_since_refresh >= threshold
        };
        if needs {
            self.refresh_stats();
        }
    }

    /// Recomputes the per-field statistics snapshot.
    pub fn refresh_stats(&self) {
        let mut snapshot: HashMap<String, FieldStats> = HashMap::new();
        {
            let fields = self.fields.read();
            for (name, index) in fields.iter() {
                let index = index.read();
                let mut numeric_span: Option<(f64, f64)> = None;
                for key in index.ordered.keys() {
                    if let IndexKey::Num(n) = key {
                        numeric_span = Some(match numeric_span {
                            None => (n.0, n.0),
                            Some((min, max)) => (min.min(n.0), max.max(n.0)),
                        });
                    }
                }
                snapshot.insert(
                    name.clone(),
                    FieldStats {
                        distinct: index.hash.len(),
                        present: index.present.len(),
                        numeric_span,
                    },
                );
            }
        }
        let universe = self.universe.read().len();
        let mut stats = self.stats.write();
        stats.fields = snapshot;
        stats.universe = universe;
        stats.mutations_since_refresh = 0;
    }

    fn field_index(&self, field: &str) -> Arc<RwLock<FieldIndex>> {
        if let Some(index) = self.fields.read().get(field) {
            return Arc::clone(index);
        }
        let mut fields = self.fields.write();
        Arc::clone(fields.entry(field.to_string()).or_default())
    }
}

impl std::fmt::Debug for MetadataIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataIndex")
            .field("fields", &self.fields.read().len())
            .field("universe", &self.universe.read().len())
            .finish()
    }
}
