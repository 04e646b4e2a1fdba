//! Typed predicate trees for metadata filtering.
//!
//! A filter is a tree of [`Leaf`] conditions combined with `and` / `or` /
//! `not`. Operators are a closed tagged union — there is no stringly-typed
//! dispatch, so an unknown operator cannot be constructed. Structural
//! violations (a `not` outside the positions the evaluator can subtract
//! it in) are rejected with `InvalidPredicate` before evaluation.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::types::{MetadataMap, MetadataValue};

/// A metadata filter tree.
///
/// # Example
/// ```
/// use nousdb::{Filter, MetadataValue};
///
/// let filter = Filter::and(vec![
///     Filter::equals("category", "blog"),
///     Filter::between("year", MetadataValue::Int(2003), MetadataValue::Int(2005)),
/// ]);
/// assert!(filter.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// A single field condition.
    Leaf(Leaf),
    /// All children must match.
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
    /// The child must not match. Legal only at the top level or as a
    /// direct child of an `And` with at least one positive sibling.
    Not(Box<Filter>),
}

/// A single `{field, op}` condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Metadata field name.
    pub field: String,
    /// The comparison applied to the field's value.
    pub op: Op,
}

/// Comparison operators.
///
/// A type mismatch between the operand and the indexed values makes the
/// leaf evaluate to the empty set; it never fails the whole query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Field equals the value.
    Equals(MetadataValue),
    /// Field differs from the value (complement against the universe).
    NotEquals(MetadataValue),
    /// Field equals any of the values.
    OneOf(Vec<MetadataValue>),
    /// Field is within the inclusive range `[low, high]`.
    Between(MetadataValue, MetadataValue),
    /// Field is strictly greater than the value.
    GreaterThan(MetadataValue),
    /// Field is greater than or equal to the value.
    GreaterEqual(MetadataValue),
    /// Field is strictly less than the value.
    LessThan(MetadataValue),
    /// Field is less than or equal to the value.
    LessEqual(MetadataValue),
    /// Array field contains the value as an element.
    Contains(MetadataValue),
    /// Field is present with any non-null value.
    Exists,
}

impl Filter {
    /// Builds an equality leaf.
    pub fn equals(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::Equals(value.into()),
        })
    }

    /// Builds a not-equals leaf.
    pub fn not_equals(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::NotEquals(value.into()),
        })
    }

    /// Builds a one-of leaf.
    pub fn one_of(field: impl Into<String>, values: Vec<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::OneOf(values),
        })
    }

    /// Builds an inclusive range leaf.
    pub fn between(
        field: impl Into<String>,
        low: impl Into<MetadataValue>,
        high: impl Into<MetadataValue>,
    ) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::Between(low.into(), high.into()),
        })
    }

    /// Builds a greater-than leaf.
    pub fn greater_than(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::GreaterThan(value.into()),
        })
    }

    /// Builds a greater-or-equal leaf.
    pub fn greater_equal(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::GreaterEqual(value.into()),
        })
    }

    /// Builds a less-than leaf.
    pub fn less_than(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::LessThan(value.into()),
        })
    }

    /// Builds a less-or-equal leaf.
    pub fn less_equal(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::LessEqual(value.into()),
        })
    }

    /// Builds an array-contains leaf.
    pub fn contains(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::Contains(value.into()),
        })
    }

    /// Builds an exists leaf.
    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Leaf(Leaf {
            field: field.into(),
            op: Op::Exists,
        })
    }

    /// Builds a conjunction.
    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And(children)
    }

    /// Builds a disjunction.
    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or(children)
    }

    /// Builds a negation.
    pub fn not(child: Filter) -> Self {
        Filter::Not(Box::new(child))
    }

    /// Validates the tree structure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPredicate` when:
    /// - an `And` or `Or` has no children,
    /// - a `Not` appears below an `Or` or nested in another `Not`,
    /// - an `And` consists solely of `Not` children below the top level.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(true)
    }

    fn validate_at(&self, top: bool) -> Result<()> {
        match self {
            Filter::Leaf(leaf) => leaf.validate(),
            Filter::And(children) => {
                if children.is_empty() {
                    return Err(QueryError::invalid_predicate("empty `and`").into());
                }
                let positives = children
                    .iter()
                    .filter(|c| !matches!(c, Filter::Not(_)))
                    .count();
                if positives == 0 && !top {
                    return Err(QueryError::invalid_predicate(
                        "`and` of only `not` children is allowed only at the top level",
                    )
                    .into());
                }
                for child in children {
                    match child {
                        Filter::Not(inner) => inner.validate_at(false)?,
                        other => other.validate_at(false)?,
                    }
                }
                Ok(())
            }
            Filter::Or(children) => {
                if children.is_empty() {
                    return Err(QueryError::invalid_predicate("empty `or`").into());
                }
                for child in children {
                    if matches!(child, Filter::Not(_)) {
                        return Err(QueryError::invalid_predicate(
                            "`not` is allowed only at the top level or directly under `and`",
                        )
                        .into());
                    }
                    child.validate_at(false)?;
                }
                Ok(())
            }
            Filter::Not(inner) => {
                if !top {
                    return Err(QueryError::invalid_predicate(
                        "`not` is allowed only at the top level or directly under `and`",
                    )
                    .into());
                }
                if matches!(inner.as_ref(), Filter::Not(_)) {
                    return Err(QueryError::invalid_predicate("`not` may not nest").into());
                }
                inner.validate_at(false)
            }
        }
    }

    /// Evaluates the filter directly against a metadata map.
    ///
    /// This is the semantic reference for the index: for every entity and
    /// every valid filter, the id is in `ids_for_filter` iff `matches`
    /// returns true on the entity's metadata.
    pub fn matches(&self, metadata: &MetadataMap) -> bool {
        match self {
            Filter::Leaf(leaf) => leaf.matches(metadata),
            Filter::And(children) => children.iter().all(|c| c.matches(metadata)),
            Filter::Or(children) => children.iter().any(|c| c.matches(metadata)),
            Filter::Not(inner) => !inner.matches(metadata),
        }
    }

    /// Visits every leaf in the tree.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Leaf)) {
        match self {
            Filter::Leaf(leaf) => f(leaf),
            Filter::And(children) | Filter::Or(children) => {
                for child in children {
                    child.for_each_leaf(f);
                }
            }
            Filter::Not(inner) => inner.for_each_leaf(f),
        }
    }
}

impl Leaf {
    fn validate(&self) -> Result<()> {
        if self.field.is_empty() {
            return Err(QueryError::invalid_predicate("empty field name").into());
        }
        if let Op::OneOf(values) = &self.op {
            if values.is_empty() {
                return Err(QueryError::invalid_predicate("`one_of` with no values").into());
            }
        }
        Ok(())
    }

    /// Evaluates this leaf against a metadata map.
    pub fn matches(&self, metadata: &MetadataMap) -> bool {
        let value = metadata.get(&self.field);
        match &self.op {
            Op::Exists => value.is_some_and(|v| !matches!(v, MetadataValue::Null)),
            Op::Equals(operand) => value.is_some_and(|v| scalar_eq(v, operand)),
            Op::NotEquals(operand) => !value.is_some_and(|v| scalar_eq(v, operand)),
            Op::OneOf(operands) => {
                value.is_some_and(|v| operands.iter().any(|o| scalar_eq(v, o)))
            }
            Op::Contains(operand) => match value {
                Some(MetadataValue::Array(items)) => {
                    items.iter().any(|item| scalar_eq(item, operand))
                }
                _ => false,
            },
            Op::Between(low, high) => cmp_ok(value, low, |ord| ord >= std::cmp::Ordering::Equal)
                && cmp_ok(value, high, |ord| ord <= std::cmp::Ordering::Equal),
            Op::GreaterThan(operand) => cmp_ok(value, operand, |ord| ord == std::cmp::Ordering::Greater),
            Op::GreaterEqual(operand) => cmp_ok(value, operand, |ord| ord != std::cmp::Ordering::Less),
            Op::LessThan(operand) => cmp_ok(value, operand, |ord| ord == std::cmp::Ordering::Less),
            Op::LessEqual(operand) => cmp_ok(value, operand, |ord| ord != std::cmp::Ordering::Greater),
        }
    }
}

/// Scalar equality with numeric widening (Int 3 equals Float 3.0).
fn scalar_eq(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered comparison of a field value against an operand.
///
/// Returns false (never matches) when the value is absent or the two
/// sides are not of a comparable type.
fn cmp_ok(
    value: Option<&MetadataValue>,
    operand: &MetadataValue,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let Some(value) = value else {
        return false;
    };
    match compare_scalars(value, operand) {
        Some(ord) => accept(ord),
        None => false,
    }
}

/// Compares scalars of compatible types: numbers numerically, strings
/// lexicographically, booleans as 0/1. Cross-type comparison and NaN
/// operands yield None (never match).
pub(crate) fn compare_scalars(a: &MetadataValue, b: &MetadataValue) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (MetadataValue::Str(x), MetadataValue::Str(y)) => Some(x.cmp(y)),
        (MetadataValue::Bool(x), MetadataValue::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}
