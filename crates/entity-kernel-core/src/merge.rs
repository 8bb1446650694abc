use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{entry_key, Entry, FieldValue};
use crate::schema::{KindSchema, LatticeOrder, MergePolicy};

/// A lattice field that moved during a merge.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LatticeTransition {
    pub field: String,
    pub order: LatticeOrder,
    pub previous: Option<String>,
    pub current: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The field is not part of the kind schema.
    UnknownField,
    /// Visiting value has a shape the field's policy cannot merge.
    ShapeMismatch { expected: String, found: String },
    /// Lattice values with no order between them.
    Incomparable { existing: String, visiting: String },
}

impl SkipReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownField => "unknown_field",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Incomparable { .. } => "incomparable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedField {
    pub field: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub changed: Vec<String>,
    pub transitions: Vec<LatticeTransition>,
    pub skipped: Vec<SkippedField>,
}

impl MergeReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }

    fn skip(&mut self, field: &str, reason: SkipReason) {
        warn!(field, reason = reason.as_str(), "merge policy violation; field skipped");
        self.skipped.push(SkippedField { field: field.to_string(), reason });
    }
}

/// Fold `visiting` into `existing` field by field under the kind's policies.
///
/// Only fields the visiting side carries are touched. A field that cannot be
/// merged is skipped and reported; the remaining fields still merge.
pub fn merge_fields(
    existing: &mut BTreeMap<String, FieldValue>,
    visiting: &BTreeMap<String, FieldValue>,
    schema: &KindSchema,
) -> MergeReport {
    let mut report = MergeReport::default();

    for (name, incoming) in visiting {
        let Some(spec) = schema.spec(name) else {
            report.skip(name, SkipReason::UnknownField);
            continue;
        };
        if !spec.policy.accepts(incoming) {
            report.skip(
                name,
                SkipReason::ShapeMismatch {
                    expected: spec.policy.expected_shape().to_string(),
                    found: incoming.shape().to_string(),
                },
            );
            continue;
        }

        let changed = match (&spec.policy, incoming) {
            (MergePolicy::ScalarPreserveBlank, value) => {
                !value.is_blank() && replace_if_different(existing, name, value)
            }
            (MergePolicy::ScalarOverwrite, value) => replace_if_different(existing, name, value),
            (MergePolicy::ListUnionDedup, FieldValue::List(values)) => {
                match existing.get_mut(name) {
                    Some(FieldValue::List(current)) => union_dedup(current, values),
                    _ => {
                        let mut fresh = Vec::with_capacity(values.len());
                        union_dedup(&mut fresh, values);
                        existing.insert(name.clone(), FieldValue::List(fresh));
                        true
                    }
                }
            }
            (MergePolicy::Lattice { order }, FieldValue::Text(value)) => {
                match merge_lattice(existing, name, *order, value) {
                    Ok(transition) => {
                        let moved = transition.is_some();
                        report.transitions.extend(transition);
                        moved
                    }
                    Err(reason) => {
                        report.skip(name, reason);
                        continue;
                    }
                }
            }
            (MergePolicy::BoundedFifo { cap, key_fields }, FieldValue::Entries(entries)) => {
                let key = |entry: &Entry| entry_key(entry, key_fields);
                match existing.get_mut(name) {
                    Some(FieldValue::Entries(current)) => merge_bounded(current, entries, *cap, key),
                    _ => {
                        let mut fresh = Vec::with_capacity(entries.len().min(*cap));
                        merge_bounded(&mut fresh, entries, *cap, key);
                        existing.insert(name.clone(), FieldValue::Entries(fresh));
                        true
                    }
                }
            }
            // `accepts` already matched shape to policy.
            _ => false,
        };

        if changed {
            report.changed.push(name.clone());
        }
    }

    report
}

fn replace_if_different(
    existing: &mut BTreeMap<String, FieldValue>,
    name: &str,
    value: &FieldValue,
) -> bool {
    if existing.get(name) == Some(value) {
        return false;
    }
    existing.insert(name.to_string(), value.clone());
    true
}

fn merge_lattice(
    existing: &mut BTreeMap<String, FieldValue>,
    name: &str,
    order: LatticeOrder,
    visiting: &str,
) -> Result<Option<LatticeTransition>, SkipReason> {
    let current = existing.get(name).and_then(FieldValue::as_text).map(str::to_string);
    let advance = match current.as_deref() {
        None => order.rank(visiting).is_some(),
        Some(current) => match order.compare(current, visiting) {
            Some(Ordering::Less) => true,
            Some(Ordering::Equal | Ordering::Greater) => false,
            None => {
                return Err(SkipReason::Incomparable {
                    existing: current.to_string(),
                    visiting: visiting.to_string(),
                })
            }
        },
    };
    if current.is_none() && !advance {
        return Err(SkipReason::Incomparable {
            existing: String::new(),
            visiting: visiting.to_string(),
        });
    }
    if !advance {
        return Ok(None);
    }

    existing.insert(name.to_string(), FieldValue::text(visiting));
    Ok(Some(LatticeTransition {
        field: name.to_string(),
        order,
        previous: current,
        current: visiting.to_string(),
    }))
}

/// Append `visiting` elements not already present, keeping insertion order.
/// Returns whether `existing` grew.
pub fn union_dedup<T: Clone + PartialEq>(existing: &mut Vec<T>, visiting: &[T]) -> bool {
    let before = existing.len();
    for value in visiting {
        if !existing.contains(value) {
            existing.push(value.clone());
        }
    }
    existing.len() != before
}

/// Merge into a list capped at `cap` whose elements are identified by `key`.
///
/// The visiting list is first reduced to its last `cap` distinct-keyed
/// elements. Each replaces a same-keyed element of `existing` and moves to
/// the tail, or is appended. The oldest elements are then dropped until the
/// list fits. Replaying the same visiting list is a no-op.
pub fn merge_bounded<T, K, F>(existing: &mut Vec<T>, visiting: &[T], cap: usize, key: F) -> bool
where
    T: Clone + PartialEq,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut recent: Vec<&T> = Vec::with_capacity(visiting.len().min(cap));
    let mut seen: Vec<K> = Vec::with_capacity(recent.capacity());
    for value in visiting.iter().rev() {
        if recent.len() == cap {
            break;
        }
        let value_key = key(value);
        if seen.contains(&value_key) {
            continue;
        }
        seen.push(value_key);
        recent.push(value);
    }
    recent.reverse();

    let before = existing.clone();
    for value in recent {
        let value_key = key(value);
        if let Some(position) = existing.iter().position(|current| key(current) == value_key) {
            existing.remove(position);
        }
        existing.push(value.clone());
    }
    if existing.len() > cap {
        let overflow = existing.len() - cap;
        existing.drain(..overflow);
    }

    *existing != before
}
