use serde::{Deserialize, Serialize};

use crate::record::EntityRecord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    StrongIdentifier,
    WeakIdentifier,
    /// Weak-only record whose key equals the strong record's key or one of its aliases.
    DerivedKey,
}

impl MatchReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongIdentifier => "strong_identifier",
            Self::WeakIdentifier => "weak_identifier",
            Self::DerivedKey => "derived_key",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    KindMismatch,
    ScopeMismatch,
    StrongConflict,
    NoSharedIdentifier,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KindMismatch => "kind_mismatch",
            Self::ScopeMismatch => "scope_mismatch",
            Self::StrongConflict => "strong_conflict",
            Self::NoSharedIdentifier => "no_shared_identifier",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum MatchDecision {
    Match(MatchReason),
    Reject(RejectReason),
}

impl MatchDecision {
    #[must_use]
    pub fn is_match(self) -> bool {
        matches!(self, Self::Match(_))
    }
}

/// Decide whether `a` and `b` describe the same real-world entity.
///
/// Symmetric in its arguments. Two differing strong identifiers always reject,
/// whatever the weak identifiers say.
#[must_use]
pub fn can_reconcile(a: &EntityRecord, b: &EntityRecord) -> MatchDecision {
    if a.kind() != b.kind() {
        return MatchDecision::Reject(RejectReason::KindMismatch);
    }
    if !a.namespace.same_as(&b.namespace) {
        return MatchDecision::Reject(RejectReason::ScopeMismatch);
    }

    if let (Some(left), Some(right)) = (a.identity.strong(), b.identity.strong()) {
        return if same_identifier(left, right) {
            MatchDecision::Match(MatchReason::StrongIdentifier)
        } else {
            MatchDecision::Reject(RejectReason::StrongConflict)
        };
    }

    if let (Some(left), Some(right)) = (a.identity.weak(), b.identity.weak()) {
        if same_identifier(left, right) {
            return MatchDecision::Match(MatchReason::WeakIdentifier);
        }
    }

    if key_links(a, b) || key_links(b, a) {
        return MatchDecision::Match(MatchReason::DerivedKey);
    }

    MatchDecision::Reject(RejectReason::NoSharedIdentifier)
}

fn same_identifier(left: &str, right: &str) -> bool {
    left.trim().to_lowercase() == right.trim().to_lowercase()
}

fn key_links(strong: &EntityRecord, weak: &EntityRecord) -> bool {
    strong.identity.only_strong()
        && weak.identity.only_weak()
        && (weak.key == strong.key || strong.key_aliases.contains(&weak.key))
}
