//! Entity reconciliation kernel.
//!
//! Records about the same real-world entity (a host, a directory user, a web
//! page, a job) arrive repeatedly from independent discovery sources. This
//! crate derives canonical keys for them, decides whether two observations
//! denote the same entity, and folds a visiting observation into the existing
//! record under per-field merge policies.
//!
//! The crate is pure: no I/O, no locks. Persistence and write atomicity live
//! in the store crate.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod engine;
pub mod identity;
pub mod key;
pub mod matcher;
pub mod merge;
pub mod record;
pub mod schema;

pub use engine::{EngineConfig, ReconciliationEngine, VisitOutcome, KEY_HISTORY_FIELD};
pub use identity::{EntityKind, IdentifierStrength, Identity, Namespace, ScopeStyle};
pub use key::{
    CanonicalKey, KeyDeriver, KeyError, TruncationStrategy, DEFAULT_MAX_KEY_LENGTH,
    MAX_MAX_KEY_LENGTH, MIN_MAX_KEY_LENGTH,
};
pub use matcher::{can_reconcile, MatchDecision, MatchReason, RejectReason};
pub use merge::{merge_fields, LatticeTransition, MergeReport, SkipReason, SkippedField};
pub use record::{
    build_record, DefaultedDraft, Entry, EntityRecord, FieldValue, HistoryEntry, RecordDraft,
    ValidatedDraft,
};
pub use schema::{FieldSpec, KindRegistry, KindSchema, LatticeOrder, MergePolicy, RegistryError};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("key derivation failed: {0}")]
    Key(#[from] KeyError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Stable identity of one catalog entry, independent of its canonical key.
///
/// The key may change when a record is promoted; the record id never does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
