use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use entity_kernel_core::{
    CanonicalKey, EngineConfig, EntityRecord, Identity, KindRegistry, MergeReport, Namespace,
    ReconciliationEngine, RecordDraft, RegistryError, SkippedField, VisitOutcome,
};
use entity_kernel_store_sqlite::{
    ExpectedVersion, ExportManifest, ImportSummary, IntegrityReport, PurgeSummary, PutOutcome,
    SchemaStatus, SqliteStore, StoredRecord,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

/// Conflicts a caller may want to tell apart from plain failures.
///
/// Returned inside `anyhow::Error`; use `downcast_ref::<ApiError>()`.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApiError {
    #[error("promoted key {key} already names another record (previous key {previous_key})")]
    PromotionConflict { key: CanonicalKey, previous_key: CanonicalKey },
    #[error("key {key} is occupied by a record that does not match the observation")]
    KeyCollision { key: CanonicalKey },
    #[error("write for {key} still conflicted after {attempts} attempts")]
    RetriesExhausted { key: CanonicalKey, attempts: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub engine: EngineConfig,
    pub max_write_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { engine: EngineConfig::default(), max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS }
    }
}

impl ApiConfig {
    /// # Errors
    /// Returns an error when any bound is out of range.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.max_write_attempts == 0 {
            return Err(anyhow!("max_write_attempts MUST be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObserveOutcome {
    Created,
    Merged,
    MergedWithPromotion,
    /// Matched a stored record that already reflected the observation.
    Unchanged,
}

impl ObserveOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Merged => "merged",
            Self::MergedWithPromotion => "merged_with_promotion",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObserveResult {
    pub outcome: ObserveOutcome,
    pub key: CanonicalKey,
    pub previous_key: Option<CanonicalKey>,
    pub version: i64,
    pub attempts: u32,
    pub changed: Vec<String>,
    pub skipped: Vec<SkippedField>,
    pub record: EntityRecord,
}

enum Attempt {
    Done(Box<ObserveResult>),
    Conflict { key: CanonicalKey, current: Option<i64> },
}

/// Entry point tying the engine to a `SQLite` store.
#[derive(Debug, Clone)]
pub struct ReconciliationApi {
    db_path: PathBuf,
    registry: Arc<KindRegistry>,
    config: ApiConfig,
}

impl ReconciliationApi {
    /// # Errors
    /// Returns an error when `config` fails validation.
    pub fn new(db_path: PathBuf, registry: Arc<KindRegistry>, config: ApiConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { db_path, registry, config })
    }

    #[must_use]
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn engine(&self) -> Result<ReconciliationEngine<'_>> {
        Ok(ReconciliationEngine::new(&self.registry, &self.config.engine)?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Derive the canonical key for an identity without touching the store.
    ///
    /// # Errors
    /// Returns an error for an unknown kind label, an invalid scope, or a
    /// missing identifier.
    pub fn derive_key(
        &self,
        label: &str,
        scope: &str,
        strong: Option<&str>,
        weak: Option<&str>,
    ) -> Result<CanonicalKey> {
        let schema = self
            .registry
            .resolve_label(label)
            .ok_or_else(|| RegistryError::UnknownKind(label.to_string()))?;
        let namespace = Namespace::new(schema.kind, scope)?;
        let identity = Identity::new(strong, weak);
        Ok(self.engine()?.derive_key(&namespace, &identity)?)
    }

    /// Reconcile one observation against the store and persist the result.
    ///
    /// # Errors
    /// Returns an error when the draft is invalid (before any write), when
    /// persistence fails, or an [`ApiError`] for key conflicts and exhausted
    /// retries.
    #[instrument(skip(self, draft), fields(kind = %draft.kind, scope = %draft.scope))]
    pub fn observe(&self, draft: RecordDraft) -> Result<ObserveResult> {
        let engine = self.engine()?;
        let visiting = engine.build_record(draft, OffsetDateTime::now_utc())?;

        let mut candidates = vec![visiting.key.clone()];
        if visiting.identity.strong().is_some() {
            candidates.extend(engine.weak_key(&visiting)?);
        }

        let mut store = self.open_migrated_store()?;
        for attempt in 1..=self.config.max_write_attempts {
            match observe_once(&engine, &mut store, &visiting, &candidates)? {
                Attempt::Done(mut result) => {
                    result.attempts = attempt;
                    return Ok(*result);
                }
                Attempt::Conflict { key, current } => {
                    warn!(%key, ?current, attempt, "version conflict while observing; retrying");
                }
            }
        }

        Err(ApiError::RetriesExhausted {
            key: visiting.key,
            attempts: self.config.max_write_attempts,
        }
        .into())
    }

    /// Load a record by key, following key aliases.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let store = self.open_migrated_store()?;
        store.resolve(&CanonicalKey::from_stored(key))
    }

    /// # Errors
    /// Returns an error when records cannot be read.
    pub fn list(&self) -> Result<Vec<StoredRecord>> {
        let store = self.open_migrated_store()?;
        store.list()
    }

    /// # Errors
    /// Returns an error when the purge fails.
    #[instrument(skip(self))]
    pub fn purge_expired(&self, now: OffsetDateTime) -> Result<PurgeSummary> {
        let mut store = self.open_migrated_store()?;
        let summary = store.purge_expired(now)?;
        if summary.purged_records > 0 {
            info!(purged_records = summary.purged_records, "expired records purged");
        }
        Ok(summary)
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        let store = self.open_migrated_store()?;
        store.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when verification or import fails.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when an integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated_store()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the restore or the follow-up migration fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }
}

fn write_merge(
    store: &mut SqliteStore,
    stored: &StoredRecord,
    record: EntityRecord,
    report: MergeReport,
) -> Result<Attempt> {
    if record == stored.record {
        return Ok(done(ObserveOutcome::Unchanged, None, stored.version, report, record));
    }
    match store.conditional_put(&record, ExpectedVersion::Exact(stored.version))? {
        PutOutcome::Written { version } => Ok(done(ObserveOutcome::Merged, None, version, report, record)),
        PutOutcome::VersionConflict { current } => Ok(Attempt::Conflict { key: record.key, current }),
        PutOutcome::KeyTaken { key } => {
            Err(anyhow!("unexpected key conflict on in-place write for {key}"))
        }
    }
}

/// Move `stored` to the promoted key. A stale snapshot, including one whose
/// row a concurrent writer already promoted, comes back as a conflict to retry.
fn write_promotion(
    store: &mut SqliteStore,
    stored: &StoredRecord,
    record: EntityRecord,
    previous_key: CanonicalKey,
    report: MergeReport,
) -> Result<Attempt> {
    match store.promote(&previous_key, stored.version, &record)? {
        PutOutcome::Written { version } => {
            info!(key = %record.key, previous_key = %previous_key, version, "record key promoted");
            Ok(done(ObserveOutcome::MergedWithPromotion, Some(previous_key), version, report, record))
        }
        PutOutcome::VersionConflict { current } => Ok(Attempt::Conflict { key: previous_key, current }),
        PutOutcome::KeyTaken { key } => Err(ApiError::PromotionConflict { key, previous_key }.into()),
    }
}

fn observe_once(
    engine: &ReconciliationEngine<'_>,
    store: &mut SqliteStore,
    visiting: &EntityRecord,
    candidates: &[CanonicalKey],
) -> Result<Attempt> {
    let mut visited: Vec<CanonicalKey> = Vec::new();
    let mut primary_rejected = false;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(stored) = store.resolve(candidate)? else {
            continue;
        };
        if visited.contains(&stored.record.key) {
            continue;
        }
        visited.push(stored.record.key.clone());

        let mut record = stored.record.clone();
        match engine.visit(&mut record, visiting)? {
            VisitOutcome::Rejected { reason } => {
                // Only a record that owns the key blocks its creation; a
                // rejecting alias target just stops naming it.
                let owns_key = stored.record.key == *candidate;
                debug!(candidate = %candidate, reason = reason.as_str(), owns_key, "candidate rejected");
                primary_rejected |= index == 0 && owns_key;
            }
            VisitOutcome::Merged { report } => {
                return write_merge(store, &stored, record, report);
            }
            VisitOutcome::MergedWithPromotion { report, previous_key } => {
                return write_promotion(store, &stored, record, previous_key, report);
            }
        }
    }

    if primary_rejected {
        warn!(key = %visiting.key, "key occupied by a non-matching record");
        return Err(ApiError::KeyCollision { key: visiting.key.clone() }.into());
    }

    match store.conditional_put(visiting, ExpectedVersion::Absent)? {
        PutOutcome::Written { version } => Ok(Attempt::Done(Box::new(ObserveResult {
            outcome: ObserveOutcome::Created,
            key: visiting.key.clone(),
            previous_key: None,
            version,
            attempts: 0,
            changed: visiting.fields.keys().cloned().collect(),
            skipped: Vec::new(),
            record: visiting.clone(),
        }))),
        // Someone created the key since the lookup; the retry will visit it.
        PutOutcome::VersionConflict { current } => {
            Ok(Attempt::Conflict { key: visiting.key.clone(), current })
        }
        PutOutcome::KeyTaken { key } => Err(anyhow!("unexpected key conflict on insert for {key}")),
    }
}

fn done(
    outcome: ObserveOutcome,
    previous_key: Option<CanonicalKey>,
    version: i64,
    report: MergeReport,
    record: EntityRecord,
) -> Attempt {
    Attempt::Done(Box::new(ObserveResult {
        outcome,
        key: record.key.clone(),
        previous_key,
        version,
        attempts: 0,
        changed: report.changed,
        skipped: report.skipped,
        record,
    }))
}
