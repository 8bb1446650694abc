use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use entity_kernel_core::{CanonicalKey, EntityRecord};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

const LATEST_SCHEMA_VERSION: i64 = 2;

const RECORDS_FILE: &str = "entity_records.ndjson";
const ALIASES_FILE: &str = "key_aliases.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entity_records (
  record_key TEXT PRIMARY KEY,
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('asset','ad_user','ad_group','ad_computer','web_page','job','attribute','organization','person')),
  scope TEXT NOT NULL CHECK (length(scope) > 0),
  strong_id TEXT,
  weak_id TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  last_visited_at TEXT NOT NULL,
  expires_at INTEGER,
  record_json TEXT NOT NULL,
  CHECK (strong_id IS NOT NULL OR weak_id IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_entity_records_namespace ON entity_records(kind, scope);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS key_aliases (
  alias_key TEXT PRIMARY KEY,
  record_key TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (record_key) REFERENCES entity_records(record_key)
    ON UPDATE CASCADE ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_key_aliases_record_key ON key_aliases(record_key);
CREATE INDEX IF NOT EXISTS idx_entity_records_expires_at ON entity_records(expires_at);
";

const INSERT_RECORD_SQL: &str = "INSERT INTO entity_records(
    record_key, record_id, kind, scope, strong_id, weak_id, version,
    created_at, last_visited_at, expires_at, record_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(record_key) DO NOTHING";

const UPDATE_RECORD_SQL: &str = "UPDATE entity_records SET
    record_key = ?1, record_id = ?2, kind = ?3, scope = ?4, strong_id = ?5, weak_id = ?6,
    version = version + 1, created_at = ?7, last_visited_at = ?8, expires_at = ?9,
    record_json = ?10
WHERE record_key = ?11 AND version = ?12";

const UPSERT_ALIAS_SQL: &str = "INSERT INTO key_aliases(alias_key, record_key, created_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(alias_key) DO UPDATE SET record_key = excluded.record_key";

pub struct SqliteStore {
    conn: Connection,
}

/// A record as persisted, with its optimistic-concurrency version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: i64,
    pub record: EntityRecord,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The key must be free.
    Absent,
    /// The stored row must be at exactly this version.
    Exact(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PutOutcome {
    Written { version: i64 },
    /// The precondition did not hold. `current` is the stored version, if any.
    VersionConflict { current: Option<i64> },
    /// A promotion target key already names another record.
    KeyTaken { key: CanonicalKey },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyAlias {
    pub alias_key: CanonicalKey,
    pub record_key: CanonicalKey,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeSummary {
    pub purged_records: usize,
    pub purged_aliases: usize,
    pub purged_keys: Vec<CanonicalKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub imported_aliases: usize,
    pub skipped_existing_aliases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Rows whose stored document names a different key than the row.
    pub document_key_mismatches: Vec<String>,
    pub schema_status: SchemaStatus,
}

/// Indexed columns derived from a record document.
struct RecordColumns {
    key: String,
    record_id: String,
    kind: &'static str,
    scope: String,
    strong_id: Option<String>,
    weak_id: Option<String>,
    created_at: String,
    last_visited_at: String,
    expires_at: Option<i64>,
    record_json: String,
}

impl RecordColumns {
    fn from_record(record: &EntityRecord) -> Result<Self> {
        Ok(Self {
            key: record.key.as_str().to_string(),
            record_id: record.record_id.to_string(),
            kind: record.kind().as_str(),
            scope: record.namespace.scope.clone(),
            strong_id: record.identity.strong().map(str::to_string),
            weak_id: record.identity.weak().map(str::to_string),
            created_at: rfc3339(record.created_at)?,
            last_visited_at: rfc3339(record.last_visited_at)?,
            expires_at: record.expires_at().map(OffsetDateTime::unix_timestamp),
            record_json: serde_json::to_string(record).context("failed to serialize entity record")?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed entity store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "entity_records")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "entity_records", "record_json")? {
            return Err(anyhow!("database schema is invalid: entity_records has no record_json column"));
        }

        // Tables exist but the migration ledger is empty.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "key_aliases")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create key_aliases table")?;

        // Records written before v2 carry their aliases only inside the document.
        let documents = {
            let mut stmt = tx.prepare(
                "SELECT record_key, record_json FROM entity_records ORDER BY record_key ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read entity records for alias backfill")?
        };

        let now = now_rfc3339()?;
        for (record_key, json) in documents {
            let record: EntityRecord = serde_json::from_str(&json)
                .with_context(|| format!("failed to decode stored record {record_key}"))?;
            for alias in &record.key_aliases {
                if alias.as_str() == record_key {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO key_aliases(alias_key, record_key, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![alias.as_str(), record_key, now],
                )
                .with_context(|| format!("failed to backfill alias {alias}"))?;
            }
        }

        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Load the record stored under exactly `key`.
    ///
    /// # Errors
    /// Returns an error when the lookup or document decoding fails.
    pub fn get(&self, key: &CanonicalKey) -> Result<Option<StoredRecord>> {
        load_record(&self.conn, key.as_str())
    }

    /// Load the record named by `key`, following a key alias when no record
    /// uses `key` as its primary key.
    ///
    /// # Errors
    /// Returns an error when either lookup fails.
    pub fn resolve(&self, key: &CanonicalKey) -> Result<Option<StoredRecord>> {
        if let Some(found) = self.get(key)? {
            return Ok(Some(found));
        }
        let target = self
            .conn
            .query_row(
                "SELECT record_key FROM key_aliases WHERE alias_key = ?1",
                params![key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up key alias {key}"))?;

        match target {
            Some(target) => load_record(&self.conn, &target),
            None => Ok(None),
        }
    }

    /// Version-checked write of `record` under its own key.
    ///
    /// # Errors
    /// Returns an error when serialization or the write itself fails; an
    /// unmet precondition is reported as [`PutOutcome::VersionConflict`].
    pub fn conditional_put(
        &mut self,
        record: &EntityRecord,
        expected: ExpectedVersion,
    ) -> Result<PutOutcome> {
        let columns = RecordColumns::from_record(record)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let written = match expected {
            ExpectedVersion::Absent => {
                let inserted = tx
                    .execute(
                        INSERT_RECORD_SQL,
                        params![
                            columns.key,
                            columns.record_id,
                            columns.kind,
                            columns.scope,
                            columns.strong_id,
                            columns.weak_id,
                            1_i64,
                            columns.created_at,
                            columns.last_visited_at,
                            columns.expires_at,
                            columns.record_json,
                        ],
                    )
                    .context("failed to insert entity record")?;
                if inserted == 1 {
                    // A live row takes precedence over an alias with its key.
                    tx.execute("DELETE FROM key_aliases WHERE alias_key = ?1", params![columns.key])
                        .context("failed to clear alias shadowing the new key")?;
                }
                (inserted == 1).then_some(1)
            }
            ExpectedVersion::Exact(version) => {
                let updated = update_record(&tx, &columns, &columns.key, version)?;
                (updated == 1).then_some(version + 1)
            }
        };

        let Some(version) = written else {
            let current = stored_version(&tx, &columns.key)?;
            debug!(key = %record.key, ?expected, ?current, "conditional put rejected");
            return Ok(PutOutcome::VersionConflict { current });
        };

        sync_aliases(&tx, record)?;
        tx.commit().context("failed to commit write transaction")?;
        debug!(key = %record.key, version, "entity record written");
        Ok(PutOutcome::Written { version })
    }

    /// Move the record stored at `previous_key` to `record.key` in one
    /// transaction. Aliases that pointed at the old key follow the row, and the
    /// old key itself becomes an alias of the new one.
    ///
    /// The version precondition is checked before the target key: a stale
    /// promotion whose row has already moved reports
    /// [`PutOutcome::VersionConflict`], and only a different record sitting
    /// at the target reports [`PutOutcome::KeyTaken`].
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction fails.
    pub fn promote(
        &mut self,
        previous_key: &CanonicalKey,
        expected_version: i64,
        record: &EntityRecord,
    ) -> Result<PutOutcome> {
        let columns = RecordColumns::from_record(record)?;
        let tx = self.conn.transaction().context("failed to start promotion transaction")?;

        let current = stored_version(&tx, previous_key.as_str())?;
        if current != Some(expected_version) {
            debug!(previous_key = %previous_key, expected_version, ?current, "promotion rejected");
            return Ok(PutOutcome::VersionConflict { current });
        }

        if record.key != *previous_key {
            if let Some((occupant_id, occupant_version)) = stored_owner(&tx, &columns.key)? {
                if occupant_id == columns.record_id {
                    debug!(key = %record.key, occupant_version, "promotion target already holds this record");
                    return Ok(PutOutcome::VersionConflict { current: Some(occupant_version) });
                }
                debug!(key = %record.key, previous_key = %previous_key, "promotion target taken");
                return Ok(PutOutcome::KeyTaken { key: record.key.clone() });
            }
        }

        tx.execute("DELETE FROM key_aliases WHERE alias_key = ?1", params![columns.key])
            .context("failed to clear alias shadowing the promoted key")?;

        let updated = update_record(&tx, &columns, previous_key.as_str(), expected_version)?;
        if updated == 0 {
            let current = stored_version(&tx, previous_key.as_str())?;
            return Ok(PutOutcome::VersionConflict { current });
        }

        sync_aliases(&tx, record)?;
        if record.key != *previous_key {
            tx.execute(UPSERT_ALIAS_SQL, params![previous_key.as_str(), columns.key, now_rfc3339()?])
                .context("failed to record key alias")?;
        }
        tx.commit().context("failed to commit promotion transaction")?;

        let version = expected_version + 1;
        debug!(key = %record.key, previous_key = %previous_key, version, "entity record promoted");
        Ok(PutOutcome::Written { version })
    }

    /// Load every stored record ordered by key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list(&self) -> Result<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT version, record_json FROM entity_records ORDER BY record_key ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut records = Vec::new();
        for row in rows {
            let (version, json) = row?;
            records.push(decode_record(version, &json)?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when alias rows cannot be read.
    pub fn list_aliases(&self) -> Result<Vec<KeyAlias>> {
        let mut stmt = self.conn.prepare(
            "SELECT alias_key, record_key, created_at FROM key_aliases ORDER BY alias_key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut aliases = Vec::new();
        for row in rows {
            let (alias_key, record_key, created_at) = row?;
            aliases.push(KeyAlias {
                alias_key: CanonicalKey::from_stored(alias_key),
                record_key: CanonicalKey::from_stored(record_key),
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(aliases)
    }

    /// Delete every record whose `expires_at` is at or before `now`, along
    /// with the aliases pointing at it.
    ///
    /// # Errors
    /// Returns an error when the purge transaction fails.
    pub fn purge_expired(&mut self, now: OffsetDateTime) -> Result<PurgeSummary> {
        let cutoff = now.unix_timestamp();
        let tx = self.conn.transaction().context("failed to start purge transaction")?;

        let purged_keys = {
            let mut stmt = tx.prepare(
                "SELECT record_key FROM entity_records
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1
                 ORDER BY record_key ASC",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list expired records")?
        };
        let purged_aliases: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM key_aliases WHERE record_key IN (
                    SELECT record_key FROM entity_records
                    WHERE expires_at IS NOT NULL AND expires_at <= ?1
                 )",
                params![cutoff],
                |row| row.get(0),
            )
            .context("failed to count expiring aliases")?;

        let purged_records = tx
            .execute(
                "DELETE FROM entity_records WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![cutoff],
            )
            .context("failed to purge expired entity records")?;
        tx.commit().context("failed to commit purge transaction")?;

        debug!(purged_records, purged_aliases, cutoff, "expired entity records purged");
        Ok(PurgeSummary {
            purged_records,
            purged_aliases: usize::try_from(purged_aliases).unwrap_or_default(),
            purged_keys: purged_keys.into_iter().map(CanonicalKey::from_stored).collect(),
        })
    }

    /// Export records and key aliases as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list()?;
        let aliases = self.list_aliases()?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                write_ndjson_file(out_dir, RECORDS_FILE, &records)?,
                write_ndjson_file(out_dir, ALIASES_FILE, &aliases)?,
            ],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database in one transaction.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, parsing,
    /// duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let records = read_ndjson_file::<StoredRecord>(&in_dir.join(RECORDS_FILE))?;
        let aliases = read_ndjson_file::<KeyAlias>(&in_dir.join(ALIASES_FILE))?;

        let mut summary = ImportSummary::default();
        let tx = self.conn.transaction().context("failed to start import transaction")?;

        for stored in records {
            let key = stored.record.key.as_str().to_string();
            if stored_version(&tx, &key)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_records += 1;
                    continue;
                }
                return Err(anyhow!("record already exists for key {key}"));
            }
            if stored.version < 1 {
                return Err(anyhow!("record {key} has invalid version {}", stored.version));
            }

            let columns = RecordColumns::from_record(&stored.record)?;
            tx.execute(
                INSERT_RECORD_SQL,
                params![
                    columns.key,
                    columns.record_id,
                    columns.kind,
                    columns.scope,
                    columns.strong_id,
                    columns.weak_id,
                    stored.version,
                    columns.created_at,
                    columns.last_visited_at,
                    columns.expires_at,
                    columns.record_json,
                ],
            )
            .with_context(|| format!("failed to import entity record {key}"))?;
            summary.imported_records += 1;
        }

        for alias in aliases {
            let existing = tx
                .query_row(
                    "SELECT record_key FROM key_aliases WHERE alias_key = ?1",
                    params![alias.alias_key.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .context("failed to look up key alias")?;
            if existing.is_some() {
                if skip_existing {
                    summary.skipped_existing_aliases += 1;
                    continue;
                }
                return Err(anyhow!("key alias already exists: {}", alias.alias_key));
            }
            if stored_version(&tx, alias.record_key.as_str())?.is_none() {
                return Err(anyhow!(
                    "key alias {} references missing record {}",
                    alias.alias_key,
                    alias.record_key
                ));
            }

            tx.execute(
                "INSERT INTO key_aliases(alias_key, record_key, created_at) VALUES (?1, ?2, ?3)",
                params![
                    alias.alias_key.as_str(),
                    alias.record_key.as_str(),
                    rfc3339(alias.created_at)?
                ],
            )
            .with_context(|| format!("failed to import key alias {}", alias.alias_key))?;
            summary.imported_aliases += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Report `quick_check`, foreign key violations, rows whose document names
    /// another key, and the schema status.
    ///
    /// # Errors
    /// Returns an error when any of the checks cannot be run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut document_key_mismatches = Vec::new();
        if table_exists(&self.conn, "entity_records")? {
            let mut stmt = self.conn.prepare("SELECT record_key, record_json FROM entity_records")?;
            let rows =
                stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (record_key, json) = row?;
                let matches = serde_json::from_str::<EntityRecord>(&json)
                    .is_ok_and(|record| record.key.as_str() == record_key);
                if !matches {
                    document_key_mismatches.push(record_key);
                }
            }
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            document_key_mismatches,
            schema_status,
        })
    }
}

fn update_record(
    conn: &Connection,
    columns: &RecordColumns,
    current_key: &str,
    expected_version: i64,
) -> Result<usize> {
    conn.execute(
        UPDATE_RECORD_SQL,
        params![
            columns.key,
            columns.record_id,
            columns.kind,
            columns.scope,
            columns.strong_id,
            columns.weak_id,
            columns.created_at,
            columns.last_visited_at,
            columns.expires_at,
            columns.record_json,
            current_key,
            expected_version,
        ],
    )
    .with_context(|| format!("failed to update entity record {current_key}"))
}

/// Make the alias rows of `record.key` match the record's alias list. Keys
/// held by a live row are never recorded as aliases.
fn sync_aliases(conn: &Connection, record: &EntityRecord) -> Result<()> {
    let wanted: Vec<&str> = record
        .key_aliases
        .iter()
        .filter(|alias| **alias != record.key)
        .map(CanonicalKey::as_str)
        .collect();

    let mut stmt = conn
        .prepare("SELECT alias_key FROM key_aliases WHERE record_key = ?1")
        .context("failed to prepare alias lookup")?;
    let stored = stmt
        .query_map(params![record.key.as_str()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to list aliases of {}", record.key))?;

    for dropped in stored.iter().filter(|alias| !wanted.contains(&alias.as_str())) {
        conn.execute("DELETE FROM key_aliases WHERE alias_key = ?1", params![dropped])
            .with_context(|| format!("failed to drop key alias {dropped}"))?;
    }

    let now = now_rfc3339()?;
    for alias in wanted {
        if stored_version(conn, alias)?.is_some() {
            continue;
        }
        conn.execute(UPSERT_ALIAS_SQL, params![alias, record.key.as_str(), now])
            .with_context(|| format!("failed to record key alias {alias}"))?;
    }
    Ok(())
}

fn load_record(conn: &Connection, key: &str) -> Result<Option<StoredRecord>> {
    let row = conn
        .query_row(
            "SELECT version, record_json FROM entity_records WHERE record_key = ?1",
            params![key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to load entity record {key}"))?;

    row.map(|(version, json)| decode_record(version, &json)).transpose()
}

fn stored_version(conn: &Connection, key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT version FROM entity_records WHERE record_key = ?1",
        params![key],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .with_context(|| format!("failed to read version for {key}"))
}

/// Record id and version of the row stored under `key`.
fn stored_owner(conn: &Connection, key: &str) -> Result<Option<(String, i64)>> {
    conn.query_row(
        "SELECT record_id, version FROM entity_records WHERE record_key = ?1",
        params![key],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    )
    .optional()
    .with_context(|| format!("failed to read owner of {key}"))
}

fn decode_record(version: i64, json: &str) -> Result<StoredRecord> {
    let record = serde_json::from_str(json).context("failed to deserialize stored entity record")?;
    Ok(StoredRecord { version, record })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to look up table {table_name}"))?;
    Ok(found.is_some())
}

/// False for a missing table as well as a missing column.
fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        params![table, column],
        |row| row.get::<_, bool>(0),
    )
    .with_context(|| format!("failed to inspect columns of {table}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "entity_records")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "entity_records", "record_json")? {
        return Err(anyhow!("database schema is invalid: entity_records has no record_json column"));
    }

    if table_exists(conn, "key_aliases")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

/// Running SHA-256 over NDJSON lines, counting the non-blank ones.
#[derive(Default)]
struct LineDigest {
    hasher: Sha256,
    rows: usize,
}

impl LineDigest {
    fn push(&mut self, line: &str) {
        self.hasher.update(line.as_bytes());
        self.hasher.update(b"\n");
        if !line.trim().is_empty() {
            self.rows += 1;
        }
    }

    fn finish(self, file_name: &str) -> ExportFileDigest {
        ExportFileDigest {
            path: file_name.to_string(),
            sha256: format!("{:x}", self.hasher.finalize()),
            records: self.rows,
        }
    }
}

fn write_ndjson_file<T: Serialize>(
    out_dir: &Path,
    file_name: &str,
    values: &[T],
) -> Result<ExportFileDigest> {
    let path = out_dir.join(file_name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut digest = LineDigest::default();

    for value in values {
        let mut line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        digest.push(&line);
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok(digest.finish(file_name))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn digest_ndjson_file(in_dir: &Path, file_name: &str) -> Result<ExportFileDigest> {
    let path = in_dir.join(file_name);
    let file = File::open(&path)
        .with_context(|| format!("manifest references unreadable file {}", path.display()))?;
    let mut digest = LineDigest::default();
    for line in BufReader::new(file).lines() {
        digest.push(&line.with_context(|| format!("failed to read {}", path.display()))?);
    }
    Ok(digest.finish(file_name))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; expected {LATEST_SCHEMA_VERSION}",
            manifest.schema_version
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [RECORDS_FILE, ALIASES_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let actual = digest_ndjson_file(in_dir, required)?;
        if actual.sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual.sha256
            ));
        }
        if actual.records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual.records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use entity_kernel_core::{
        build_record, FieldValue, Identity, KeyDeriver, KindRegistry, RecordDraft,
    };
    use time::Duration;
    use ulid::Ulid;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_record(
        kind: &str,
        strong: Option<&str>,
        weak: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<EntityRecord> {
        let registry = KindRegistry::with_builtin_kinds()?;
        let draft = RecordDraft {
            kind: kind.to_string(),
            scope: "tenant-a".to_string(),
            strong_id: strong.map(str::to_string),
            weak_id: weak.map(str::to_string),
            fields: BTreeMap::new(),
            source: "store-test".to_string(),
            observed_at: None,
            ttl_seconds,
        };
        Ok(build_record(draft, &registry, &KeyDeriver::default(), fixture_time())?)
    }

    fn promoted(record: &EntityRecord, strong: &str) -> Result<EntityRecord> {
        let mut next = record.clone();
        next.identity = Identity::new(Some(strong), record.identity.weak());
        next.key = KeyDeriver::default().derive(&next.namespace, &next.identity)?;
        next.key_aliases.push(record.key.clone());
        Ok(next)
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    // Test IDs: ESD-001
    #[test]
    fn migrate_creates_latest_schema() -> Result<()> {
        let store = migrated_store()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 2);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: ESD-002
    #[test]
    fn schema_status_reports_pending_migration_for_unrecorded_v1() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: ESD-003
    #[test]
    fn migration_v2_backfills_aliases_from_documents() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        record_schema_version(&store.conn, 1)?;

        let weak = mk_record("asset", None, Some("db01"), None)?;
        let strong = promoted(&weak, "uuid-1")?;
        let columns = RecordColumns::from_record(&strong)?;
        store.conn.execute(
            INSERT_RECORD_SQL,
            params![
                columns.key,
                columns.record_id,
                columns.kind,
                columns.scope,
                columns.strong_id,
                columns.weak_id,
                3_i64,
                columns.created_at,
                columns.last_visited_at,
                columns.expires_at,
                columns.record_json,
            ],
        )?;

        store.migrate()?;
        assert_eq!(current_schema_version(&store.conn)?, 2);

        let resolved = store.resolve(&weak.key)?.map(|stored| (stored.version, stored.record.key));
        assert_eq!(resolved, Some((3, strong.key)));
        Ok(())
    }

    // Test IDs: ESD-004
    #[test]
    fn migrate_rejects_foreign_entity_records_table() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch("CREATE TABLE entity_records(id INTEGER PRIMARY KEY);")?;

        let Err(err) = store.migrate() else {
            return Err(anyhow!("expected migration to fail on foreign schema"));
        };
        assert!(err.to_string().contains("entity_records has no record_json column"));
        Ok(())
    }

    // Test IDs: ESD-005
    #[test]
    fn sqlite_checks_reject_unknown_kinds() -> Result<()> {
        let store = migrated_store()?;
        let result = store.conn.execute(
            INSERT_RECORD_SQL,
            params![
                "spaceship:t:x",
                Ulid::new().to_string(),
                "spaceship",
                "t",
                Option::<String>::None,
                "x",
                1_i64,
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:00:00Z",
                Option::<i64>::None,
                "{}",
            ],
        );
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: ESD-006
    #[test]
    fn conditional_put_enforces_versions() -> Result<()> {
        let mut store = migrated_store()?;
        let mut record = mk_record("job", None, Some("build-1"), None)?;

        assert_eq!(
            store.conditional_put(&record, ExpectedVersion::Absent)?,
            PutOutcome::Written { version: 1 }
        );
        assert_eq!(
            store.conditional_put(&record, ExpectedVersion::Absent)?,
            PutOutcome::VersionConflict { current: Some(1) }
        );

        record.fields.insert("status".to_string(), FieldValue::text("running"));
        assert_eq!(
            store.conditional_put(&record, ExpectedVersion::Exact(1))?,
            PutOutcome::Written { version: 2 }
        );
        assert_eq!(
            store.conditional_put(&record, ExpectedVersion::Exact(1))?,
            PutOutcome::VersionConflict { current: Some(2) }
        );

        let stored = store.get(&record.key)?.ok_or_else(|| anyhow!("record should exist"))?;
        assert_eq!(stored.version, 2);
        assert_eq!(stored.record.text("status"), Some("running"));

        let missing = mk_record("job", None, Some("build-2"), None)?;
        assert_eq!(
            store.conditional_put(&missing, ExpectedVersion::Exact(1))?,
            PutOutcome::VersionConflict { current: None }
        );
        Ok(())
    }

    // Test IDs: ESD-007
    #[test]
    fn promote_moves_row_and_leaves_alias() -> Result<()> {
        let mut store = migrated_store()?;
        let weak = mk_record("asset", None, Some("db01"), None)?;
        store.conditional_put(&weak, ExpectedVersion::Absent)?;

        let strong = promoted(&weak, "uuid-1")?;
        assert_eq!(store.promote(&weak.key, 1, &strong)?, PutOutcome::Written { version: 2 });

        assert!(store.get(&weak.key)?.is_none());
        let via_alias = store.resolve(&weak.key)?.ok_or_else(|| anyhow!("alias should resolve"))?;
        assert_eq!(via_alias.record.key, strong.key);
        assert_eq!(via_alias.version, 2);
        assert_eq!(store.list()?.len(), 1);

        let aliases = store.list_aliases()?;
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].alias_key, weak.key);
        assert_eq!(aliases[0].record_key, strong.key);

        assert_eq!(
            store.promote(&weak.key, 1, &strong)?,
            PutOutcome::VersionConflict { current: None }
        );
        Ok(())
    }

    // Test IDs: ESD-008
    #[test]
    fn promote_reports_taken_target_key() -> Result<()> {
        let mut store = migrated_store()?;
        let occupant = mk_record("asset", Some("uuid-1"), None, None)?;
        let weak = mk_record("asset", None, Some("db01"), None)?;
        store.conditional_put(&occupant, ExpectedVersion::Absent)?;
        store.conditional_put(&weak, ExpectedVersion::Absent)?;

        let strong = promoted(&weak, "uuid-1")?;
        assert_eq!(
            store.promote(&weak.key, 1, &strong)?,
            PutOutcome::KeyTaken { key: occupant.key.clone() }
        );
        assert!(store.get(&weak.key)?.is_some());
        Ok(())
    }

    // Test IDs: ESD-009
    #[test]
    fn purge_expired_removes_rows_and_their_aliases() -> Result<()> {
        let mut store = migrated_store()?;
        let short_lived = mk_record("asset", None, Some("db01"), Some(60))?;
        let forever = mk_record("job", None, Some("build-1"), None)?;
        let long_lived = mk_record("asset", None, Some("db02"), Some(3_600))?;
        store.conditional_put(&short_lived, ExpectedVersion::Absent)?;
        store.conditional_put(&forever, ExpectedVersion::Absent)?;
        store.conditional_put(&long_lived, ExpectedVersion::Absent)?;

        let strong = promoted(&short_lived, "uuid-1")?;
        store.promote(&short_lived.key, 1, &strong)?;

        let summary = store.purge_expired(fixture_time() + Duration::seconds(61))?;
        assert_eq!(summary.purged_records, 1);
        assert_eq!(summary.purged_aliases, 1);
        assert_eq!(summary.purged_keys, vec![strong.key.clone()]);
        assert!(store.list_aliases()?.is_empty());
        assert_eq!(store.list()?.len(), 2);

        let none_left = store.purge_expired(fixture_time() + Duration::seconds(120))?;
        assert_eq!(none_left.purged_records, 0);
        Ok(())
    }

    // Test IDs: ESD-010
    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let weak = mk_record("asset", None, Some("db01"), None)?;
        source.conditional_put(&weak, ExpectedVersion::Absent)?;
        let strong = promoted(&weak, "uuid-1")?;
        source.promote(&weak.key, 1, &strong)?;
        source.conditional_put(&mk_record("person", None, Some("alice"), None)?, ExpectedVersion::Absent)?;

        let export_dir = std::env::temp_dir().join(format!("entitykernel-export-{}", Ulid::new()));
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].records, 2);
        assert_eq!(manifest.files[1].records, 1);

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir, false)?;
        assert_eq!(summary.imported_records, 2);
        assert_eq!(summary.imported_aliases, 1);
        assert_eq!(target.list()?, source.list()?);
        assert_eq!(
            target.resolve(&weak.key)?.map(|stored| stored.version),
            Some(2)
        );

        let again = target.import_snapshot(&export_dir, true)?;
        assert_eq!(again.skipped_existing_records, 2);
        assert_eq!(again.skipped_existing_aliases, 1);
        assert!(target.import_snapshot(&export_dir, false).is_err());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: ESD-011
    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        let mut source = migrated_store()?;
        source.conditional_put(&mk_record("job", None, Some("build-1"), None)?, ExpectedVersion::Absent)?;

        let export_dir = std::env::temp_dir().join(format!("entitykernel-export-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;

        let records_path = export_dir.join(RECORDS_FILE);
        let mut tampered = std::fs::OpenOptions::new().append(true).open(&records_path)?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir, true) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for entity_records.ndjson"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: ESD-012
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let record = mk_record("organization", None, Some("acme"), None)?;
        source.conditional_put(&record, ExpectedVersion::Absent)?;

        let backup_file =
            std::env::temp_dir().join(format!("entitykernel-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        let restored = target.get(&record.key)?.map(|stored| stored.record.record_id);
        assert_eq!(restored, Some(record.record_id));

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: ESD-013
    #[test]
    fn integrity_check_reports_clean_database_and_document_drift() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("person", None, Some("alice"), None)?;
        store.conditional_put(&record, ExpectedVersion::Absent)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.document_key_mismatches.is_empty());
        assert_eq!(report.schema_status.current_version, 2);

        store.conn.execute(
            "UPDATE entity_records SET record_key = 'person:tenant-a:bob' WHERE record_key = ?1",
            params![record.key.as_str()],
        )?;
        let drifted = store.integrity_check()?;
        assert_eq!(drifted.document_key_mismatches, vec!["person:tenant-a:bob".to_string()]);
        Ok(())
    }

    // Test IDs: ESD-014
    #[test]
    fn concurrent_conditional_puts_admit_one_writer_per_version() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("entitykernel-concurrency-{}.sqlite3", Ulid::new()));
        let record = mk_record("job", None, Some("build-1"), None)?;
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            init.conditional_put(&record, ExpectedVersion::Absent)?;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let writer_path = db_path.clone();
            let record = record.clone();
            handles.push(thread::spawn(move || -> Result<bool> {
                let mut store = SqliteStore::open(&writer_path)?;
                let outcome = store.conditional_put(&record, ExpectedVersion::Exact(1))?;
                Ok(matches!(outcome, PutOutcome::Written { .. }))
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            if thread_result? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.get(&record.key)?.map(|stored| stored.version), Some(2));

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: ESD-015
    #[test]
    fn promote_checks_version_before_target_key() -> Result<()> {
        let mut store = migrated_store()?;
        let occupant = mk_record("asset", Some("uuid-2"), None, None)?;
        let weak = mk_record("asset", None, Some("db01"), None)?;
        store.conditional_put(&occupant, ExpectedVersion::Absent)?;
        store.conditional_put(&weak, ExpectedVersion::Absent)?;

        let onto_occupant = promoted(&weak, "uuid-2")?;
        assert_eq!(
            store.promote(&weak.key, 5, &onto_occupant)?,
            PutOutcome::VersionConflict { current: Some(1) }
        );

        // The same record already living at the target is a stale view, not a collision.
        let strong = promoted(&weak, "uuid-1")?;
        store.conditional_put(&strong, ExpectedVersion::Absent)?;
        assert_eq!(
            store.promote(&weak.key, 1, &strong)?,
            PutOutcome::VersionConflict { current: Some(1) }
        );
        assert!(store.get(&weak.key)?.is_some());
        Ok(())
    }

    // Test IDs: ESD-016
    #[test]
    fn alias_rows_follow_the_record_alias_list() -> Result<()> {
        let mut store = migrated_store()?;
        let weak = mk_record("asset", None, Some("db01"), None)?;
        store.conditional_put(&weak, ExpectedVersion::Absent)?;
        let mut strong = promoted(&weak, "uuid-1")?;
        store.promote(&weak.key, 1, &strong)?;
        assert!(store.resolve(&weak.key)?.is_some());

        strong.key_aliases.clear();
        assert_eq!(
            store.conditional_put(&strong, ExpectedVersion::Exact(2))?,
            PutOutcome::Written { version: 3 }
        );
        assert!(store.list_aliases()?.is_empty());
        assert!(store.resolve(&weak.key)?.is_none());

        let spare = CanonicalKey::from_stored("asset:tenant-a:db09");
        let mut owner = mk_record("asset", Some("uuid-3"), None, None)?;
        owner.key_aliases.push(spare.clone());
        store.conditional_put(&owner, ExpectedVersion::Absent)?;
        assert_eq!(store.resolve(&spare)?.map(|stored| stored.record.key), Some(owner.key.clone()));

        let newcomer = mk_record("asset", None, Some("db09"), None)?;
        assert_eq!(newcomer.key, spare);
        store.conditional_put(&newcomer, ExpectedVersion::Absent)?;
        assert!(store.list_aliases()?.is_empty());

        owner.fields.insert("hostname".to_string(), FieldValue::text("spare-host"));
        store.conditional_put(&owner, ExpectedVersion::Exact(1))?;
        assert!(store.list_aliases()?.is_empty());
        assert_eq!(store.resolve(&spare)?.map(|stored| stored.record.key), Some(newcomer.key));
        Ok(())
    }

    // Test IDs: ESD-017
    #[test]
    fn import_accepts_only_the_current_export_version() -> Result<()> {
        let mut source = migrated_store()?;
        source.conditional_put(&mk_record("job", None, Some("build-1"), None)?, ExpectedVersion::Absent)?;
        let export_dir = std::env::temp_dir().join(format!("entitykernel-export-{}", Ulid::new()));
        let mut manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files[0].path, RECORDS_FILE);
        assert_eq!(manifest.files[0].records, 1);
        assert_eq!(manifest.files[1].records, 0);

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        for schema_version in [LATEST_SCHEMA_VERSION - 1, LATEST_SCHEMA_VERSION + 1] {
            manifest.schema_version = schema_version;
            fs::write(export_dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
            let Err(err) = target.import_snapshot(&export_dir, false) else {
                return Err(anyhow!("expected import of version {schema_version} to fail"));
            };
            assert!(err.to_string().contains("unsupported export schema version"));
        }
        assert!(!table_has_column(&target.conn, "no_such_table", "record_json")?);
        assert!(table_has_column(&target.conn, "entity_records", "record_json")?);

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }
}
