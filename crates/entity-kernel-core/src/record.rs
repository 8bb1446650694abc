use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::identity::{EntityKind, Identity, Namespace};
use crate::key::{CanonicalKey, KeyDeriver};
use crate::merge::{merge_bounded, union_dedup};
use crate::schema::{KindRegistry, KindSchema, MergePolicy};
use crate::{ReconcileError, RecordId};

/// One element of a `bounded_fifo` field.
pub type Entry = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    List(Vec<serde_json::Value>),
    Entries(Vec<Entry>),
}

impl FieldValue {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Entries(_) => "entries",
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::List(_) | Self::Entries(_) => None,
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(value) => value.trim().is_empty(),
            Self::List(values) => values.is_empty(),
            Self::Entries(entries) => entries.is_empty(),
        }
    }
}

/// Audit line appended when a status-like field moves up its lattice or the
/// record key is promoted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryEntry {
    pub key: CanonicalKey,
    pub field: String,
    #[serde(default)]
    pub previous: Option<String>,
    pub current: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityRecord {
    pub record_id: RecordId,
    pub key: CanonicalKey,
    pub namespace: Namespace,
    pub identity: Identity,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_visited_at: OffsetDateTime,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub key_aliases: Vec<CanonicalKey>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl EntityRecord {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.namespace.kind
    }

    /// `last_visited_at + ttl`, or `None` for records that never expire.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let ttl = i64::try_from(self.ttl_seconds?).ok()?;
        self.last_visited_at.checked_add(Duration::seconds(ttl))
    }

    /// Most recently added discovery source.
    #[must_use]
    pub fn latest_source(&self) -> Option<&str> {
        self.sources.last().map(String::as_str)
    }

    #[must_use]
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_text)
    }
}

/// A partial observation as submitted by a discovery source.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordDraft {
    #[serde(alias = "label")]
    pub kind: String,
    pub scope: String,
    #[serde(default)]
    pub strong_id: Option<String>,
    #[serde(default)]
    pub weak_id: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    pub source: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub observed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl RecordDraft {
    /// Check the draft against its kind schema.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] for an unknown kind label, a
    /// blank scope or source, a missing identifier, unknown fields, values
    /// whose shape does not fit the field's policy, lattice values outside
    /// their order, and `bounded_fifo` entries missing a key field.
    pub fn validate(self, registry: &KindRegistry) -> Result<ValidatedDraft<'_>, ReconcileError> {
        let Some(schema) = registry.resolve_label(&self.kind) else {
            return Err(ReconcileError::Validation(format!(
                "kind MUST name a registered entity kind: `{}`",
                self.kind
            )));
        };
        let namespace = Namespace::new(schema.kind, &self.scope)?;

        let identity = Identity::new(self.strong_id.as_deref(), self.weak_id.as_deref());
        if identity.is_empty() {
            return Err(ReconcileError::Validation(
                "strong_id or weak_id MUST be provided".to_string(),
            ));
        }

        let source = self.source.trim();
        if source.is_empty() {
            return Err(ReconcileError::Validation(
                "source MUST be provided for every observation".to_string(),
            ));
        }

        if self.ttl_seconds == Some(0) {
            return Err(ReconcileError::Validation(
                "ttl_seconds MUST be > 0 when provided".to_string(),
            ));
        }

        let mut fields = BTreeMap::new();
        for (name, value) in self.fields {
            let value = validate_field(schema, &name, value)?;
            fields.insert(name, value);
        }

        Ok(ValidatedDraft {
            schema,
            namespace,
            identity,
            fields,
            source: source.to_string(),
            observed_at: self.observed_at,
            ttl_seconds: self.ttl_seconds,
        })
    }
}

fn validate_field(
    schema: &KindSchema,
    name: &str,
    value: FieldValue,
) -> Result<FieldValue, ReconcileError> {
    let Some(spec) = schema.spec(name) else {
        return Err(ReconcileError::Validation(format!(
            "field `{name}` is not defined for {} records",
            schema.label()
        )));
    };
    if !spec.policy.accepts(&value) {
        return Err(ReconcileError::Validation(format!(
            "field `{name}` MUST be {} for {}, got {}",
            spec.policy.expected_shape(),
            spec.policy.as_str(),
            value.shape()
        )));
    }

    match (&spec.policy, value) {
        (MergePolicy::Lattice { order }, FieldValue::Text(raw)) => {
            let Some(canonical) = order.normalize(&raw) else {
                return Err(ReconcileError::Validation(format!(
                    "field `{name}` MUST be one of {:?}, got `{raw}`",
                    order.values()
                )));
            };
            Ok(FieldValue::text(canonical))
        }
        (MergePolicy::BoundedFifo { key_fields, .. }, FieldValue::Entries(entries)) => {
            for entry in &entries {
                for key in key_fields {
                    if !entry.get(key).is_some_and(|value| !value.trim().is_empty()) {
                        return Err(ReconcileError::Validation(format!(
                            "field `{name}` entries MUST carry `{key}`"
                        )));
                    }
                }
            }
            Ok(FieldValue::Entries(entries))
        }
        (_, value) => Ok(value),
    }
}

/// A draft whose label, identity and fields passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedDraft<'r> {
    schema: &'r KindSchema,
    namespace: Namespace,
    identity: Identity,
    fields: BTreeMap<String, FieldValue>,
    source: String,
    observed_at: Option<OffsetDateTime>,
    ttl_seconds: Option<u64>,
}

impl<'r> ValidatedDraft<'r> {
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Fill timestamps, TTL and per-field defaults, and bring collection
    /// fields into their merged shape (deduplicated, capped).
    #[must_use]
    pub fn fill_defaults(self, now: OffsetDateTime) -> DefaultedDraft<'r> {
        let schema = self.schema;
        let created_at = self.observed_at.unwrap_or(now);
        let ttl_seconds = self.ttl_seconds.or(schema.default_ttl_seconds);

        let mut fields = BTreeMap::new();
        for (name, value) in self.fields {
            let normalized = match (schema.spec(&name).map(|spec| &spec.policy), value) {
                (Some(MergePolicy::ListUnionDedup), FieldValue::List(values)) => {
                    let mut unique = Vec::with_capacity(values.len());
                    union_dedup(&mut unique, &values);
                    FieldValue::List(unique)
                }
                (Some(MergePolicy::BoundedFifo { cap, key_fields }), FieldValue::Entries(entries)) => {
                    let mut kept = Vec::with_capacity(entries.len().min(*cap));
                    merge_bounded(&mut kept, &entries, *cap, |entry| entry_key(entry, key_fields));
                    FieldValue::Entries(kept)
                }
                (_, value) => value,
            };
            fields.insert(name, normalized);
        }
        for (name, spec) in &schema.fields {
            if let Some(default) = &spec.default {
                fields.entry(name.clone()).or_insert_with(|| default.clone());
            }
        }

        DefaultedDraft {
            schema,
            namespace: self.namespace,
            identity: self.identity,
            fields,
            source: self.source,
            created_at,
            ttl_seconds,
        }
    }
}

/// A validated draft with every implicit value filled in; only the key is
/// missing.
#[derive(Debug, Clone)]
pub struct DefaultedDraft<'r> {
    schema: &'r KindSchema,
    namespace: Namespace,
    identity: Identity,
    fields: BTreeMap<String, FieldValue>,
    source: String,
    created_at: OffsetDateTime,
    ttl_seconds: Option<u64>,
}

impl DefaultedDraft<'_> {
    #[must_use]
    pub fn schema(&self) -> &KindSchema {
        self.schema
    }

    /// # Errors
    /// Returns [`ReconcileError::Key`] when no key fits the configured bound.
    pub fn derive_key(self, deriver: &KeyDeriver) -> Result<EntityRecord, ReconcileError> {
        let key = deriver.derive(&self.namespace, &self.identity)?;
        Ok(EntityRecord {
            record_id: RecordId::new(),
            key,
            namespace: self.namespace,
            identity: self.identity,
            fields: self.fields,
            created_at: self.created_at,
            last_visited_at: self.created_at,
            ttl_seconds: self.ttl_seconds,
            sources: vec![self.source],
            key_aliases: Vec::new(),
            history: Vec::new(),
        })
    }
}

/// Run a draft through validation, default filling and key derivation.
///
/// # Errors
/// Returns the first [`ReconcileError`] raised by any stage.
pub fn build_record(
    draft: RecordDraft,
    registry: &KindRegistry,
    deriver: &KeyDeriver,
    now: OffsetDateTime,
) -> Result<EntityRecord, ReconcileError> {
    draft.validate(registry)?.fill_defaults(now).derive_key(deriver)
}

/// Values of `key_fields` used to decide whether two entries are the same element.
pub(crate) fn entry_key(entry: &Entry, key_fields: &[String]) -> Vec<Option<String>> {
    key_fields.iter().map(|field| entry.get(field).map(|value| value.trim().to_lowercase())).collect()
}
