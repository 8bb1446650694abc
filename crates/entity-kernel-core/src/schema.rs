use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{EntityKind, ScopeStyle};
use crate::record::FieldValue;

const DAY_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_HISTORY_CAP: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("label `{0}` is already registered")]
    DuplicateLabel(String),
    #[error("entity kind `{0}` already has a schema")]
    DuplicateKind(String),
    #[error("schema for `{label}` is invalid: {reason}")]
    InvalidSchema { label: String, reason: String },
    #[error("no schema registered for entity kind `{0}`")]
    UnknownKind(String),
}

/// Built-in partial orders for status-like fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LatticeOrder {
    /// `uninteresting < unanalyzed < interesting`
    Interest,
    /// `queued < running < {succeeded, failed}`
    JobStatus,
    /// `unknown < discovered < verified`
    AssetStatus,
}

impl LatticeOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interest => "interest",
            Self::JobStatus => "job_status",
            Self::AssetStatus => "asset_status",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "interest" => Some(Self::Interest),
            "job_status" => Some(Self::JobStatus),
            "asset_status" => Some(Self::AssetStatus),
            _ => None,
        }
    }

    #[must_use]
    pub fn values(self) -> &'static [&'static str] {
        match self {
            Self::Interest => &["uninteresting", "unanalyzed", "interesting"],
            Self::JobStatus => &["queued", "running", "succeeded", "failed"],
            Self::AssetStatus => &["unknown", "discovered", "verified"],
        }
    }

    #[must_use]
    pub fn bottom(self) -> &'static str {
        self.values()[0]
    }

    /// Height of `value` in the order, or `None` when it is not a member.
    #[must_use]
    pub fn rank(self, value: &str) -> Option<u8> {
        let rank = match (self, value) {
            (Self::Interest, "uninteresting")
            | (Self::JobStatus, "queued")
            | (Self::AssetStatus, "unknown") => 0,
            (Self::Interest, "unanalyzed")
            | (Self::JobStatus, "running")
            | (Self::AssetStatus, "discovered") => 1,
            (Self::Interest, "interesting")
            | (Self::JobStatus, "succeeded" | "failed")
            | (Self::AssetStatus, "verified") => 2,
            _ => return None,
        };
        Some(rank)
    }

    /// Partial comparison. Distinct values of equal rank are incomparable,
    /// as are values outside the order.
    #[must_use]
    pub fn compare(self, left: &str, right: &str) -> Option<Ordering> {
        let left_rank = self.rank(left)?;
        let right_rank = self.rank(right)?;
        if left == right {
            return Some(Ordering::Equal);
        }
        match left_rank.cmp(&right_rank) {
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }

    /// Canonical spelling of a member value, if `raw` names one.
    #[must_use]
    pub fn normalize(self, raw: &str) -> Option<&'static str> {
        let lowered = raw.trim().to_ascii_lowercase();
        self.values().iter().copied().find(|value| *value == lowered)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MergePolicy {
    ScalarPreserveBlank,
    ScalarOverwrite,
    ListUnionDedup,
    Lattice { order: LatticeOrder },
    BoundedFifo { cap: usize, key_fields: Vec<String> },
}

impl MergePolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScalarPreserveBlank => "scalar_preserve_blank",
            Self::ScalarOverwrite => "scalar_overwrite",
            Self::ListUnionDedup => "list_union_dedup",
            Self::Lattice { .. } => "lattice",
            Self::BoundedFifo { .. } => "bounded_fifo",
        }
    }

    /// Value shape the policy operates on.
    #[must_use]
    pub fn expected_shape(&self) -> &'static str {
        match self {
            Self::ScalarPreserveBlank | Self::ScalarOverwrite | Self::Lattice { .. } => "text",
            Self::ListUnionDedup => "list",
            Self::BoundedFifo { .. } => "entries",
        }
    }

    #[must_use]
    pub fn accepts(&self, value: &FieldValue) -> bool {
        self.expected_shape() == value.shape()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub policy: MergePolicy,
    #[serde(default)]
    pub default: Option<FieldValue>,
    #[serde(default)]
    pub records_history: bool,
}

impl FieldSpec {
    #[must_use]
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy, default: None, records_history: false }
    }

    #[must_use]
    pub fn with_default(mut self, value: FieldValue) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn with_history(mut self) -> Self {
        self.records_history = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct KindSchema {
    pub kind: EntityKind,
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub default_ttl_seconds: Option<u64>,
    pub history_cap: usize,
}

impl KindSchema {
    #[must_use]
    pub fn new(kind: EntityKind) -> Self {
        Self { kind, fields: BTreeMap::new(), default_ttl_seconds: None, history_cap: DEFAULT_HISTORY_CAP }
    }

    #[must_use]
    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_string(), spec);
        self
    }

    #[must_use]
    pub fn ttl_days(mut self, days: u64) -> Self {
        self.default_ttl_seconds = Some(days * DAY_SECONDS);
        self
    }

    #[must_use]
    pub fn history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    #[must_use]
    pub fn scope_style(&self) -> ScopeStyle {
        self.kind.scope_style()
    }

    #[must_use]
    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    /// Field table shipped for each built-in kind.
    #[must_use]
    pub fn builtin(kind: EntityKind) -> Self {
        let preserve = || FieldSpec::new(MergePolicy::ScalarPreserveBlank);
        let overwrite = || FieldSpec::new(MergePolicy::ScalarOverwrite);
        let union = || FieldSpec::new(MergePolicy::ListUnionDedup);
        let lattice = |order| FieldSpec::new(MergePolicy::Lattice { order }).with_history();
        let bounded = |cap, keys: &[&str]| {
            FieldSpec::new(MergePolicy::BoundedFifo {
                cap,
                key_fields: keys.iter().map(|key| (*key).to_string()).collect(),
            })
        };

        match kind {
            EntityKind::Asset => Self::new(kind)
                .field("hostname", preserve())
                .field("os", preserve())
                .field("object_id", overwrite())
                .field("addresses", union())
                .field("ports", bounded(32, &["port", "protocol"]))
                .field(
                    "status",
                    lattice(LatticeOrder::AssetStatus)
                        .with_default(FieldValue::text(LatticeOrder::AssetStatus.bottom())),
                )
                .field("tags", union())
                .ttl_days(30),
            EntityKind::AdUser => Self::new(kind)
                .field("name", preserve())
                .field("sam_account_name", preserve())
                .field("display_name", preserve())
                .field("email", preserve())
                .field("object_id", overwrite())
                .field("member_of", union())
                .field("enabled", overwrite())
                .field("logons", bounded(10, &["host"]))
                .ttl_days(90),
            EntityKind::AdGroup => Self::new(kind)
                .field("name", preserve())
                .field("description", preserve())
                .field("object_id", overwrite())
                .field("members", union())
                .ttl_days(90),
            EntityKind::AdComputer => Self::new(kind)
                .field("name", preserve())
                .field("dns_hostname", preserve())
                .field("os", preserve())
                .field("object_id", overwrite())
                .field("last_logon", overwrite())
                .field("member_of", union())
                .field("addresses", union())
                .ttl_days(90),
            EntityKind::WebPage => Self::new(kind)
                .field("url", preserve())
                .field("title", overwrite())
                .field("status_code", overwrite())
                .field("technologies", union())
                .field("interest", lattice(LatticeOrder::Interest))
                .field("forms", bounded(20, &["action", "method"]))
                .ttl_days(14),
            EntityKind::Job => Self::new(kind)
                .field("name", preserve())
                .field(
                    "status",
                    lattice(LatticeOrder::JobStatus)
                        .with_default(FieldValue::text(LatticeOrder::JobStatus.bottom())),
                )
                .field("runner", overwrite())
                .field("message", overwrite())
                .field("steps", bounded(50, &["step"]))
                .history_cap(64),
            EntityKind::Attribute => Self::new(kind)
                .field("name", preserve())
                .field("value", overwrite())
                .field("tags", union())
                .field("interest", lattice(LatticeOrder::Interest)),
            EntityKind::Organization => Self::new(kind)
                .field("name", preserve())
                .field("industry", preserve())
                .field("domains", union())
                .field("contacts", bounded(25, &["email"])),
            EntityKind::Person => Self::new(kind)
                .field("name", preserve())
                .field("email", preserve())
                .field("title", overwrite())
                .field("phones", union())
                .field("organizations", union())
                .field("interest", lattice(LatticeOrder::Interest)),
        }
    }

    fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidSchema {
            label: self.label().to_string(),
            reason,
        };

        if self.history_cap == 0 {
            return Err(invalid("history_cap MUST be >= 1".to_string()));
        }
        if self.default_ttl_seconds == Some(0) {
            return Err(invalid("default_ttl_seconds MUST be > 0 when provided".to_string()));
        }

        for (name, spec) in &self.fields {
            if name.trim().is_empty() {
                return Err(invalid("field names MUST be non-empty".to_string()));
            }
            if let MergePolicy::BoundedFifo { cap, key_fields } = &spec.policy {
                if *cap == 0 {
                    return Err(invalid(format!("{name}: bounded_fifo cap MUST be >= 1")));
                }
                if key_fields.is_empty() || key_fields.iter().any(|key| key.trim().is_empty()) {
                    return Err(invalid(format!(
                        "{name}: bounded_fifo key_fields MUST name at least one field"
                    )));
                }
            }
            if let Some(default) = &spec.default {
                if !spec.policy.accepts(default) {
                    return Err(invalid(format!(
                        "{name}: default MUST be {} for {}",
                        spec.policy.expected_shape(),
                        spec.policy.as_str()
                    )));
                }
                if let (MergePolicy::Lattice { order }, FieldValue::Text(value)) =
                    (&spec.policy, default)
                {
                    if order.rank(value).is_none() {
                        return Err(invalid(format!(
                            "{name}: default `{value}` is not a member of {}",
                            order.as_str()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Label-addressed table of kind schemas, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    schemas: BTreeMap<EntityKind, KindSchema>,
    labels: BTreeMap<String, EntityKind>,
}

impl KindRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in kind under its label, plus its
    /// snake_case name as an alias.
    ///
    /// # Errors
    /// Propagates [`RegistryError`] from registration; the built-in tables
    /// are expected to register cleanly.
    pub fn with_builtin_kinds() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for kind in EntityKind::ALL {
            registry.register(KindSchema::builtin(kind))?;
            if kind.as_str() != kind.label() {
                registry.register_alias(kind.as_str(), kind)?;
            }
        }
        Ok(registry)
    }

    /// # Errors
    /// Returns [`RegistryError::DuplicateKind`] or
    /// [`RegistryError::DuplicateLabel`] on collisions, and
    /// [`RegistryError::InvalidSchema`] when the field table is inconsistent.
    pub fn register(&mut self, schema: KindSchema) -> Result<(), RegistryError> {
        schema.check()?;
        if self.schemas.contains_key(&schema.kind) {
            return Err(RegistryError::DuplicateKind(schema.kind.as_str().to_string()));
        }
        let label = schema.label().to_string();
        if self.labels.contains_key(&label) {
            return Err(RegistryError::DuplicateLabel(label));
        }
        self.labels.insert(label, schema.kind);
        self.schemas.insert(schema.kind, schema);
        Ok(())
    }

    /// # Errors
    /// Returns [`RegistryError::UnknownKind`] when `kind` has no schema yet and
    /// [`RegistryError::DuplicateLabel`] when `alias` is taken.
    pub fn register_alias(&mut self, alias: &str, kind: EntityKind) -> Result<(), RegistryError> {
        if !self.schemas.contains_key(&kind) {
            return Err(RegistryError::UnknownKind(kind.as_str().to_string()));
        }
        let alias = alias.trim().to_ascii_lowercase();
        if alias.is_empty() {
            return Err(RegistryError::InvalidSchema {
                label: kind.label().to_string(),
                reason: "alias MUST be non-empty".to_string(),
            });
        }
        if self.labels.contains_key(&alias) {
            return Err(RegistryError::DuplicateLabel(alias));
        }
        self.labels.insert(alias, kind);
        Ok(())
    }

    #[must_use]
    pub fn resolve_label(&self, label: &str) -> Option<&KindSchema> {
        let kind = self.labels.get(&label.trim().to_ascii_lowercase())?;
        self.schemas.get(kind)
    }

    #[must_use]
    pub fn for_kind(&self, kind: EntityKind) -> Option<&KindSchema> {
        self.schemas.get(&kind)
    }

    /// # Errors
    /// Returns [`RegistryError::UnknownKind`] when `kind` was never registered.
    pub fn require(&self, kind: EntityKind) -> Result<&KindSchema, RegistryError> {
        self.for_kind(kind).ok_or_else(|| RegistryError::UnknownKind(kind.as_str().to_string()))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &KindSchema> {
        self.schemas.values()
    }

    /// All labels (primary and alias) that resolve to `kind`.
    #[must_use]
    pub fn labels_for(&self, kind: EntityKind) -> Vec<&str> {
        self.labels
            .iter()
            .filter(|(_, candidate)| **candidate == kind)
            .map(|(label, _)| label.as_str())
            .collect()
    }
}
