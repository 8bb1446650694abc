use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::identity::{Identity, Namespace};
use crate::key::{
    CanonicalKey, KeyDeriver, TruncationStrategy, DEFAULT_MAX_KEY_LENGTH, MAX_MAX_KEY_LENGTH,
    MIN_MAX_KEY_LENGTH,
};
use crate::matcher::{can_reconcile, MatchDecision, RejectReason};
use crate::merge::{merge_bounded, merge_fields, union_dedup, MergeReport};
use crate::record::{build_record, EntityRecord, HistoryEntry, RecordDraft};
use crate::schema::KindRegistry;
use crate::ReconcileError;

/// History field name used for key promotions.
pub const KEY_HISTORY_FIELD: &str = "$key";

const DEFAULT_KEY_ALIAS_CAP: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_key_length: usize,
    pub truncation: TruncationStrategy,
    pub key_alias_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            truncation: TruncationStrategy::Truncate,
            key_alias_cap: DEFAULT_KEY_ALIAS_CAP,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when a bound is out of range.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if !(MIN_MAX_KEY_LENGTH..=MAX_MAX_KEY_LENGTH).contains(&self.max_key_length) {
            return Err(ReconcileError::Validation(format!(
                "max_key_length MUST be in {MIN_MAX_KEY_LENGTH}..={MAX_MAX_KEY_LENGTH}, got {}",
                self.max_key_length
            )));
        }
        if self.key_alias_cap == 0 {
            return Err(ReconcileError::Validation("key_alias_cap MUST be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn deriver(&self) -> KeyDeriver {
        KeyDeriver::new(self.max_key_length, self.truncation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VisitOutcome {
    Rejected { reason: RejectReason },
    Merged { report: MergeReport },
    MergedWithPromotion { report: MergeReport, previous_key: CanonicalKey },
}

impl VisitOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::Merged { .. } => "merged",
            Self::MergedWithPromotion { .. } => "merged_with_promotion",
        }
    }

    #[must_use]
    pub fn report(&self) -> Option<&MergeReport> {
        match self {
            Self::Rejected { .. } => None,
            Self::Merged { report } | Self::MergedWithPromotion { report, .. } => Some(report),
        }
    }
}

/// Folds visiting observations into existing records.
///
/// Holds no mutable state; one engine can serve any number of visits.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine<'r> {
    registry: &'r KindRegistry,
    deriver: KeyDeriver,
    key_alias_cap: usize,
}

impl<'r> ReconciliationEngine<'r> {
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when `config` is out of range.
    pub fn new(registry: &'r KindRegistry, config: &EngineConfig) -> Result<Self, ReconcileError> {
        config.validate()?;
        Ok(Self { registry, deriver: config.deriver(), key_alias_cap: config.key_alias_cap })
    }

    #[must_use]
    pub fn registry(&self) -> &'r KindRegistry {
        self.registry
    }

    #[must_use]
    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// # Errors
    /// Returns the first pipeline failure for `draft`.
    pub fn build_record(
        &self,
        draft: RecordDraft,
        now: OffsetDateTime,
    ) -> Result<EntityRecord, ReconcileError> {
        build_record(draft, self.registry, &self.deriver, now)
    }

    /// # Errors
    /// Returns [`ReconcileError::Key`] when no key can be derived.
    pub fn derive_key(
        &self,
        namespace: &Namespace,
        identity: &Identity,
    ) -> Result<CanonicalKey, ReconcileError> {
        Ok(self.deriver.derive(namespace, identity)?)
    }

    /// Key `record` would have from its weak identifier alone, when it differs
    /// from the record's own key.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Key`] when the prefix does not fit.
    pub fn weak_key(&self, record: &EntityRecord) -> Result<Option<CanonicalKey>, ReconcileError> {
        let weak = self.deriver.derive_weak(&record.namespace, &record.identity)?;
        Ok(weak.filter(|key| *key != record.key))
    }

    /// Fold `visiting` into `existing`.
    ///
    /// On rejection `existing` is left untouched. On error nothing is applied:
    /// the merge runs on a copy that replaces `existing` only once every step
    /// succeeded.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Registry`] when the kind has no schema and
    /// [`ReconcileError::Key`] when the promoted key cannot be derived.
    pub fn visit(
        &self,
        existing: &mut EntityRecord,
        visiting: &EntityRecord,
    ) -> Result<VisitOutcome, ReconcileError> {
        let reason = match can_reconcile(existing, visiting) {
            MatchDecision::Match(reason) => reason,
            MatchDecision::Reject(reason) => {
                debug!(
                    key = %existing.key,
                    visiting = %visiting.key,
                    reason = reason.as_str(),
                    "visit rejected"
                );
                return Ok(VisitOutcome::Rejected { reason });
            }
        };

        let schema = self.registry.require(existing.kind())?;
        let mut merged = existing.clone();
        let report = merge_fields(&mut merged.fields, &visiting.fields, schema);

        merged.created_at = merged.created_at.min(visiting.created_at);
        merged.last_visited_at = visiting.last_visited_at;
        if visiting.ttl_seconds.is_some() {
            merged.ttl_seconds = visiting.ttl_seconds;
        }
        union_dedup(&mut merged.sources, &visiting.sources);

        if let Some(weak) = visiting.identity.weak() {
            if merged.identity.weak().is_none() || merged.identity.strong().is_some() {
                let stale = self.deriver.derive_weak(&merged.namespace, &merged.identity)?;
                merged.identity.weak = Some(weak.to_string());
                let renamed = self.deriver.derive_weak(&merged.namespace, &merged.identity)?;
                if let Some(stale) = stale.filter(|stale| Some(stale) != renamed.as_ref()) {
                    // The old weak name no longer identifies this record.
                    merged.key_aliases.retain(|alias| *alias != stale);
                }
            }
        }

        let mut previous_key = None;
        if merged.identity.strong().is_none() {
            if let Some(strong) = visiting.identity.strong() {
                merged.identity.strong = Some(strong.to_string());
                let promoted = self.deriver.derive(&merged.namespace, &merged.identity)?;
                if promoted != merged.key {
                    let old = std::mem::replace(&mut merged.key, promoted);
                    merge_bounded(
                        &mut merged.key_aliases,
                        std::slice::from_ref(&old),
                        self.key_alias_cap,
                        CanonicalKey::clone,
                    );
                    previous_key = Some(old);
                }
            }
        }
        let current_key = merged.key.clone();
        merged.key_aliases.retain(|alias| *alias != current_key);

        let source = visiting.latest_source().unwrap_or_default().to_string();
        let at = visiting.last_visited_at;
        let mut entries: Vec<HistoryEntry> = report
            .transitions
            .iter()
            .filter(|transition| {
                schema.spec(&transition.field).is_some_and(|spec| spec.records_history)
            })
            .map(|transition| HistoryEntry {
                key: current_key.clone(),
                field: transition.field.clone(),
                previous: transition.previous.clone(),
                current: transition.current.clone(),
                source: source.clone(),
                at,
            })
            .collect();
        if let Some(old) = &previous_key {
            entries.push(HistoryEntry {
                key: current_key.clone(),
                field: KEY_HISTORY_FIELD.to_string(),
                previous: Some(old.to_string()),
                current: current_key.to_string(),
                source,
                at,
            });
        }
        merged.history.extend(entries);
        if merged.history.len() > schema.history_cap {
            let overflow = merged.history.len() - schema.history_cap;
            merged.history.drain(..overflow);
        }

        *existing = merged;

        Ok(match previous_key {
            Some(previous_key) => {
                debug!(
                    key = %existing.key,
                    previous_key = %previous_key,
                    matched_by = reason.as_str(),
                    changed = report.changed.len(),
                    "visit merged with key promotion"
                );
                VisitOutcome::MergedWithPromotion { report, previous_key }
            }
            None => {
                debug!(
                    key = %existing.key,
                    matched_by = reason.as_str(),
                    changed = report.changed.len(),
                    "visit merged"
                );
                VisitOutcome::Merged { report }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Entry, FieldValue};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use time::Duration;

    // Test IDs: ENG-001..ENG-011

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn registry() -> KindRegistry {
        KindRegistry::with_builtin_kinds()
            .unwrap_or_else(|err| panic!("builtin kinds should register: {err}"))
    }

    fn engine(registry: &KindRegistry) -> ReconciliationEngine<'_> {
        ReconciliationEngine::new(registry, &EngineConfig::default())
            .unwrap_or_else(|err| panic!("engine should build: {err}"))
    }

    fn draft(kind: &str, scope: &str, strong: Option<&str>, weak: Option<&str>) -> RecordDraft {
        RecordDraft {
            kind: kind.to_string(),
            scope: scope.to_string(),
            strong_id: strong.map(str::to_string),
            weak_id: weak.map(str::to_string),
            fields: BTreeMap::new(),
            source: "ldap-sync".to_string(),
            observed_at: None,
            ttl_seconds: None,
        }
    }

    fn build(engine: &ReconciliationEngine<'_>, draft: RecordDraft, at: OffsetDateTime) -> EntityRecord {
        engine.build_record(draft, at).unwrap_or_else(|err| panic!("record should build: {err}"))
    }

    fn visit(
        engine: &ReconciliationEngine<'_>,
        existing: &mut EntityRecord,
        visiting: &EntityRecord,
    ) -> VisitOutcome {
        engine.visit(existing, visiting).unwrap_or_else(|err| panic!("visit should succeed: {err}"))
    }

    #[test]
    fn directory_user_is_promoted_when_sid_arrives() {
        // Test IDs: ENG-001
        let registry = registry();
        let engine = engine(&registry);
        let weak = "CN=UserTemplate,CN=Users,DC=example,DC=local";

        let mut first = draft("aduser", "example.local", None, Some(weak));
        first.fields.insert("name".to_string(), FieldValue::text(""));
        let mut existing = build(&engine, first, fixture_time());
        let weak_key = existing.key.clone();

        let mut second = draft("aduser", "example.local", Some("S-1-5-21-3623811015-1001"), Some(weak));
        second.fields.insert("name".to_string(), FieldValue::text("UserTemplate"));
        let visiting = build(&engine, second, fixture_time() + Duration::hours(1));

        let outcome = visit(&engine, &mut existing, &visiting);
        let VisitOutcome::MergedWithPromotion { previous_key, .. } = outcome else {
            panic!("expected promotion, got {}", outcome.as_str());
        };

        assert_eq!(previous_key, weak_key);
        assert_eq!(existing.key.as_str(), "aduser:example.local:s-1-5-21-3623811015-1001");
        assert_eq!(existing.text("name"), Some("UserTemplate"));
        assert_eq!(existing.key_aliases, vec![weak_key]);
        assert_eq!(existing.identity.weak(), Some(weak));
        let last = existing.history.last().map(|entry| entry.field.as_str());
        assert_eq!(last, Some(KEY_HISTORY_FIELD));
    }

    #[test]
    fn promoted_key_equals_strong_only_derivation_and_keeps_fields() {
        // Test IDs: ENG-002
        let registry = registry();
        let engine = engine(&registry);
        let mut first = draft("asset", "tenant-a", None, Some("db01"));
        first.fields.insert("os".to_string(), FieldValue::text("linux"));
        let mut existing = build(&engine, first, fixture_time());

        let visiting = build(&engine, draft("asset", "tenant-a", Some("UUID-9"), Some("db01")), fixture_time());
        visit(&engine, &mut existing, &visiting);

        let strong_only = Identity::new(Some("UUID-9"), None);
        let expected = engine
            .derive_key(&existing.namespace, &strong_only)
            .unwrap_or_else(|err| panic!("key should derive: {err}"));
        assert_eq!(existing.key, expected);
        assert_eq!(existing.text("os"), Some("linux"));
    }

    #[test]
    fn non_matching_visit_leaves_existing_untouched() {
        // Test IDs: ENG-003
        let registry = registry();
        let engine = engine(&registry);
        let mut existing = build(&engine, draft("aduser", "example.local", None, Some("CN=a")), fixture_time());
        let snapshot = existing.clone();
        let visiting = build(&engine, draft("adgroup", "example.local", None, Some("CN=a")), fixture_time());

        let outcome = visit(&engine, &mut existing, &visiting);
        assert_eq!(outcome, VisitOutcome::Rejected { reason: RejectReason::KindMismatch });
        assert_eq!(existing, snapshot);
    }

    #[test]
    fn non_promoting_merge_keeps_key_and_updates_bookkeeping() {
        // Test IDs: ENG-004
        let registry = registry();
        let engine = engine(&registry);
        let mut existing = build(&engine, draft("webpage", "example.com", None, Some("/login")), fixture_time());
        let key = existing.key.clone();

        let mut later = draft("webpage", "Example.COM", None, Some("/LOGIN"));
        later.source = "crawler".to_string();
        later.ttl_seconds = Some(60);
        later.fields.insert("interest".to_string(), FieldValue::text("interesting"));
        let visiting = build(&engine, later, fixture_time() + Duration::days(1));

        let outcome = visit(&engine, &mut existing, &visiting);
        assert_eq!(outcome.as_str(), "merged");
        assert_eq!(existing.key, key);
        assert_eq!(existing.created_at, fixture_time());
        assert_eq!(existing.last_visited_at, fixture_time() + Duration::days(1));
        assert_eq!(existing.ttl_seconds, Some(60));
        assert_eq!(existing.sources, vec!["ldap-sync".to_string(), "crawler".to_string()]);
        assert_eq!(existing.history.len(), 1);
        assert_eq!(existing.history[0].source, "crawler");
        assert_eq!(existing.history[0].current, "interesting");
    }

    #[test]
    fn earlier_observation_moves_created_at_back() {
        // Test IDs: ENG-005
        let registry = registry();
        let engine = engine(&registry);
        let mut existing = build(&engine, draft("person", "tenant", None, Some("alice")), fixture_time());
        let visiting = build(
            &engine,
            draft("person", "tenant", None, Some("alice")),
            fixture_time() - Duration::days(3),
        );
        visit(&engine, &mut existing, &visiting);
        assert_eq!(existing.created_at, fixture_time() - Duration::days(3));
    }

    #[test]
    fn history_is_bounded_by_kind_cap() {
        // Test IDs: ENG-006
        let registry = registry();
        let engine = engine(&registry);
        let cap = registry.require(crate::EntityKind::Asset).map(|schema| schema.history_cap);
        let cap = cap.unwrap_or_else(|err| panic!("asset schema: {err}"));

        let mut existing = build(&engine, draft("asset", "t", None, Some("host")), fixture_time());
        for round in 0..(cap + 5) {
            existing.fields.insert("status".to_string(), FieldValue::text("unknown"));
            let mut next = draft("asset", "t", None, Some("host"));
            next.fields.insert("status".to_string(), FieldValue::text("verified"));
            let offset = Duration::minutes(i64::try_from(round).unwrap_or(0));
            let visiting = build(&engine, next, fixture_time() + offset);
            visit(&engine, &mut existing, &visiting);
        }
        assert_eq!(existing.history.len(), cap);
    }

    #[test]
    fn alias_list_is_capped_and_excludes_current_key() {
        // Test IDs: ENG-007
        let registry = registry();
        let config = EngineConfig { key_alias_cap: 1, ..EngineConfig::default() };
        let engine = ReconciliationEngine::new(&registry, &config)
            .unwrap_or_else(|err| panic!("engine should build: {err}"));

        let mut existing = build(&engine, draft("asset", "t", None, Some("db01")), fixture_time());
        existing.key_aliases = vec![CanonicalKey::from_stored("asset:t:old")];
        let visiting = build(&engine, draft("asset", "t", Some("u-1"), Some("db01")), fixture_time());
        visit(&engine, &mut existing, &visiting);

        assert_eq!(existing.key_aliases.len(), 1);
        assert_eq!(existing.key_aliases[0].as_str(), "asset:t:db01");
    }

    #[test]
    fn engine_config_bounds_are_enforced() {
        // Test IDs: ENG-008
        let registry = registry();
        let short = EngineConfig { max_key_length: 32, ..EngineConfig::default() };
        assert!(ReconciliationEngine::new(&registry, &short).is_err());
        let no_alias = EngineConfig { key_alias_cap: 0, ..EngineConfig::default() };
        assert!(ReconciliationEngine::new(&registry, &no_alias).is_err());
    }

    #[test]
    fn weak_key_is_reported_only_when_it_differs() {
        // Test IDs: ENG-009
        let registry = registry();
        let engine = engine(&registry);
        let both = build(&engine, draft("asset", "t", Some("u-1"), Some("db01")), fixture_time());
        let weak_only = build(&engine, draft("asset", "t", None, Some("db01")), fixture_time());

        assert_eq!(
            engine.weak_key(&both).ok().flatten().map(CanonicalKey::into_string),
            Some("asset:t:db01".to_string())
        );
        assert_eq!(engine.weak_key(&weak_only).ok().flatten(), None);
    }

    #[test]
    fn renamed_weak_identifier_drops_its_old_alias() {
        // Test IDs: ENG-010
        let registry = registry();
        let engine = engine(&registry);
        let sid = "S-1-5-21-1001";

        let mut existing = build(&engine, draft("aduser", "example.local", None, Some("alice")), fixture_time());
        let alice_key = existing.key.clone();
        let promoting = build(&engine, draft("aduser", "example.local", Some(sid), Some("alice")), fixture_time());
        visit(&engine, &mut existing, &promoting);
        assert_eq!(existing.key_aliases, vec![alice_key.clone()]);

        let mut renamed = draft("aduser", "example.local", Some(sid), Some("bob"));
        renamed.source = "hr-feed".to_string();
        let renamed = build(&engine, renamed, fixture_time() + Duration::hours(1));
        let outcome = visit(&engine, &mut existing, &renamed);

        assert_eq!(outcome.as_str(), "merged");
        assert_eq!(existing.identity.weak(), Some("bob"));
        assert!(!existing.key_aliases.contains(&alice_key));
        assert!(existing.key_aliases.is_empty());

        // Same name with different case keeps the alias it already derives.
        let mut kept = build(&engine, draft("aduser", "example.local", None, Some("carol")), fixture_time());
        let carol_key = kept.key.clone();
        let carol_sid = build(&engine, draft("aduser", "example.local", Some("S-2"), Some("carol")), fixture_time());
        visit(&engine, &mut kept, &carol_sid);
        let shouted = build(&engine, draft("aduser", "example.local", Some("S-2"), Some("CAROL")), fixture_time());
        visit(&engine, &mut kept, &shouted);
        assert_eq!(kept.key_aliases, vec![carol_key]);
    }

    #[test]
    fn history_written_during_promotion_names_the_promoted_key() {
        // Test IDs: ENG-011
        let registry = registry();
        let engine = engine(&registry);

        let mut first = draft("asset", "tenant-a", None, Some("db01"));
        first.fields.insert("status".to_string(), FieldValue::text("unknown"));
        let mut existing = build(&engine, first, fixture_time());
        let weak_key = existing.key.clone();
        let before = existing.history.len();

        let mut second = draft("asset", "tenant-a", Some("UUID-7"), Some("db01"));
        second.fields.insert("status".to_string(), FieldValue::text("verified"));
        second.source = "scanner".to_string();
        let visiting = build(&engine, second, fixture_time() + Duration::minutes(5));

        let outcome = visit(&engine, &mut existing, &visiting);
        assert_eq!(outcome.as_str(), "merged_with_promotion");
        assert_eq!(existing.key.as_str(), "asset:tenant-a:uuid-7");

        let written = &existing.history[before..];
        let fields: Vec<&str> = written.iter().map(|entry| entry.field.as_str()).collect();
        assert_eq!(fields, vec!["status", KEY_HISTORY_FIELD]);
        assert!(written.iter().all(|entry| entry.key == existing.key));
        assert!(written.iter().all(|entry| entry.key != weak_key));
        assert!(written.iter().all(|entry| entry.source == "scanner"));
        assert_eq!(written[1].previous.as_deref(), Some(weak_key.as_str()));
    }

    fn port(port: u16, banner: &str) -> Entry {
        Entry::from([
            ("port".to_string(), port.to_string()),
            ("protocol".to_string(), "tcp".to_string()),
            ("banner".to_string(), banner.to_string()),
        ])
    }

    fn arb_asset_fields() -> impl Strategy<Value = BTreeMap<String, FieldValue>> {
        (
            prop::option::of("[a-z ]{0,6}"),
            prop::option::of("[a-z]{0,6}"),
            prop::option::of(prop::collection::vec("[a-c]", 0..5)),
            prop::option::of(prop::collection::vec((20_u16..30, "[xy]"), 0..40)),
            prop::option::of(prop::sample::select(vec!["unknown", "discovered", "verified"])),
        )
            .prop_map(|(hostname, object_id, tags, ports, status)| {
                let mut fields = BTreeMap::new();
                if let Some(hostname) = hostname {
                    fields.insert("hostname".to_string(), FieldValue::Text(hostname));
                }
                if let Some(object_id) = object_id {
                    fields.insert("object_id".to_string(), FieldValue::Text(object_id));
                }
                if let Some(tags) = tags {
                    let tags = tags.into_iter().map(serde_json::Value::String).collect();
                    fields.insert("tags".to_string(), FieldValue::List(tags));
                }
                if let Some(ports) = ports {
                    let ports = ports.iter().map(|(number, banner)| port(*number, banner)).collect();
                    fields.insert("ports".to_string(), FieldValue::Entries(ports));
                }
                if let Some(status) = status {
                    fields.insert("status".to_string(), FieldValue::text(status));
                }
                fields
            })
    }

    proptest! {
        #[test]
        fn visiting_twice_equals_visiting_once(
            existing_fields in arb_asset_fields(),
            visiting_fields in arb_asset_fields(),
            strong in prop::option::of("[0-9]{1,4}"),
        ) {
            let registry = registry();
            let engine = engine(&registry);

            let mut first = draft("asset", "tenant", None, Some("db01"));
            first.fields = existing_fields;
            let mut existing = build(&engine, first, fixture_time());

            let mut second = draft("asset", "tenant", strong.as_deref(), Some("db01"));
            second.fields = visiting_fields;
            second.source = "scanner".to_string();
            let visiting = build(&engine, second, fixture_time() + Duration::hours(2));

            visit(&engine, &mut existing, &visiting);
            let once = existing.clone();
            let replay = visit(&engine, &mut existing, &visiting);

            prop_assert_eq!(&once, &existing);
            prop_assert!(replay.report().is_some_and(MergeReport::is_noop));

            let Some(FieldValue::Entries(ports)) = existing.fields.get("ports") else {
                return Ok(());
            };
            prop_assert!(ports.len() <= 32);
        }

        #[test]
        fn preserve_blank_never_erases_known_text(
            known in "[a-z]{1,8}",
            incoming in "[ ]{0,3}",
        ) {
            let registry = registry();
            let engine = engine(&registry);
            let mut first = draft("asset", "tenant", None, Some("db01"));
            first.fields.insert("hostname".to_string(), FieldValue::text(known.clone()));
            let mut existing = build(&engine, first, fixture_time());

            let mut second = draft("asset", "tenant", None, Some("db01"));
            second.fields.insert("hostname".to_string(), FieldValue::text(incoming));
            let visiting = build(&engine, second, fixture_time());

            visit(&engine, &mut existing, &visiting);
            prop_assert_eq!(existing.text("hostname"), Some(known.as_str()));
        }
    }
}
