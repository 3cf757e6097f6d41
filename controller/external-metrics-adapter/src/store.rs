//! Live mapping from external metric names to query definitions

use crate::definition::{parse_document, QueryDefinition};
use crate::metrics::Metrics;
use crate::source::{ConfigSource, ObjectRef};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Store key of a definition: `namespace/external_name`.
pub fn metric_key(namespace: &str, external_name: &str) -> String {
    format!("{}/{}", namespace, external_name)
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    definition: QueryDefinition,
    origin: ObjectRef,
}

/// Immutable set of definitions in effect.
///
/// A snapshot is never modified once published; refreshes build a new one and
/// swap it in whole.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    entries: BTreeMap<String, SnapshotEntry>,
}

impl ConfigSnapshot {
    pub fn get(&self, namespace: &str, external_name: &str) -> Option<&QueryDefinition> {
        self.entries
            .get(&metric_key(namespace, external_name))
            .map(|entry| &entry.definition)
    }

    /// All keys, sorted and unique
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, origin: &ObjectRef, definition: QueryDefinition) {
        let key = metric_key(&origin.namespace, &definition.external_name);
        self.entries.insert(
            key,
            SnapshotEntry {
                definition,
                origin: origin.clone(),
            },
        );
    }

    /// Drops every entry last written by `origin`, returning their external names.
    fn remove_origin(&mut self, origin: &ObjectRef) -> Vec<String> {
        let mut dropped = Vec::new();
        self.entries.retain(|_, entry| {
            if &entry.origin == origin {
                dropped.push(entry.definition.external_name.clone());
                false
            } else {
                true
            }
        });
        dropped
    }
}

/// Definitions one object has written, with the order of its latest write
#[derive(Debug, Default)]
struct Contribution {
    sequence: u64,
    definitions: BTreeMap<String, QueryDefinition>,
}

/// Per-object bookkeeping kept alongside the published snapshot
#[derive(Debug, Default)]
struct ObjectLedger {
    markers: HashMap<ObjectRef, String>,
    contributions: HashMap<ObjectRef, Contribution>,
    sequence: u64,
}

impl ObjectLedger {
    fn record_applied(&mut self, object: &ObjectRef, definitions: &[QueryDefinition]) {
        self.sequence += 1;
        let contribution = self.contributions.entry(object.clone()).or_default();
        contribution.sequence = self.sequence;
        for definition in definitions {
            contribution
                .definitions
                .insert(definition.external_name.clone(), definition.clone());
        }
    }

    /// Most recently written surviving declaration of `namespace/external_name`
    fn latest_declaration(
        &self,
        namespace: &str,
        external_name: &str,
    ) -> Option<(&ObjectRef, &QueryDefinition)> {
        self.contributions
            .iter()
            .filter(|(object, _)| object.namespace == namespace)
            .filter_map(|(object, contribution)| {
                contribution
                    .definitions
                    .get(external_name)
                    .map(|definition| (contribution.sequence, object, definition))
            })
            .max_by_key(|(sequence, _, _)| *sequence)
            .map(|(_, object, definition)| (object, definition))
    }

    /// Forgets `object` and drops its entries from `snapshot`. Keys another
    /// object still declares fall back to that object's definition.
    ///
    /// Returns `(dropped, restored)`.
    fn remove_object(
        &mut self,
        snapshot: &mut ConfigSnapshot,
        object: &ObjectRef,
    ) -> (usize, usize) {
        self.markers.remove(object);
        self.contributions.remove(object);

        let dropped = snapshot.remove_origin(object);
        let mut restored = 0;
        for external_name in &dropped {
            if let Some((origin, definition)) =
                self.latest_declaration(&object.namespace, external_name)
            {
                snapshot.insert(origin, definition.clone());
                restored += 1;
            }
        }
        (dropped.len(), restored)
    }
}

/// Counts from one refresh cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub disabled: usize,
    pub failed: usize,
    pub removed: usize,
}

/// Holds the current [`ConfigSnapshot`] and what each object has contributed.
///
/// Readers take a cheap reference to the published snapshot and never observe a
/// refresh half-applied. Refreshes are serialized by the ledger lock.
#[derive(Clone)]
pub struct ConfigStore {
    snapshot: Arc<RwLock<Arc<ConfigSnapshot>>>,
    ledger: Arc<Mutex<ObjectLedger>>,
    metrics: Metrics,
}

impl ConfigStore {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(ConfigSnapshot::default()))),
            ledger: Arc::new(Mutex::new(ObjectLedger::default())),
            metrics,
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn lookup(&self, namespace: &str, external_name: &str) -> Option<QueryDefinition> {
        self.snapshot()
            .await
            .get(namespace, external_name)
            .cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        self.snapshot().await.names()
    }

    /// Polls `source` once and publishes the resulting snapshot.
    ///
    /// Objects whose change marker is unchanged or that lack the enable marker are
    /// skipped. A document that fails to parse is logged and skipped without
    /// touching the entries it produced before; its marker is recorded so the
    /// failure is reported once per revision. Entries are only dropped for
    /// objects the source reports as removed, and a dropped key that another
    /// object still declares takes that object's definition.
    pub async fn refresh(&self, source: &dyn ConfigSource) -> Result<RefreshSummary> {
        let update = source
            .fetch()
            .await
            .context("Failed to fetch configuration objects")?;

        let mut ledger = self.ledger.lock().await;
        let current = self.snapshot().await;
        let mut next: Option<ConfigSnapshot> = None;
        let mut summary = RefreshSummary::default();

        for object in update.objects {
            if !object.enabled {
                debug!(object = %object.object, "Skipping configuration object without enable marker");
                summary.disabled += 1;
                continue;
            }

            if ledger.markers.get(&object.object) == Some(&object.change_marker) {
                summary.unchanged += 1;
                continue;
            }

            match parse_document(&object.data) {
                Ok(definitions) => {
                    ledger.record_applied(&object.object, &definitions);
                    let snapshot = next.get_or_insert_with(|| (*current).clone());
                    let count = definitions.len();
                    for definition in definitions {
                        snapshot.insert(&object.object, definition);
                    }
                    info!(
                        object = %object.object,
                        definitions = count,
                        marker = %object.change_marker,
                        "Applied configuration object"
                    );
                    summary.applied += 1;
                }
                Err(e) => {
                    warn!(
                        object = %object.object,
                        marker = %object.change_marker,
                        error = %e,
                        "Failed to parse configuration object, keeping previous definitions"
                    );
                    self.metrics.record_config_error(&object.object.to_string());
                    summary.failed += 1;
                }
            }
            ledger.markers.insert(object.object, object.change_marker);
        }

        for removed in update.removed {
            let snapshot = next.get_or_insert_with(|| (*current).clone());
            let (dropped, restored) = ledger.remove_object(snapshot, &removed);
            info!(
                object = %removed,
                definitions = dropped,
                restored,
                "Removed configuration object"
            );
            summary.removed += 1;
        }

        if let Some(next) = next {
            *self.snapshot.write().await = Arc::new(next);
        }
        drop(ledger);

        self.metrics.record_refresh(
            summary.applied,
            summary.unchanged,
            summary.failed,
            summary.removed,
        );
        Ok(summary)
    }

    /// Forgets `object` and drops the definitions it last wrote.
    ///
    /// Returns how many metrics stopped resolving; keys another object still
    /// declares are not counted.
    pub async fn remove_object(&self, namespace: &str, name: &str) -> usize {
        let object = ObjectRef::new(namespace, name);
        let mut ledger = self.ledger.lock().await;

        let mut next = (*self.snapshot().await).clone();
        let (dropped, restored) = ledger.remove_object(&mut next, &object);
        if dropped > 0 {
            *self.snapshot.write().await = Arc::new(next);
        }
        dropped - restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Aggregate;
    use crate::source::{ConfigObject, StaticConfigSource};

    fn document(entries: &[(&str, &str)]) -> String {
        let mut doc = String::from("queries:\n");
        for (name, caql) in entries {
            doc.push_str(&format!(
                "  - caql: '{}'\n    circonus_api_key: key\n    external_name: {}\n",
                caql, name
            ));
        }
        doc
    }

    fn object_with_marker(namespace: &str, name: &str, marker: &str, data: String) -> ConfigObject {
        let mut object = ConfigObject::new(namespace, name, data);
        object.change_marker = marker.to_string();
        object
    }

    #[tokio::test]
    async fn test_refresh_applies_definitions_scoped_by_namespace() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new("team-a", "adapter", document(&[("rps", "q1")])))
            .await;
        source
            .upsert(ConfigObject::new("team-b", "adapter", document(&[("rps", "q2")])))
            .await;

        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.applied, 2);

        assert_eq!(store.lookup("team-a", "rps").await.unwrap().query_text, "q1");
        assert_eq!(store.lookup("team-b", "rps").await.unwrap().query_text, "q2");
        assert!(store.lookup("team-c", "rps").await.is_none());
        assert_eq!(store.list_names().await, vec!["team-a/rps", "team-b/rps"]);
    }

    #[tokio::test]
    async fn test_unchanged_marker_is_not_reparsed() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(object_with_marker("ns", "cfg", "rev-1", document(&[("m", "original")])))
            .await;
        store.refresh(&source).await.unwrap();

        // Same marker, different bytes: must be ignored.
        source
            .upsert(object_with_marker("ns", "cfg", "rev-1", document(&[("m", "changed")])))
            .await;
        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.applied, 0);
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "original");

        source
            .upsert(object_with_marker("ns", "cfg", "rev-2", document(&[("m", "changed")])))
            .await;
        store.refresh(&source).await.unwrap();
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "changed");
    }

    #[tokio::test]
    async fn test_disabled_objects_are_skipped() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        let mut object = ConfigObject::new("ns", "cfg", document(&[("m", "q")]));
        object.enabled = false;
        source.upsert(object).await;

        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.disabled, 1);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_is_isolated() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new("ns", "good", document(&[("a", "qa")])))
            .await;
        source
            .upsert(ConfigObject::new("ns", "bad", "queries:\n  - caql: q\n    bogus: 1\n"))
            .await;

        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
        assert!(store.lookup("ns", "a").await.is_some());

        // A broken revision keeps the definitions from the previous good one.
        source
            .upsert(ConfigObject::new("ns", "good", "queries: not-a-list"))
            .await;
        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(store.lookup("ns", "a").await.unwrap().query_text, "qa");
    }

    #[tokio::test]
    async fn test_last_write_wins_and_stale_entries_remain() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new(
                "ns",
                "cfg",
                document(&[("m", "first"), ("m", "second"), ("other", "o")]),
            ))
            .await;
        store.refresh(&source).await.unwrap();
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "second");

        // A new revision without "other" overwrites "m" but leaves "other" in place.
        source
            .upsert(ConfigObject::new("ns", "cfg", document(&[("m", "third")])))
            .await;
        store.refresh(&source).await.unwrap();
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "third");
        assert!(store.lookup("ns", "other").await.is_some());
        assert_eq!(store.list_names().await, vec!["ns/m", "ns/other"]);
    }

    #[tokio::test]
    async fn test_removed_objects_drop_their_entries() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new("ns", "one", document(&[("a", "qa")])))
            .await;
        source
            .upsert(ConfigObject::new("ns", "two", document(&[("b", "qb")])))
            .await;
        store.refresh(&source).await.unwrap();

        source.remove("ns", "one").await;
        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(store.list_names().await, vec!["ns/b"]);

        assert_eq!(store.remove_object("ns", "two").await, 1);
        assert!(store.snapshot().await.is_empty());
        assert_eq!(store.remove_object("ns", "two").await, 0);
    }

    #[tokio::test]
    async fn test_removal_falls_back_to_remaining_declaration() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new("ns", "a", document(&[("m", "from-a"), ("only-a", "qa")])))
            .await;
        store.refresh(&source).await.unwrap();
        source
            .upsert(ConfigObject::new("ns", "b", document(&[("m", "from-b")])))
            .await;
        store.refresh(&source).await.unwrap();
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "from-b");

        source.remove("ns", "b").await;
        store.refresh(&source).await.unwrap();
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "from-a");

        // Object a is unchanged, so later cycles leave the restored entry alone.
        let summary = store.refresh(&source).await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "from-a");

        // Removing a now drops both of its keys.
        assert_eq!(store.remove_object("ns", "a").await, 2);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_removal_prefers_latest_surviving_writer() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        for (name, caql) in [("a", "from-a"), ("b", "from-b"), ("c", "from-c")] {
            source
                .upsert(ConfigObject::new("ns", name, document(&[("m", caql)])))
                .await;
            store.refresh(&source).await.unwrap();
        }
        // Other namespaces never stand in.
        source
            .upsert(ConfigObject::new("other", "d", document(&[("m", "from-d")])))
            .await;
        store.refresh(&source).await.unwrap();

        assert_eq!(store.remove_object("ns", "c").await, 0);
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "from-b");

        // Removing a, which no longer owns the entry, changes nothing.
        assert_eq!(store.remove_object("ns", "a").await, 0);
        assert_eq!(store.lookup("ns", "m").await.unwrap().query_text, "from-b");

        assert_eq!(store.remove_object("ns", "b").await, 1);
        assert!(store.lookup("ns", "m").await.is_none());
        assert_eq!(store.lookup("other", "m").await.unwrap().query_text, "from-d");
    }

    #[tokio::test]
    async fn test_aggregate_is_normalized_in_store() {
        let store = ConfigStore::new(Metrics);
        let source = StaticConfigSource::new();
        source
            .upsert(ConfigObject::new(
                "ns",
                "cfg",
                "queries:\n  - caql: q\n    circonus_api_key: k\n    external_name: m\n    aggregate: p95\n",
            ))
            .await;
        store.refresh(&source).await.unwrap();
        assert_eq!(
            store.lookup("ns", "m").await.unwrap().aggregate,
            Aggregate::Average
        );
    }

    #[tokio::test]
    async fn test_readers_never_observe_partial_refresh() {
        let store = ConfigStore::new(Metrics);
        let source = Arc::new(StaticConfigSource::new());
        let names: Vec<String> = (0..20).map(|i| format!("metric-{}", i)).collect();

        let revision = |rev: usize| {
            let entries: Vec<(String, String)> = names
                .iter()
                .map(|name| (name.clone(), format!("rev-{}", rev)))
                .collect();
            let borrowed: Vec<(&str, &str)> = entries
                .iter()
                .map(|(n, q)| (n.as_str(), q.as_str()))
                .collect();
            document(&borrowed)
        };

        source.upsert(ConfigObject::new("ns", "cfg", revision(0))).await;
        store.refresh(source.as_ref()).await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = store.snapshot().await;
                    let revisions: std::collections::BTreeSet<String> = snapshot
                        .names()
                        .iter()
                        .filter_map(|key| key.strip_prefix("ns/"))
                        .filter_map(|name| snapshot.get("ns", name))
                        .map(|definition| definition.query_text.clone())
                        .collect();
                    assert_eq!(revisions.len(), 1, "mixed snapshot: {:?}", revisions);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for rev in 1..=20 {
            source.upsert(ConfigObject::new("ns", "cfg", revision(rev))).await;
            store.refresh(source.as_ref()).await.unwrap();
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
