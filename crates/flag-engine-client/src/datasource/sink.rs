//! The commit path between data sources and the store.
//!
//! `UpdateSinkImpl` is the only writer of flag data: it normalises payloads,
//! applies them to the configured store, maintains the dependency graph,
//! broadcasts flag-change events for everything affected, and runs the
//! data-source status machine including outage log aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::broadcast::{Broadcaster, FlagChangeEvent};
use crate::datasource::{
    DataSourceError, DataSourceState, DataSourceStatus, UpdateSink,
};
use crate::error::StoreError;
use crate::store::dependency::{sort_data_set, DependencyTracker, KindKey};
use crate::store::{DataKind, DataStore, FullDataSet, ItemDescriptor};

pub struct UpdateSinkImpl {
    store: Arc<dyn DataStore>,
    dependencies: Mutex<DependencyTracker>,
    flag_changes: Arc<Broadcaster<FlagChangeEvent>>,
    status_broadcasts: Arc<Broadcaster<DataSourceStatus>>,
    status: Mutex<DataSourceStatus>,
    outage: Arc<Mutex<OutageTracker>>,
    outage_log_after: Duration,
    runtime: tokio::runtime::Handle,
}

impl UpdateSinkImpl {
    pub fn new(
        store: Arc<dyn DataStore>,
        flag_changes: Arc<Broadcaster<FlagChangeEvent>>,
        status_broadcasts: Arc<Broadcaster<DataSourceStatus>>,
        outage_log_after: Duration,
    ) -> UpdateSinkImpl {
        UpdateSinkImpl {
            store,
            dependencies: Mutex::new(DependencyTracker::new()),
            flag_changes,
            status_broadcasts,
            status: Mutex::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            outage: Arc::new(Mutex::new(OutageTracker::default())),
            outage_log_after,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn current_status(&self) -> DataSourceStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    fn broadcast_affected(&self, affected: HashSet<KindKey>) {
        for (kind, key) in affected {
            if kind == DataKind::Features {
                self.flag_changes.broadcast(FlagChangeEvent { key });
            }
        }
    }

    /// Snapshot of `kind -> key -> version` for diffing inits. Best-effort: a
    /// store read failure just means every incoming key counts as changed.
    fn current_versions(&self) -> HashMap<KindKey, u64> {
        let mut versions = HashMap::new();
        for kind in DataKind::ALL {
            if let Ok(items) = self.store.get_all(kind) {
                for (key, desc) in items {
                    versions.insert((kind, key), desc.version);
                }
            }
        }
        versions
    }
}

impl UpdateSink for UpdateSinkImpl {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let sorted = sort_data_set(data);
        let old_versions = self.current_versions();
        self.store.init(sorted.clone())?;

        let mut dependencies = self.dependencies.lock().expect("dependency lock poisoned");
        dependencies.clear();
        let mut new_keys = HashSet::new();
        for (kind, items) in &sorted {
            for (key, item) in items {
                dependencies.update_from(*kind, key, item);
                new_keys.insert((*kind, key.clone()));
            }
        }

        // Changed = added, removed, or version-bumped, expanded through the
        // dependency graph.
        let mut affected = HashSet::new();
        for (kind, items) in &sorted {
            for (key, item) in items {
                let kk = (*kind, key.clone());
                if old_versions.get(&kk) != Some(&item.version) {
                    dependencies.add_affected(&kk, &mut affected);
                }
            }
        }
        for kk in old_versions.keys() {
            if !new_keys.contains(kk) {
                dependencies.add_affected(kk, &mut affected);
            }
        }
        drop(dependencies);
        self.broadcast_affected(affected);
        Ok(())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let applied = self.store.upsert(kind, key, item.clone())?;
        if applied {
            let mut dependencies = self.dependencies.lock().expect("dependency lock poisoned");
            dependencies.update_from(kind, key, &item);
            let mut affected = HashSet::new();
            dependencies.add_affected(&(kind, key.to_string()), &mut affected);
            drop(dependencies);
            self.broadcast_affected(affected);
        }
        Ok(applied)
    }

    fn update_status(&self, state: DataSourceState, error: Option<DataSourceError>) {
        let mut status = self.status.lock().expect("status lock poisoned");
        if status.state == DataSourceState::Off {
            return;
        }
        // INTERRUPTED before the first valid payload is still INITIALIZING;
        // the error is recorded either way.
        let new_state = if state == DataSourceState::Interrupted
            && status.state == DataSourceState::Initializing
        {
            DataSourceState::Initializing
        } else {
            state
        };
        let changed = new_state != status.state;
        if changed {
            status.state = new_state;
            status.state_since = Utc::now();
        }
        if let Some(e) = &error {
            status.last_error = Some(e.clone());
        }
        let snapshot = status.clone();
        drop(status);

        self.track_outage(new_state, error);
        if changed {
            self.status_broadcasts.broadcast(snapshot);
        }
    }
}

impl UpdateSinkImpl {
    fn track_outage(&self, state: DataSourceState, error: Option<DataSourceError>) {
        let mut outage = self.outage.lock().expect("outage lock poisoned");
        match state {
            DataSourceState::Interrupted => {
                let newly_started = outage.active.is_none();
                let generation = outage.generation.wrapping_add(1);
                if newly_started {
                    outage.generation = generation;
                    outage.active = Some(OutageState {
                        started: Instant::now(),
                        generation,
                        error_counts: HashMap::new(),
                    });
                }
                if let (Some(active), Some(e)) = (&mut outage.active, error) {
                    *active.error_counts.entry(e.aggregation_key()).or_insert(0) += 1;
                }
                if newly_started {
                    let tracker = self.outage.clone();
                    let delay = self.outage_log_after;
                    self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let outage = tracker.lock().expect("outage lock poisoned");
                        if let Some(active) = &outage.active {
                            if active.generation == generation {
                                let mut errors: Vec<String> = active
                                    .error_counts
                                    .iter()
                                    .map(|(k, n)| format!("{} ({})", k, n))
                                    .collect();
                                errors.sort();
                                tracing::error!(
                                    duration_secs = active.started.elapsed().as_secs(),
                                    errors = %errors.join(", "),
                                    "data source outage has exceeded the tolerance threshold"
                                );
                            }
                        }
                    });
                }
            }
            DataSourceState::Valid => {
                // Recovered before the threshold fired: nothing is logged.
                outage.active = None;
            }
            DataSourceState::Initializing | DataSourceState::Off => {
                if let (Some(active), Some(e)) = (&mut outage.active, error) {
                    *active.error_counts.entry(e.aggregation_key()).or_insert(0) += 1;
                }
            }
        }
    }
}

#[derive(Default)]
struct OutageTracker {
    active: Option<OutageState>,
    generation: u64,
}

struct OutageState {
    started: Instant,
    generation: u64,
    error_counts: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceErrorKind;
    use crate::store::memory::InMemoryDataStore;
    use flag_engine_core::model::FeatureFlag;
    use serde_json::json;
    use std::time::Duration;

    fn flag_descriptor(key: &str, version: u64, prereqs: &[&str]) -> ItemDescriptor {
        let mut flag: FeatureFlag = serde_json::from_value(json!({
            "key": key,
            "version": version,
            "on": true,
            "variations": [true],
            "fallthrough": {"variation": 0},
            "prerequisites": prereqs.iter().map(|p| json!({"key": p, "variation": 0})).collect::<Vec<_>>(),
            "salt": "s"
        }))
        .unwrap();
        flag.preprocess();
        ItemDescriptor::flag(flag)
    }

    fn sink_with_listener() -> (
        Arc<UpdateSinkImpl>,
        Arc<Broadcaster<FlagChangeEvent>>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let store = Arc::new(InMemoryDataStore::new());
        let flag_changes = Arc::new(Broadcaster::new());
        let status = Arc::new(Broadcaster::new());
        let sink = Arc::new(UpdateSinkImpl::new(
            store,
            flag_changes.clone(),
            status,
            Duration::from_secs(60),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            flag_changes.add_listener(move |e: &FlagChangeEvent| {
                seen.lock().unwrap().push(e.key.clone());
            });
        }
        (sink, flag_changes, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn patch_after_put_emits_exactly_one_change() {
        let (sink, _b, seen) = sink_with_listener();
        sink.init(vec![(
            DataKind::Features,
            vec![
                ("a".to_string(), flag_descriptor("a", 1, &[])),
                ("b".to_string(), flag_descriptor("b", 1, &[])),
            ],
        )])
        .unwrap();
        settle().await;
        seen.lock().unwrap().clear();

        sink.upsert(DataKind::Features, "a", flag_descriptor("a", 2, &[]))
            .unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn stale_upsert_emits_nothing() {
        let (sink, _b, seen) = sink_with_listener();
        sink.upsert(DataKind::Features, "a", flag_descriptor("a", 5, &[]))
            .unwrap();
        settle().await;
        seen.lock().unwrap().clear();
        assert!(!sink
            .upsert(DataKind::Features, "a", flag_descriptor("a", 5, &[]))
            .unwrap());
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_to_prerequisite_fans_out() {
        let (sink, _b, seen) = sink_with_listener();
        sink.init(vec![(
            DataKind::Features,
            vec![
                ("top".to_string(), flag_descriptor("top", 1, &["dep"])),
                ("dep".to_string(), flag_descriptor("dep", 1, &[])),
            ],
        )])
        .unwrap();
        settle().await;
        seen.lock().unwrap().clear();

        sink.upsert(DataKind::Features, "dep", flag_descriptor("dep", 2, &[]))
            .unwrap();
        settle().await;
        let mut keys = seen.lock().unwrap().clone();
        keys.sort();
        assert_eq!(keys, vec!["dep".to_string(), "top".to_string()]);
    }

    #[tokio::test]
    async fn init_diff_only_reports_changed_keys() {
        let (sink, _b, seen) = sink_with_listener();
        sink.init(vec![(
            DataKind::Features,
            vec![
                ("a".to_string(), flag_descriptor("a", 1, &[])),
                ("b".to_string(), flag_descriptor("b", 1, &[])),
            ],
        )])
        .unwrap();
        settle().await;
        seen.lock().unwrap().clear();

        // Second full payload: a bumped, b unchanged, c added.
        sink.init(vec![(
            DataKind::Features,
            vec![
                ("a".to_string(), flag_descriptor("a", 2, &[])),
                ("b".to_string(), flag_descriptor("b", 1, &[])),
                ("c".to_string(), flag_descriptor("c", 1, &[])),
            ],
        )])
        .unwrap();
        settle().await;
        let mut keys = seen.lock().unwrap().clone();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn status_machine_transitions() {
        let (sink, _b, _seen) = sink_with_listener();
        assert_eq!(sink.current_status().state, DataSourceState::Initializing);

        // A recoverable error before first payload stays INITIALIZING but
        // records the error.
        sink.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceError::new(DataSourceErrorKind::NetworkError, "io")),
        );
        let status = sink.current_status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(
            status.last_error.unwrap().kind,
            DataSourceErrorKind::NetworkError
        );

        sink.update_status(DataSourceState::Valid, None);
        assert_eq!(sink.current_status().state, DataSourceState::Valid);

        sink.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceError::http(503)),
        );
        assert_eq!(sink.current_status().state, DataSourceState::Interrupted);

        sink.update_status(DataSourceState::Valid, None);
        assert_eq!(sink.current_status().state, DataSourceState::Valid);

        // OFF is terminal.
        sink.update_status(
            DataSourceState::Off,
            Some(DataSourceError::http(401)),
        );
        assert_eq!(sink.current_status().state, DataSourceState::Off);
        sink.update_status(DataSourceState::Valid, None);
        assert_eq!(sink.current_status().state, DataSourceState::Off);
    }

    #[tokio::test]
    async fn status_changes_are_broadcast() {
        let store = Arc::new(InMemoryDataStore::new());
        let status_broadcaster = Arc::new(Broadcaster::new());
        let sink = UpdateSinkImpl::new(
            store,
            Arc::new(Broadcaster::new()),
            status_broadcaster.clone(),
            Duration::from_secs(60),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            status_broadcaster.add_listener(move |s: &DataSourceStatus| {
                seen.lock().unwrap().push(s.state);
            });
        }
        sink.update_status(DataSourceState::Valid, None);
        sink.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceError::http(500)),
        );
        // Same state again: no broadcast.
        sink.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceError::http(500)),
        );
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![DataSourceState::Valid, DataSourceState::Interrupted]
        );
    }
}
