//! Caching wrapper around an external persistent data store.
//!
//! The wrapper adapts the serialized [`PersistentDataStore`] contract to the
//! typed [`DataStore`] interface, adding three cache modes:
//!
//! - **off**: every call is a pass-through and errors propagate.
//! - **finite TTL**: read-through per-key and per-kind caches; writes go to
//!   the store first and refresh the cache on success.
//! - **infinite TTL**: the cache is authoritative. Writes land in the cache
//!   even when the store is down, and once the store comes back the whole
//!   cached snapshot is replayed via `init`.
//!
//! Any store error flips the wrapper to unavailable and starts a short-
//! interval probe loop; availability transitions are broadcast as
//! [`DataStoreStatus`] events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::broadcast::Broadcaster;
use crate::error::StoreError;
use crate::store::{
    DataKind, DataStore, DataStoreStatus, FullDataSet, ItemDescriptor, PersistentDataStore,
    SerializedDataSet, SerializedItemDescriptor,
};

/// Caching behaviour of the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Off,
    Ttl(Duration),
    Infinite,
}

impl CacheMode {
    fn caching(&self) -> bool {
        !matches!(self, CacheMode::Off)
    }

    fn fresh(&self, fetched: Instant) -> bool {
        match self {
            CacheMode::Off => false,
            CacheMode::Ttl(ttl) => fetched.elapsed() < *ttl,
            CacheMode::Infinite => true,
        }
    }
}

/// Interval between availability probes while the store is in an outage.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct PersistentStoreWrapper {
    inner: Arc<WrapperInner>,
}

struct WrapperInner {
    underlying: Arc<dyn PersistentDataStore>,
    mode: CacheMode,
    state: Mutex<CacheState>,
    available: AtomicBool,
    poller_running: AtomicBool,
    status_broadcasts: Arc<Broadcaster<DataStoreStatus>>,
    poll_interval: Duration,
    runtime: tokio::runtime::Handle,
}

#[derive(Default)]
struct CacheState {
    items: HashMap<(DataKind, String), CacheEntry>,
    /// Per-kind full snapshots; in infinite mode this is the authoritative
    /// data used for recovery replay.
    all: HashMap<DataKind, CachedAll>,
    initialized: Option<(bool, Instant)>,
    needs_replay: bool,
}

struct CacheEntry {
    /// `None` records a confirmed missing key.
    descriptor: Option<ItemDescriptor>,
    fetched: Instant,
}

struct CachedAll {
    items: HashMap<String, ItemDescriptor>,
    fetched: Instant,
}

impl PersistentStoreWrapper {
    /// Must be called from within a tokio runtime; the outage poller runs on
    /// it.
    pub fn new(
        underlying: Arc<dyn PersistentDataStore>,
        mode: CacheMode,
        status_broadcasts: Arc<Broadcaster<DataStoreStatus>>,
    ) -> PersistentStoreWrapper {
        Self::with_poll_interval(underlying, mode, status_broadcasts, STATUS_POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        underlying: Arc<dyn PersistentDataStore>,
        mode: CacheMode,
        status_broadcasts: Arc<Broadcaster<DataStoreStatus>>,
        poll_interval: Duration,
    ) -> PersistentStoreWrapper {
        PersistentStoreWrapper {
            inner: Arc::new(WrapperInner {
                underlying,
                mode,
                state: Mutex::new(CacheState::default()),
                available: AtomicBool::new(true),
                poller_running: AtomicBool::new(false),
                status_broadcasts,
                poll_interval,
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

impl WrapperInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("wrapper cache lock poisoned")
    }

    /// Marks the store unavailable (broadcasting the transition) and makes
    /// sure the probe loop is running.
    fn note_error(self: &Arc<Self>, error: &StoreError) {
        if self.available.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %error, "persistent store became unavailable");
            self.status_broadcasts.broadcast(DataStoreStatus {
                available: false,
                stale: false,
            });
        }
        if !self.poller_running.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(self);
            self.runtime.spawn(poll_until_available(weak));
        }
    }

    fn note_recovered(&self) {
        let replayed = if self.mode == CacheMode::Infinite {
            self.replay_cached_data()
        } else {
            false
        };
        if !replayed && self.mode == CacheMode::Infinite {
            // Replay failed; stay unavailable and keep probing.
            return;
        }
        self.available.store(true, Ordering::SeqCst);
        self.poller_running.store(false, Ordering::SeqCst);
        tracing::info!("persistent store is available again");
        self.status_broadcasts.broadcast(DataStoreStatus {
            available: true,
            // Without an authoritative cache, writes made during the outage
            // were lost; consumers should treat derived state as stale.
            stale: self.mode != CacheMode::Infinite,
        });
    }

    /// Writes the authoritative cached snapshot back to the recovered store.
    fn replay_cached_data(&self) -> bool {
        let payload: SerializedDataSet = {
            let state = self.lock_state();
            if !state.needs_replay {
                return true;
            }
            state
                .all
                .iter()
                .map(|(kind, cached)| {
                    (
                        *kind,
                        cached
                            .items
                            .iter()
                            .map(|(k, d)| (k.clone(), serialize_descriptor(*kind, d)))
                            .collect(),
                    )
                })
                .collect()
        };
        match self.underlying.init(payload) {
            Ok(()) => {
                self.lock_state().needs_replay = false;
                tracing::info!("replayed cached flag data into recovered persistent store");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to replay cached data into recovered store");
                false
            }
        }
    }

    fn deserialize(
        &self,
        kind: DataKind,
        serialized: SerializedItemDescriptor,
    ) -> Result<ItemDescriptor, StoreError> {
        if serialized.deleted {
            return Ok(ItemDescriptor::tombstone(serialized.version));
        }
        match serialized.serialized_item {
            Some(data) => kind.deserialize(&data),
            None => Ok(ItemDescriptor::tombstone(serialized.version)),
        }
    }

    fn fetch_item(
        self: &Arc<Self>,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<ItemDescriptor>, StoreError> {
        let fetched = self
            .underlying
            .get(kind, key)
            .map_err(|e| {
                self.note_error(&e);
                e
            })?
            .map(|s| self.deserialize(kind, s))
            .transpose()?;
        Ok(fetched)
    }
}

async fn poll_until_available(weak: Weak<WrapperInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let interval = inner.poll_interval;
        if inner.underlying.is_store_available() {
            inner.note_recovered();
            if inner.available.load(Ordering::SeqCst) {
                return;
            }
        }
        drop(inner);
        tokio::time::sleep(interval).await;
    }
}

fn serialize_descriptor(kind: DataKind, item: &ItemDescriptor) -> SerializedItemDescriptor {
    SerializedItemDescriptor {
        version: item.version,
        deleted: item.is_tombstone(),
        serialized_item: Some(kind.serialize(item)),
    }
}

impl DataStore for PersistentStoreWrapper {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let inner = &self.inner;
        let serialized: SerializedDataSet = data
            .iter()
            .map(|(kind, items)| {
                (
                    *kind,
                    items
                        .iter()
                        .map(|(k, d)| (k.clone(), serialize_descriptor(*kind, d)))
                        .collect(),
                )
            })
            .collect();
        let write_result = inner.underlying.init(serialized);

        match write_result {
            Ok(()) => {
                if inner.mode.caching() {
                    let mut state = inner.lock_state();
                    cache_full_data(&mut state, &data);
                    state.initialized = Some((true, Instant::now()));
                    state.needs_replay = false;
                }
                Ok(())
            }
            Err(e) => {
                inner.note_error(&e);
                if inner.mode == CacheMode::Infinite {
                    // The cache is authoritative: accept the data locally and
                    // replay it once the store recovers.
                    let mut state = inner.lock_state();
                    cache_full_data(&mut state, &data);
                    state.initialized = Some((true, Instant::now()));
                    state.needs_replay = true;
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        let inner = &self.inner;
        if inner.mode.caching() {
            let state = inner.lock_state();
            if let Some(entry) = state.items.get(&(kind, key.to_string())) {
                if inner.mode.fresh(entry.fetched) {
                    return Ok(entry.descriptor.clone());
                }
            }
        }
        let fetched = inner.fetch_item(kind, key)?;
        if inner.mode.caching() {
            inner.lock_state().items.insert(
                (kind, key.to_string()),
                CacheEntry {
                    descriptor: fetched.clone(),
                    fetched: Instant::now(),
                },
            );
        }
        Ok(fetched)
    }

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, ItemDescriptor>, StoreError> {
        let inner = &self.inner;
        if inner.mode.caching() {
            let state = inner.lock_state();
            if let Some(cached) = state.all.get(&kind) {
                if inner.mode.fresh(cached.fetched) {
                    return Ok(cached.items.clone());
                }
            }
        }
        let raw = inner.underlying.get_all(kind).map_err(|e| {
            inner.note_error(&e);
            e
        })?;
        let mut items = HashMap::with_capacity(raw.len());
        for (key, serialized) in raw {
            items.insert(key, inner.deserialize(kind, serialized)?);
        }
        if inner.mode.caching() {
            inner.lock_state().all.insert(
                kind,
                CachedAll {
                    items: items.clone(),
                    fetched: Instant::now(),
                },
            );
        }
        Ok(items)
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let serialized = serialize_descriptor(kind, &item);
        match inner.underlying.upsert(kind, key, serialized) {
            Ok(true) => {
                if inner.mode.caching() {
                    let mut state = inner.lock_state();
                    apply_write_to_cache(&mut state, inner.mode, kind, key, &item);
                }
                Ok(true)
            }
            Ok(false) => {
                if inner.mode.caching() {
                    // Someone else holds a newer version; re-read so the
                    // cache reflects the winner.
                    let current = inner.fetch_item(kind, key)?;
                    let mut state = inner.lock_state();
                    state.items.insert(
                        (kind, key.to_string()),
                        CacheEntry {
                            descriptor: current.clone(),
                            fetched: Instant::now(),
                        },
                    );
                    refresh_all_entry(&mut state, inner.mode, kind, key, current);
                }
                Ok(false)
            }
            Err(e) => {
                inner.note_error(&e);
                if inner.mode == CacheMode::Infinite {
                    let mut state = inner.lock_state();
                    let newer = state
                        .items
                        .get(&(kind, key.to_string()))
                        .and_then(|entry| entry.descriptor.as_ref())
                        .map_or(true, |cached| item.version > cached.version);
                    if newer {
                        apply_write_to_cache(&mut state, inner.mode, kind, key, &item);
                        state.needs_replay = true;
                    }
                    Ok(newer)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn is_initialized(&self) -> bool {
        let inner = &self.inner;
        {
            let state = inner.lock_state();
            match state.initialized {
                // Once initialized, always initialized.
                Some((true, _)) => return true,
                Some((false, checked)) if inner.mode.fresh(checked) => return false,
                _ => {}
            }
        }
        let result = inner.underlying.is_initialized();
        inner.lock_state().initialized = Some((result, Instant::now()));
        result
    }
}

fn cache_full_data(state: &mut CacheState, data: &FullDataSet) {
    state.items.clear();
    state.all.clear();
    let now = Instant::now();
    for (kind, items) in data {
        let mut all = HashMap::with_capacity(items.len());
        for (key, descriptor) in items {
            state.items.insert(
                (*kind, key.clone()),
                CacheEntry {
                    descriptor: Some(descriptor.clone()),
                    fetched: now,
                },
            );
            all.insert(key.clone(), descriptor.clone());
        }
        state.all.insert(
            *kind,
            CachedAll {
                items: all,
                fetched: now,
            },
        );
    }
}

fn apply_write_to_cache(
    state: &mut CacheState,
    mode: CacheMode,
    kind: DataKind,
    key: &str,
    item: &ItemDescriptor,
) {
    state.items.insert(
        (kind, key.to_string()),
        CacheEntry {
            descriptor: Some(item.clone()),
            fetched: Instant::now(),
        },
    );
    refresh_all_entry(state, mode, kind, key, Some(item.clone()));
}

/// A write invalidates the cached per-kind snapshot in TTL mode; in infinite
/// mode the snapshot is authoritative and is edited in place instead.
fn refresh_all_entry(
    state: &mut CacheState,
    mode: CacheMode,
    kind: DataKind,
    key: &str,
    item: Option<ItemDescriptor>,
) {
    if mode == CacheMode::Infinite {
        if let Some(cached) = state.all.get_mut(&kind) {
            match item {
                Some(d) => {
                    cached.items.insert(key.to_string(), d);
                }
                None => {
                    cached.items.remove(key);
                }
            }
        }
    } else {
        state.all.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flag_engine_core::model::FeatureFlag;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// In-memory fake of the serialized persistent contract, with toggleable
    /// failure injection.
    #[derive(Default)]
    struct FakePersistentStore {
        data: Mutex<HashMap<(DataKind, String), SerializedItemDescriptor>>,
        initialized: AtomicBool,
        failing: AtomicBool,
        gets: AtomicUsize,
        inits: AtomicUsize,
    }

    impl FakePersistentStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::unavailable("injected failure"))
            } else {
                Ok(())
            }
        }
    }

    impl PersistentDataStore for FakePersistentStore {
        fn init(&self, data: SerializedDataSet) -> Result<(), StoreError> {
            self.check()?;
            self.inits.fetch_add(1, Ordering::SeqCst);
            let mut map = self.data.lock().unwrap();
            map.clear();
            for (kind, items) in data {
                for (key, item) in items {
                    map.insert((kind, key), item);
                }
            }
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn get(
            &self,
            kind: DataKind,
            key: &str,
        ) -> Result<Option<SerializedItemDescriptor>, StoreError> {
            self.check()?;
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.lock().unwrap().get(&(kind, key.to_string())).cloned())
        }

        fn get_all(
            &self,
            kind: DataKind,
        ) -> Result<Vec<(String, SerializedItemDescriptor)>, StoreError> {
            self.check()?;
            Ok(self
                .data
                .lock()
                .unwrap()
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, key), item)| (key.clone(), item.clone()))
                .collect())
        }

        fn upsert(
            &self,
            kind: DataKind,
            key: &str,
            item: SerializedItemDescriptor,
        ) -> Result<bool, StoreError> {
            self.check()?;
            let mut map = self.data.lock().unwrap();
            let slot = (kind, key.to_string());
            match map.get(&slot) {
                Some(existing) if existing.version >= item.version => Ok(false),
                _ => {
                    map.insert(slot, item);
                    Ok(true)
                }
            }
        }

        fn is_initialized(&self) -> bool {
            self.initialized.load(Ordering::SeqCst)
        }

        fn is_store_available(&self) -> bool {
            !self.failing.load(Ordering::SeqCst)
        }
    }

    fn flag_descriptor(key: &str, version: u64) -> ItemDescriptor {
        let mut flag: FeatureFlag = serde_json::from_value(json!({
            "key": key, "version": version, "on": false, "variations": [true], "salt": "s"
        }))
        .unwrap();
        flag.preprocess();
        ItemDescriptor::flag(flag)
    }

    fn full_data(entries: &[(&str, u64)]) -> FullDataSet {
        vec![
            (DataKind::Segments, vec![]),
            (
                DataKind::Features,
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), flag_descriptor(k, *v)))
                    .collect(),
            ),
        ]
    }

    fn wrapper(
        store: &Arc<FakePersistentStore>,
        mode: CacheMode,
    ) -> (PersistentStoreWrapper, Arc<Broadcaster<DataStoreStatus>>) {
        let broadcaster = Arc::new(Broadcaster::new());
        let w = PersistentStoreWrapper::with_poll_interval(
            store.clone() as Arc<dyn PersistentDataStore>,
            mode,
            broadcaster.clone(),
            Duration::from_millis(20),
        );
        (w, broadcaster)
    }

    #[tokio::test]
    async fn uncached_reads_pass_through() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Off);
        w.init(full_data(&[("f", 1)])).unwrap();
        assert!(w.get(DataKind::Features, "f").unwrap().is_some());
        assert!(w.get(DataKind::Features, "f").unwrap().is_some());
        // Every read hits the store.
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_reads_hit_store_once() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        w.init(full_data(&[("f", 1)])).unwrap();
        for _ in 0..5 {
            assert!(w.get(DataKind::Features, "f").unwrap().is_some());
        }
        // Init pre-populated the cache, so the store was never read.
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
        // Missing keys are cached too.
        assert!(w.get(DataKind::Features, "ghost").unwrap().is_none());
        assert!(w.get(DataKind::Features, "ghost").unwrap().is_none());
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_refetches() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_millis(10)));
        w.init(full_data(&[("f", 1)])).unwrap();
        assert!(w.get(DataKind::Features, "f").unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(w.get(DataKind::Features, "f").unwrap().is_some());
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_upsert_refreshes_cache_from_store() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        w.init(full_data(&[("f", 5)])).unwrap();
        // A stale write is rejected and the store's winner re-cached.
        assert!(!w.upsert(DataKind::Features, "f", flag_descriptor("f", 3)).unwrap());
        let cached = w.get(DataKind::Features, "f").unwrap().unwrap();
        assert_eq!(cached.version, 5);
    }

    #[tokio::test]
    async fn upsert_updates_cache_and_get_all() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        w.init(full_data(&[("f", 1)])).unwrap();
        assert_eq!(w.get_all(DataKind::Features).unwrap().len(), 1);
        assert!(w.upsert(DataKind::Features, "g", flag_descriptor("g", 1)).unwrap());
        let all = w.get_all(DataKind::Features).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("g"));
    }

    #[tokio::test]
    async fn error_flips_availability_and_recovers() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, broadcaster) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            broadcaster.add_listener(move |s: &DataStoreStatus| {
                events.lock().unwrap().push(*s);
            });
        }
        w.init(full_data(&[("f", 1)])).unwrap();

        store.failing.store(true, Ordering::SeqCst);
        assert!(w.get(DataKind::Features, "ghost").is_err());
        assert!(!w.is_available());

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(w.is_available());
        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                DataStoreStatus { available: false, stale: false },
                DataStoreStatus { available: true, stale: true },
            ]
        );
    }

    #[tokio::test]
    async fn infinite_mode_serves_writes_through_outage_and_replays() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, broadcaster) = wrapper(&store, CacheMode::Infinite);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            broadcaster.add_listener(move |s: &DataStoreStatus| {
                events.lock().unwrap().push(*s);
            });
        }
        w.init(full_data(&[("f", 1)])).unwrap();
        let inits_before = store.inits.load(Ordering::SeqCst);

        store.failing.store(true, Ordering::SeqCst);
        // Write during the outage is absorbed by the authoritative cache.
        assert!(w.upsert(DataKind::Features, "f", flag_descriptor("f", 2)).unwrap());
        assert_eq!(w.get(DataKind::Features, "f").unwrap().unwrap().version, 2);
        assert_eq!(w.get_all(DataKind::Features).unwrap()["f"].version, 2);

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(w.is_available());
        // Recovery replayed the cached snapshot via init.
        assert!(store.inits.load(Ordering::SeqCst) > inits_before);
        let replayed = store
            .get(DataKind::Features, "f")
            .unwrap()
            .expect("replayed item");
        assert_eq!(replayed.version, 2);
        let events = events.lock().unwrap().clone();
        assert_eq!(
            events.last().unwrap(),
            &DataStoreStatus { available: true, stale: false }
        );
    }

    #[tokio::test]
    async fn infinite_mode_init_failure_is_absorbed() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Infinite);
        store.failing.store(true, Ordering::SeqCst);
        w.init(full_data(&[("f", 1)])).unwrap();
        assert!(w.is_initialized());
        assert_eq!(w.get(DataKind::Features, "f").unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn finite_mode_init_failure_propagates() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        store.failing.store(true, Ordering::SeqCst);
        assert!(w.init(full_data(&[("f", 1)])).is_err());
    }

    #[tokio::test]
    async fn initialized_flag_is_sticky() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Ttl(Duration::from_secs(30)));
        assert!(!w.is_initialized());
        w.init(full_data(&[])).unwrap();
        assert!(w.is_initialized());
        // Underlying opinion no longer matters once true was observed.
        store.initialized.store(false, Ordering::SeqCst);
        assert!(w.is_initialized());
    }

    #[tokio::test]
    async fn tombstones_round_trip_through_persistence() {
        let store = Arc::new(FakePersistentStore::default());
        let (w, _) = wrapper(&store, CacheMode::Off);
        w.init(full_data(&[])).unwrap();
        assert!(w.upsert(DataKind::Features, "f", ItemDescriptor::tombstone(4)).unwrap());
        let read = w.get(DataKind::Features, "f").unwrap().unwrap();
        assert!(read.is_tombstone());
        assert_eq!(read.version, 4);
    }
}
