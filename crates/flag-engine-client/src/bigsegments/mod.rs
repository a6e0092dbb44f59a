//! # Big Segments
//!
//! A big segment's membership lives out-of-band in a key/value store and is
//! fetched per context at evaluation time. The wrapper here adds a bounded
//! LRU cache over those lookups and a background poller that derives the
//! store's freshness status from its metadata record.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::watch;

use flag_engine_core::membership::{BigSegmentLookup, BigSegmentProvider, Membership};
use flag_engine_core::reason::BigSegmentsStatus;

use crate::broadcast::Broadcaster;
use crate::error::StoreError;

/// Metadata kept alongside big-segment data by whatever process writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// When the store contents were last confirmed up to date.
    pub last_up_to_date: Option<DateTime<Utc>>,
}

/// The external big-segment store contract.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, StoreError>;

    /// Membership for one context key, or `None` when the store has no
    /// record of it.
    fn get_membership(&self, context_key: &str) -> Result<Option<Membership>, StoreError>;
}

/// Availability/freshness of the big-segment store, broadcast on change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    /// True when metadata is missing or older than the configured
    /// `stale_after` window.
    pub stale: bool,
}

pub struct BigSegmentStoreWrapper {
    inner: Arc<WrapperInner>,
    shutdown_tx: watch::Sender<bool>,
}

struct WrapperInner {
    store: Arc<dyn BigSegmentStore>,
    cache: Mutex<LruCache<String, CachedMembership>>,
    cache_ttl: Duration,
    stale_after: Duration,
    status: Mutex<Option<BigSegmentStoreStatus>>,
    status_broadcasts: Arc<Broadcaster<BigSegmentStoreStatus>>,
}

struct CachedMembership {
    membership: Arc<Membership>,
    fetched: Instant,
}

impl BigSegmentStoreWrapper {
    /// Must be called from within a tokio runtime; the status poller runs on
    /// it.
    pub fn new(
        store: Arc<dyn BigSegmentStore>,
        context_cache_size: usize,
        context_cache_time: Duration,
        status_poll_interval: Duration,
        stale_after: Duration,
        status_broadcasts: Arc<Broadcaster<BigSegmentStoreStatus>>,
    ) -> BigSegmentStoreWrapper {
        let capacity = NonZeroUsize::new(context_cache_size.max(1)).expect("non-zero");
        let inner = Arc::new(WrapperInner {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            cache_ttl: context_cache_time,
            stale_after,
            status: Mutex::new(None),
            status_broadcasts,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(poll_status_loop(
            Arc::downgrade(&inner),
            status_poll_interval,
            shutdown_rx,
        ));
        BigSegmentStoreWrapper { inner, shutdown_tx }
    }

    /// The latest polled status, polling synchronously if no poll has
    /// happened yet.
    pub fn status(&self) -> BigSegmentStoreStatus {
        if let Some(status) = *self.inner.status.lock().expect("status lock") {
            return status;
        }
        self.inner.poll_status()
    }

    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl WrapperInner {
    fn derive_status(&self) -> BigSegmentStoreStatus {
        match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: metadata.last_up_to_date.map_or(true, |t| {
                    Utc::now()
                        .signed_duration_since(t)
                        .to_std()
                        .map_or(false, |age| age > self.stale_after)
                }),
            },
            Err(e) => {
                tracing::warn!(error = %e, "big segment store metadata poll failed");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        }
    }

    /// Re-derives the status, broadcasting if it changed.
    fn poll_status(&self) -> BigSegmentStoreStatus {
        let next = self.derive_status();
        let mut current = self.status.lock().expect("status lock");
        let changed = *current != Some(next);
        *current = Some(next);
        drop(current);
        if changed {
            tracing::info!(
                available = next.available,
                stale = next.stale,
                "big segment store status changed"
            );
            self.status_broadcasts.broadcast(next);
        }
        next
    }

    fn lookup_status(&self) -> BigSegmentsStatus {
        match *self.status.lock().expect("status lock") {
            Some(BigSegmentStoreStatus { available: false, .. }) => BigSegmentsStatus::StoreError,
            Some(BigSegmentStoreStatus { stale: true, .. }) => BigSegmentsStatus::Stale,
            _ => BigSegmentsStatus::Healthy,
        }
    }
}

async fn poll_status_loop(
    weak: Weak<WrapperInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        inner.poll_status();
        drop(inner);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

impl BigSegmentProvider for BigSegmentStoreWrapper {
    fn query_membership(&self, context_key: &str) -> BigSegmentLookup {
        let inner = &self.inner;
        {
            let mut cache = inner.cache.lock().expect("membership cache lock");
            if let Some(cached) = cache.get(context_key) {
                if cached.fetched.elapsed() < inner.cache_ttl {
                    return BigSegmentLookup {
                        membership: Some(cached.membership.clone()),
                        status: inner.lookup_status(),
                    };
                }
            }
        }
        match inner.store.get_membership(context_key) {
            Ok(membership) => {
                let membership = Arc::new(membership.unwrap_or_default());
                inner.cache.lock().expect("membership cache lock").put(
                    context_key.to_string(),
                    CachedMembership {
                        membership: membership.clone(),
                        fetched: Instant::now(),
                    },
                );
                BigSegmentLookup {
                    membership: Some(membership),
                    status: inner.lookup_status(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, context_key, "big segment membership lookup failed");
                BigSegmentLookup {
                    membership: None,
                    status: BigSegmentsStatus::StoreError,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeBigSegmentStore {
        memberships: Mutex<HashMap<String, Membership>>,
        last_up_to_date: Mutex<Option<DateTime<Utc>>>,
        failing: AtomicBool,
        membership_queries: AtomicUsize,
    }

    impl FakeBigSegmentStore {
        fn new() -> Arc<FakeBigSegmentStore> {
            Arc::new(FakeBigSegmentStore {
                memberships: Mutex::new(HashMap::new()),
                last_up_to_date: Mutex::new(Some(Utc::now())),
                failing: AtomicBool::new(false),
                membership_queries: AtomicUsize::new(0),
            })
        }

        fn set_membership(&self, key: &str, refs: &[(&str, bool)]) {
            let membership = Membership::new(
                refs.iter().map(|(r, v)| (r.to_string(), *v)).collect(),
            );
            self.memberships.lock().unwrap().insert(key.to_string(), membership);
        }
    }

    impl BigSegmentStore for FakeBigSegmentStore {
        fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("metadata probe failed"));
            }
            Ok(BigSegmentStoreMetadata {
                last_up_to_date: *self.last_up_to_date.lock().unwrap(),
            })
        }

        fn get_membership(&self, context_key: &str) -> Result<Option<Membership>, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("lookup failed"));
            }
            self.membership_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.memberships.lock().unwrap().get(context_key).cloned())
        }
    }

    fn wrapper_with(
        store: &Arc<FakeBigSegmentStore>,
        cache_size: usize,
    ) -> (BigSegmentStoreWrapper, Arc<Broadcaster<BigSegmentStoreStatus>>) {
        let broadcaster = Arc::new(Broadcaster::new());
        let w = BigSegmentStoreWrapper::new(
            store.clone() as Arc<dyn BigSegmentStore>,
            cache_size,
            Duration::from_secs(30),
            Duration::from_millis(20),
            Duration::from_secs(120),
            broadcaster.clone(),
        );
        (w, broadcaster)
    }

    #[tokio::test]
    async fn membership_lookup_is_cached() {
        let store = FakeBigSegmentStore::new();
        store.set_membership("u", &[("s.g1", true)]);
        let (w, _) = wrapper_with(&store, 10);
        for _ in 0..3 {
            let lookup = w.query_membership("u");
            assert_eq!(
                lookup.membership.unwrap().included("s.g1"),
                Some(true)
            );
        }
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 1);
        w.close();
    }

    #[tokio::test]
    async fn unknown_context_caches_empty_membership() {
        let store = FakeBigSegmentStore::new();
        let (w, _) = wrapper_with(&store, 10);
        let lookup = w.query_membership("nobody");
        assert!(lookup.membership.unwrap().is_empty());
        w.query_membership("nobody");
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 1);
        w.close();
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let store = FakeBigSegmentStore::new();
        let (w, _) = wrapper_with(&store, 3);
        for key in ["k1", "k2", "k3"] {
            w.query_membership(key);
        }
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 3);
        // Adding k4 evicts k1.
        w.query_membership("k4");
        // k2 is still cached; touching it promotes it.
        w.query_membership("k2");
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 4);
        // k1 was evicted: re-adding hits the store and evicts k3 (now the
        // least recent).
        w.query_membership("k1");
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 5);
        w.query_membership("k3");
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 6);
        // k2 survived all of it.
        w.query_membership("k2");
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 6);
        w.close();
    }

    #[tokio::test]
    async fn status_reflects_metadata_freshness() {
        let store = FakeBigSegmentStore::new();
        let (w, _) = wrapper_with(&store, 10);
        assert_eq!(
            w.status(),
            BigSegmentStoreStatus { available: true, stale: false }
        );

        *store.last_up_to_date.lock().unwrap() =
            Some(Utc::now() - chrono::Duration::seconds(600));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            w.status(),
            BigSegmentStoreStatus { available: true, stale: true }
        );

        *store.last_up_to_date.lock().unwrap() = None;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(w.status().stale);
        w.close();
    }

    #[tokio::test]
    async fn metadata_failure_flips_availability_and_broadcasts() {
        let store = FakeBigSegmentStore::new();
        let (w, broadcaster) = wrapper_with(&store, 10);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            broadcaster.add_listener(move |s: &BigSegmentStoreStatus| {
                events.lock().unwrap().push(*s);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!w.status().available);

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(w.status().available);

        let events = events.lock().unwrap().clone();
        assert!(events.contains(&BigSegmentStoreStatus { available: false, stale: false }));
        assert_eq!(
            events.last().unwrap(),
            &BigSegmentStoreStatus { available: true, stale: false }
        );
        w.close();
    }

    #[tokio::test]
    async fn membership_error_reports_store_error_status() {
        let store = FakeBigSegmentStore::new();
        let (w, _) = wrapper_with(&store, 10);
        store.failing.store(true, Ordering::SeqCst);
        let lookup = w.query_membership("u");
        assert!(lookup.membership.is_none());
        assert_eq!(lookup.status, BigSegmentsStatus::StoreError);
        w.close();
    }
}
