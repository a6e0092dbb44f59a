//! # Data Stores
//!
//! The versioned storage layer behind evaluation. Data is namespaced by
//! [`DataKind`] (flags, segments) and addressed by key; every item carries a
//! version, and deletion is a tombstone, never removal. Writes are monotonic:
//! an upsert only lands if its version is strictly newer than what is stored.
//!
//! Two storage contracts exist:
//! - [`DataStore`]: the typed, in-process interface the rest of the runtime
//!   uses ([`memory::InMemoryDataStore`] or [`persistent::PersistentStoreWrapper`]).
//! - [`PersistentDataStore`]: the serialized-bytes contract implemented by
//!   external database integrations and wrapped by the caching layer.

pub mod dependency;
pub mod memory;
pub mod persistent;

use std::collections::HashMap;
use std::sync::Arc;

use flag_engine_core::model::{FeatureFlag, Segment};

use crate::error::StoreError;

/// The namespaces of storable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    /// Segments load before flags so that an initialized store never holds a
    /// flag whose segment references dangle.
    Segments,
    Features,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Segments, DataKind::Features];

    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Serializes an item descriptor for a persistent store. Tombstones use a
    /// placeholder object so stores without metadata columns round-trip
    /// deletions.
    pub fn serialize(&self, item: &ItemDescriptor) -> String {
        match &item.item {
            Some(StoreItem::Flag(f)) => serde_json::to_string(f.as_ref())
                .unwrap_or_else(|_| self.deleted_placeholder(item.version)),
            Some(StoreItem::Segment(s)) => serde_json::to_string(s.as_ref())
                .unwrap_or_else(|_| self.deleted_placeholder(item.version)),
            None => self.deleted_placeholder(item.version),
        }
    }

    /// Parses stored bytes back into a descriptor, preprocessing as needed.
    /// The placeholder produced by [`DataKind::serialize`] parses back into a
    /// tombstone.
    pub fn deserialize(&self, data: &str) -> Result<ItemDescriptor, StoreError> {
        match self {
            DataKind::Features => {
                let mut flag: FeatureFlag = serde_json::from_str(data)
                    .map_err(|e| StoreError::invalid(e.to_string()))?;
                if flag.deleted {
                    return Ok(ItemDescriptor::tombstone(flag.version));
                }
                flag.preprocess();
                Ok(ItemDescriptor::flag(flag))
            }
            DataKind::Segments => {
                let mut segment: Segment = serde_json::from_str(data)
                    .map_err(|e| StoreError::invalid(e.to_string()))?;
                if segment.deleted {
                    return Ok(ItemDescriptor::tombstone(segment.version));
                }
                segment.preprocess();
                Ok(ItemDescriptor::segment(segment))
            }
        }
    }

    pub fn deleted_placeholder(&self, version: u64) -> String {
        format!("{{\"key\":\"$deleted\",\"version\":{},\"deleted\":true}}", version)
    }
}

/// A stored item: a flag or a segment, shared behind `Arc` between the store
/// and everything holding evaluation results.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
}

impl StoreItem {
    pub fn as_flag(&self) -> Option<&Arc<FeatureFlag>> {
        match self {
            StoreItem::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            StoreItem::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_flag(self) -> Option<Arc<FeatureFlag>> {
        match self {
            StoreItem::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_segment(self) -> Option<Arc<Segment>> {
        match self {
            StoreItem::Segment(s) => Some(s),
            _ => None,
        }
    }
}

/// A versioned item slot: either live data or a tombstone recording the
/// version at which the item was deleted.
#[derive(Debug, Clone)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<StoreItem>,
}

impl ItemDescriptor {
    pub fn flag(flag: FeatureFlag) -> ItemDescriptor {
        ItemDescriptor {
            version: flag.version,
            item: Some(StoreItem::Flag(Arc::new(flag))),
        }
    }

    pub fn segment(segment: Segment) -> ItemDescriptor {
        ItemDescriptor {
            version: segment.version,
            item: Some(StoreItem::Segment(Arc::new(segment))),
        }
    }

    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.item.is_none()
    }
}

/// An item in its at-rest form: serialized bytes plus version and deletion
/// metadata, for stores that support it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItemDescriptor {
    pub version: u64,
    pub deleted: bool,
    pub serialized_item: Option<String>,
}

/// A complete data payload: every kind with its keyed descriptors, ordered
/// per the init contract (segments first, flags topologically after their
/// prerequisites).
pub type FullDataSet = Vec<(DataKind, Vec<(String, ItemDescriptor)>)>;

/// Serialized form of [`FullDataSet`] for the persistent contract.
pub type SerializedDataSet = Vec<(DataKind, Vec<(String, SerializedItemDescriptor)>)>;

/// The typed store interface used by the evaluator and the update sink.
///
/// Reads must not block on I/O beyond the implementation's own critical
/// section; the in-memory store satisfies this trivially, the persistent
/// wrapper through its cache.
pub trait DataStore: Send + Sync {
    /// Atomically replaces all data and marks the store initialized.
    fn init(&self, data: FullDataSet) -> Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError>;

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, ItemDescriptor>, StoreError>;

    /// Stores the item iff its version is strictly newer than the stored one.
    /// Returns whether the write landed.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor)
        -> Result<bool, StoreError>;

    fn is_initialized(&self) -> bool;
}

/// The external persistent-store contract (Redis, DynamoDB, ...). All data
/// crosses this boundary in serialized form; implementations never interpret
/// flag semantics.
pub trait PersistentDataStore: Send + Sync {
    fn init(&self, data: SerializedDataSet) -> Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str)
        -> Result<Option<SerializedItemDescriptor>, StoreError>;

    fn get_all(&self, kind: DataKind)
        -> Result<Vec<(String, SerializedItemDescriptor)>, StoreError>;

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItemDescriptor,
    ) -> Result<bool, StoreError>;

    fn is_initialized(&self) -> bool;

    /// Availability probe used by the outage poller; must be cheap and must
    /// not throw.
    fn is_store_available(&self) -> bool;
}

/// Availability of the configured data store, broadcast on transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// False while the store is in an outage.
    pub available: bool,
    /// True when availability returned but cached writes may have been lost,
    /// so consumers should refresh derived state.
    pub stale: bool,
}
