//! The default, purely in-process data store.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::store::{DataKind, DataStore, FullDataSet, ItemDescriptor};

/// A versioned map-of-maps behind a single reader-preferring lock. Reads
/// block only for the duration of a hash lookup; writes serialize against
/// each other and against reads.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    inner: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<DataKind, HashMap<String, ItemDescriptor>>,
    initialized: bool,
}

impl InMemoryDataStore {
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let mut state = self.inner.write().expect("store lock poisoned");
        state.items.clear();
        for (kind, items) in data {
            state.items.insert(kind, items.into_iter().collect());
        }
        state.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        let state = self.inner.read().expect("store lock poisoned");
        Ok(state.items.get(&kind).and_then(|m| m.get(key)).cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, ItemDescriptor>, StoreError> {
        let state = self.inner.read().expect("store lock poisoned");
        Ok(state.items.get(&kind).cloned().unwrap_or_default())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.write().expect("store lock poisoned");
        let slot = state.items.entry(kind).or_default();
        match slot.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                slot.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.read().expect("store lock poisoned").initialized
    }
}
