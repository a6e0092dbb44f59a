//! Dependency tracking between flags and segments.
//!
//! Two jobs live here: ordering full payloads so the store init contract
//! holds (segments before flags, prerequisites before their dependents), and
//! answering "which flags are affected?" when an item changes, by walking the
//! reverse dependency graph.

use std::collections::{HashMap, HashSet};

use flag_engine_core::model::{Clause, Operator};

use crate::store::{DataKind, FullDataSet, ItemDescriptor, StoreItem};

/// A namespaced item key.
pub type KindKey = (DataKind, String);

/// Reverse-dependency index over the currently stored data.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    /// item -> what it depends on
    depends_on: HashMap<KindKey, HashSet<KindKey>>,
    /// item -> what depends on it
    dependents: HashMap<KindKey, HashSet<KindKey>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    pub fn clear(&mut self) {
        self.depends_on.clear();
        self.dependents.clear();
    }

    /// Records the dependencies of one item, replacing whatever was known
    /// about it before.
    pub fn update_from(&mut self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let from: KindKey = (kind, key.to_string());
        let new_deps = item
            .item
            .as_ref()
            .map(dependencies_of)
            .unwrap_or_default();
        if let Some(old_deps) = self.depends_on.get(&from) {
            for dep in old_deps {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(&from);
                }
            }
        }
        for dep in &new_deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(from.clone());
        }
        self.depends_on.insert(from, new_deps);
    }

    /// Adds `start` and everything transitively depending on it to `out`.
    /// `out` doubles as the visited set, so cycles cannot loop.
    pub fn add_affected(&self, start: &KindKey, out: &mut HashSet<KindKey>) {
        if !out.insert(start.clone()) {
            return;
        }
        if let Some(dependents) = self.dependents.get(start) {
            for item in dependents {
                self.add_affected(item, out);
            }
        }
    }
}

fn dependencies_of(item: &StoreItem) -> HashSet<KindKey> {
    let mut deps = HashSet::new();
    match item {
        StoreItem::Flag(flag) => {
            for prereq in &flag.prerequisites {
                deps.insert((DataKind::Features, prereq.key.clone()));
            }
            for rule in &flag.rules {
                collect_segment_refs(&rule.clauses, &mut deps);
            }
        }
        StoreItem::Segment(segment) => {
            for rule in &segment.rules {
                collect_segment_refs(&rule.clauses, &mut deps);
            }
        }
    }
    deps
}

fn collect_segment_refs(clauses: &[Clause], deps: &mut HashSet<KindKey>) {
    for clause in clauses {
        if clause.op == Operator::SegmentMatch {
            for value in &clause.values {
                if let Some(key) = value.as_str() {
                    deps.insert((DataKind::Segments, key.to_string()));
                }
            }
        }
    }
}

/// Orders a full payload for store init: segments first, then flags sorted so
/// every prerequisite precedes its dependents. A prerequisite cycle is logged
/// and left in arbitrary order; evaluation surfaces it as a malformed flag.
pub fn sort_data_set(data: FullDataSet) -> FullDataSet {
    let mut by_kind: HashMap<DataKind, Vec<(String, ItemDescriptor)>> =
        data.into_iter().collect();
    let mut out = Vec::with_capacity(DataKind::ALL.len());
    for kind in DataKind::ALL {
        let items = by_kind.remove(&kind).unwrap_or_default();
        let items = match kind {
            DataKind::Features => sort_flags_by_prerequisites(items),
            DataKind::Segments => items,
        };
        out.push((kind, items));
    }
    out
}

fn sort_flags_by_prerequisites(
    items: Vec<(String, ItemDescriptor)>,
) -> Vec<(String, ItemDescriptor)> {
    let mut remaining: HashMap<String, ItemDescriptor> = items.into_iter().collect();
    let keys: Vec<String> = {
        let mut k: Vec<_> = remaining.keys().cloned().collect();
        // Deterministic output independent of hash order.
        k.sort();
        k
    };
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut visiting = HashSet::new();
    for key in keys {
        visit_flag(&key, &mut remaining, &mut visiting, &mut ordered);
    }
    ordered
}

fn visit_flag(
    key: &str,
    remaining: &mut HashMap<String, ItemDescriptor>,
    visiting: &mut HashSet<String>,
    ordered: &mut Vec<(String, ItemDescriptor)>,
) {
    let Some(descriptor) = remaining.remove(key) else {
        return;
    };
    if !visiting.insert(key.to_string()) {
        // Unreachable in practice: the item was already taken out of
        // `remaining` when first visited.
        return;
    }
    let prereq_keys: Vec<String> = descriptor
        .item
        .as_ref()
        .and_then(StoreItem::as_flag)
        .map(|f| f.prerequisites.iter().map(|p| p.key.clone()).collect())
        .unwrap_or_default();
    for prereq in prereq_keys {
        if visiting.contains(&prereq) {
            tracing::warn!(
                flag_key = key,
                prerequisite = %prereq,
                "prerequisite cycle in received flag data"
            );
            continue;
        }
        visit_flag(&prereq, remaining, visiting, ordered);
    }
    visiting.remove(key);
    ordered.push((key.to_string(), descriptor));
}
