//! Segment definitions: reusable sets of contexts referenced by flag rules.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::clause::Clause;

/// A segment. Regular segments enumerate membership inline and/or match by
/// rules; unbounded ("big") segments hold their membership out-of-band and
/// are addressed as `"<key>.g<generation>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip)]
    pub(crate) included_set: HashSet<String>,
    #[serde(skip)]
    pub(crate) excluded_set: HashSet<String>,
}

/// Kind-scoped inclusion/exclusion lists for non-default context kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    pub(crate) values_set: HashSet<String>,
}

/// A segment rule: a clause conjunction, optionally narrowed to a weighted
/// slice of the matching population.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<String>,
}

impl Segment {
    /// Builds derived membership sets and preprocesses rule clauses. Must run
    /// exactly once after deserialization.
    pub fn preprocess(&mut self) {
        self.included_set = self.included.iter().cloned().collect();
        self.excluded_set = self.excluded.iter().cloned().collect();
        for target in self
            .included_contexts
            .iter_mut()
            .chain(self.excluded_contexts.iter_mut())
        {
            target.values_set = target.values.iter().cloned().collect();
        }
        for rule in &mut self.rules {
            for clause in &mut rule.clauses {
                clause.preprocess();
            }
        }
    }

    /// The out-of-band membership reference for this segment, if it is a big
    /// segment with a generation. Big segments without a generation can never
    /// match.
    pub fn membership_reference(&self) -> Option<String> {
        if self.unbounded {
            self.generation.map(|g| format!("{}.g{}", self.key, g))
        } else {
            None
        }
    }
}

impl SegmentTarget {
    pub(crate) fn contains(&self, key: &str) -> bool {
        if self.values_set.is_empty() && !self.values.is_empty() {
            self.values.iter().any(|v| v == key)
        } else {
            self.values_set.contains(key)
        }
    }
}
