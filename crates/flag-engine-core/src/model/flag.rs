//! Feature flag definitions as delivered by the control plane.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::clause::Clause;
use crate::model::rollout::Rollout;
use crate::reason::{Detail, Reason};

/// A feature flag: targeting rules plus the candidate variation values.
///
/// Flags arrive over the wire, are preprocessed once (clause parsing, result
/// interning), and are immutable thereafter; stores share them behind `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub client_side: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events_fallthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_ratio: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_from_summaries: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationSettings>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip)]
    pub(crate) preprocessed: Option<Arc<PrecomputedResults>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_ratio: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// An individual-target entry. Legacy `targets` entries carry no context
/// kind and apply to the default kind; `contextTargets` entries name theirs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
    #[serde(skip)]
    pub(crate) values_set: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
}

/// Either a fixed variation index or a rollout. A well-formed flag sets
/// exactly one; neither set is a malformed-flag condition at evaluation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

/// Interned evaluation results, one per (reason, variation) shape the flag
/// can produce, so hot-path evaluations hand out shared objects instead of
/// rebuilding them.
#[derive(Debug)]
pub struct PrecomputedResults {
    pub off: Arc<Detail>,
    pub fallthrough: VariationResults,
    pub rules: Vec<VariationResults>,
    pub targets: HashMap<usize, Arc<Detail>>,
}

#[derive(Debug)]
pub(crate) struct VariationResults {
    pub normal: Vec<Arc<Detail>>,
    pub in_experiment: Vec<Arc<Detail>>,
}

impl FeatureFlag {
    /// Builds derived state: clause/target preprocessing and the interned
    /// result table. Must run exactly once after deserialization.
    pub fn preprocess(&mut self) {
        for target in self.targets.iter_mut().chain(self.context_targets.iter_mut()) {
            target.values_set = target.values.iter().cloned().collect();
        }
        for rule in &mut self.rules {
            for clause in &mut rule.clauses {
                clause.preprocess();
            }
        }

        let off = Arc::new(self.detail_for(self.off_variation, Reason::off()));
        let fallthrough = self.variation_results(|in_exp| Reason::fallthrough(in_exp));
        let rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let id = rule.id.clone();
                self.variation_results(|in_exp| Reason::rule_match(i, id.clone(), in_exp))
            })
            .collect();
        let targets = self
            .targets
            .iter()
            .chain(self.context_targets.iter())
            .map(|t| t.variation)
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|v| {
                (
                    v,
                    Arc::new(self.detail_for(Some(v), Reason::target_match())),
                )
            })
            .collect();
        self.preprocessed = Some(Arc::new(PrecomputedResults {
            off,
            fallthrough,
            rules,
            targets,
        }));
    }

    fn variation_results(&self, reason: impl Fn(bool) -> Reason) -> VariationResults {
        let build = |in_exp: bool| {
            (0..self.variations.len())
                .map(|v| Arc::new(self.detail_for(Some(v), reason(in_exp))))
                .collect()
        };
        VariationResults {
            normal: build(false),
            in_experiment: build(true),
        }
    }

    /// A result for the given variation index; an absent index yields an
    /// empty value (caller substitutes its default) with the same reason.
    pub(crate) fn detail_for(&self, index: Option<usize>, reason: Reason) -> Detail {
        match index {
            Some(i) => match self.variations.get(i) {
                Some(value) => Detail::new(Some(value.clone()), Some(i), reason),
                None => Detail::error(crate::reason::ErrorKind::MalformedFlag),
            },
            None => Detail::new(None, None, reason),
        }
    }

    pub fn results(&self) -> Option<&Arc<PrecomputedResults>> {
        self.preprocessed.as_ref()
    }
}

impl Target {
    pub(crate) fn contains(&self, key: &str) -> bool {
        if self.values_set.is_empty() && !self.values.is_empty() {
            // Preprocessing did not run; fall back to the list.
            self.values.iter().any(|v| v == key)
        } else {
            self.values_set.contains(key)
        }
    }
}
