//! Percentage rollouts and experiments.

use serde::{Deserialize, Serialize};

/// Total bucket space: weights are expressed in units of 0.001%.
pub const TOTAL_WEIGHT: u32 = 100_000;

/// A weighted split of variations. `kind` distinguishes a plain rollout from
/// an experiment, which buckets by key only (honouring `seed`) and feeds the
/// event pipeline's `inExperiment` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    /// Weight in parts per 100,000. Weights summing under the total collapse
    /// the remainder into the final bucket.
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub untracked: bool,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}
