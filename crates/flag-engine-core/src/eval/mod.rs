//! # Evaluation Engine
//!
//! Deterministic, side-effect-free flag evaluation. The only output channel
//! besides the returned [`Detail`] is the prerequisite sink, which receives a
//! record for every prerequisite flag evaluated along the way (the event
//! pipeline turns those into prerequisite feature events).
//!
//! Evaluation never fails with a Rust error: malformed flag data, missing
//! attributes, unknown operators, and dependency cycles all collapse into a
//! result, per the error-handling design of the runtime. Internally a hard
//! malformed-flag condition propagates as `Err` so a cycle deep in a
//! prerequisite or segment chain aborts the whole evaluation rather than
//! masquerading as an ordinary non-match.

pub mod bucketing;
mod operators;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::attr_ref::AttrRef;
use crate::context::{Context, Kind};
use crate::membership::{BigSegmentProvider, Membership};
use crate::model::clause::{Clause, Operator};
use crate::model::flag::{FeatureFlag, Target, VariationOrRollout};
use crate::model::rollout::TOTAL_WEIGHT;
use crate::model::segment::{Segment, SegmentRule};
use crate::reason::{BigSegmentsStatus, Detail, ErrorKind, Reason};

use bucketing::{bucket_context, BucketPrefix};

/// Read access to the current flag/segment data, implemented over the data
/// store by the client.
pub trait DataProvider {
    fn flag(&self, key: &str) -> Option<Arc<FeatureFlag>>;
    fn segment(&self, key: &str) -> Option<Arc<Segment>>;
}

/// One prerequisite evaluation performed during a flag evaluation.
#[derive(Debug, Clone)]
pub struct PrerequisiteEvent {
    /// The prerequisite flag that was evaluated.
    pub prerequisite_flag: Arc<FeatureFlag>,
    /// Key of the flag that required it.
    pub prerequisite_of_flag_key: String,
    pub detail: Detail,
}

/// The evaluation engine. Cheap to construct per call; holds no state between
/// evaluations.
pub struct Evaluator<'a> {
    data: &'a dyn DataProvider,
    big_segments: Option<&'a dyn BigSegmentProvider>,
}

/// Per-evaluation working state: recursion guards and the one-lookup-per-
/// context-key big-segment cache.
#[derive(Default)]
struct EvalScratch {
    prereq_stack: Vec<String>,
    segment_stack: Vec<String>,
    big_seg_cache: HashMap<String, Option<Arc<Membership>>>,
    big_seg_status: Option<BigSegmentsStatus>,
}

impl EvalScratch {
    fn membership_for(
        &mut self,
        provider: Option<&dyn BigSegmentProvider>,
        context_key: &str,
    ) -> Option<Arc<Membership>> {
        if let Some(cached) = self.big_seg_cache.get(context_key) {
            return cached.clone();
        }
        let (membership, status) = match provider {
            None => (None, BigSegmentsStatus::NotConfigured),
            Some(p) => {
                let lookup = p.query_membership(context_key);
                (lookup.membership, lookup.status)
            }
        };
        self.big_seg_status = Some(match self.big_seg_status {
            Some(s) => s.worst(status),
            None => status,
        });
        self.big_seg_cache
            .insert(context_key.to_string(), membership.clone());
        membership
    }
}

impl<'a> Evaluator<'a> {
    pub fn new(data: &'a dyn DataProvider) -> Evaluator<'a> {
        Evaluator {
            data,
            big_segments: None,
        }
    }

    pub fn with_big_segments(
        data: &'a dyn DataProvider,
        big_segments: &'a dyn BigSegmentProvider,
    ) -> Evaluator<'a> {
        Evaluator {
            data,
            big_segments: Some(big_segments),
        }
    }

    /// Evaluates a flag for a context. `prereq_sink` is invoked once per
    /// prerequisite evaluated, depth-first, before this function returns.
    pub fn evaluate(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        prereq_sink: &mut dyn FnMut(PrerequisiteEvent),
    ) -> Detail {
        let mut scratch = EvalScratch::default();
        let mut detail = match self.eval_flag(flag, context, &mut scratch, prereq_sink) {
            Ok(d) | Err(d) => d,
        };
        if let Some(status) = scratch.big_seg_status {
            detail.reason = detail.reason.with_big_segments_status(status);
        }
        detail
    }

    fn eval_flag(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        scratch: &mut EvalScratch,
        sink: &mut dyn FnMut(PrerequisiteEvent),
    ) -> Result<Detail, Detail> {
        if !flag.on {
            return Ok(self.off_value(flag));
        }
        if let Some(failed) = self.check_prerequisites(flag, context, scratch, sink)? {
            return Ok(failed);
        }
        if let Some(matched) = self.match_targets(flag, context) {
            return Ok(matched);
        }
        for (index, rule) in flag.rules.iter().enumerate() {
            if self.clauses_match(&rule.clauses, context, scratch)? {
                return self.result_for(
                    flag,
                    &rule.variation_or_rollout,
                    ResultSlot::Rule(index),
                    context,
                );
            }
        }
        self.result_for(flag, &flag.fallthrough, ResultSlot::Fallthrough, context)
    }

    fn off_value(&self, flag: &FeatureFlag) -> Detail {
        match flag.results() {
            Some(results) => results.off.as_ref().clone(),
            None => flag.detail_for(flag.off_variation, Reason::off()),
        }
    }

    /// `Ok(None)` means all prerequisites passed; `Ok(Some(detail))` is the
    /// parent flag's prerequisite-failed result; `Err` is a hard
    /// malformed-flag condition (dependency cycle) aborting the evaluation.
    fn check_prerequisites(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        scratch: &mut EvalScratch,
        sink: &mut dyn FnMut(PrerequisiteEvent),
    ) -> Result<Option<Detail>, Detail> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }
        if scratch.prereq_stack.iter().any(|k| k == &flag.key) {
            tracing::warn!(
                flag_key = %flag.key,
                "prerequisite cycle detected; flag data is malformed"
            );
            return Err(Detail::error(ErrorKind::MalformedFlag));
        }
        scratch.prereq_stack.push(flag.key.clone());
        let outcome = self.check_prerequisites_inner(flag, context, scratch, sink);
        scratch.prereq_stack.pop();
        outcome
    }

    fn check_prerequisites_inner(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        scratch: &mut EvalScratch,
        sink: &mut dyn FnMut(PrerequisiteEvent),
    ) -> Result<Option<Detail>, Detail> {
        for prereq in &flag.prerequisites {
            let failed = flag.detail_for(
                flag.off_variation,
                Reason::prerequisite_failed(prereq.key.clone()),
            );
            let Some(prereq_flag) = self.data.flag(&prereq.key) else {
                return Ok(Some(failed));
            };
            let detail = self.eval_flag(&prereq_flag, context, scratch, sink)?;
            sink(PrerequisiteEvent {
                prerequisite_flag: prereq_flag.clone(),
                prerequisite_of_flag_key: flag.key.clone(),
                detail: detail.clone(),
            });
            if !prereq_flag.on || detail.variation_index != Some(prereq.variation) {
                return Ok(Some(failed));
            }
        }
        Ok(None)
    }

    fn match_targets(&self, flag: &FeatureFlag, context: &Context) -> Option<Detail> {
        if flag.context_targets.is_empty() {
            return flag
                .targets
                .iter()
                .find(|t| self.target_contains(t, context, None))
                .map(|t| self.target_result(flag, t.variation));
        }
        for target in &flag.context_targets {
            let is_default_kind = target
                .context_kind
                .as_deref()
                .map_or(true, |k| k == Kind::user().as_str());
            if is_default_kind && target.values.is_empty() {
                // Placeholder entry: ordering slot for the legacy targets
                // list, which holds the actual keys for this variation.
                for legacy in &flag.targets {
                    if legacy.variation == target.variation
                        && self.target_contains(legacy, context, None)
                    {
                        return Some(self.target_result(flag, target.variation));
                    }
                }
            } else if self.target_contains(target, context, target.context_kind.as_deref()) {
                return Some(self.target_result(flag, target.variation));
            }
        }
        None
    }

    fn target_contains(&self, target: &Target, context: &Context, kind: Option<&str>) -> bool {
        let Ok(kind) = Kind::try_from_str(kind.unwrap_or("user")) else {
            return false;
        };
        context
            .for_kind(&kind)
            .is_some_and(|c| target.contains(c.key()))
    }

    fn target_result(&self, flag: &FeatureFlag, variation: usize) -> Detail {
        if let Some(results) = flag.results() {
            if let Some(detail) = results.targets.get(&variation) {
                return detail.as_ref().clone();
            }
        }
        flag.detail_for(Some(variation), Reason::target_match())
    }

    fn result_for(
        &self,
        flag: &FeatureFlag,
        vor: &VariationOrRollout,
        slot: ResultSlot,
        context: &Context,
    ) -> Result<Detail, Detail> {
        let (variation, in_experiment) = self.resolve_variation(flag, vor, context)?;
        if let Some(results) = flag.results() {
            let per_variation = match slot {
                ResultSlot::Fallthrough => Some(&results.fallthrough),
                ResultSlot::Rule(i) => results.rules.get(i),
            };
            if let Some(vr) = per_variation {
                let table = if in_experiment {
                    &vr.in_experiment
                } else {
                    &vr.normal
                };
                if let Some(detail) = table.get(variation) {
                    return Ok(detail.as_ref().clone());
                }
            }
        }
        let reason = match slot {
            ResultSlot::Fallthrough => Reason::fallthrough(in_experiment),
            ResultSlot::Rule(i) => {
                Reason::rule_match(i, flag.rules[i].id.clone(), in_experiment)
            }
        };
        Ok(flag.detail_for(Some(variation), reason))
    }

    fn resolve_variation(
        &self,
        flag: &FeatureFlag,
        vor: &VariationOrRollout,
        context: &Context,
    ) -> Result<(usize, bool), Detail> {
        if let Some(variation) = vor.variation {
            return Ok((variation, false));
        }
        let Some(rollout) = &vor.rollout else {
            return Err(Detail::error(ErrorKind::MalformedFlag));
        };
        if rollout.variations.is_empty() {
            return Err(Detail::error(ErrorKind::MalformedFlag));
        }
        let bucket_by = match (&rollout.bucket_by, rollout.is_experiment()) {
            // Experiments always bucket by key.
            (_, true) | (None, _) => None,
            (Some(attr), false) => {
                let reference = if rollout.context_kind.is_some() {
                    AttrRef::from_path(attr)
                } else {
                    AttrRef::from_literal(attr)
                };
                if !reference.is_valid() {
                    return Err(Detail::error(ErrorKind::MalformedFlag));
                }
                Some(reference)
            }
        };
        let prefix = match (rollout.is_experiment(), rollout.seed) {
            (true, Some(seed)) => BucketPrefix::Seed(seed),
            _ => BucketPrefix::KeyAndSalt(&flag.key, &flag.salt),
        };
        let (bucket, found) = bucket_context(
            context,
            rollout.context_kind.as_deref(),
            prefix,
            bucket_by.as_ref(),
        );
        let scaled = bucket * TOTAL_WEIGHT as f64;
        let mut sum = 0.0;
        let mut chosen = rollout.variations.last().expect("non-empty");
        for wv in &rollout.variations {
            sum += wv.weight as f64;
            if scaled < sum {
                chosen = wv;
                break;
            }
        }
        let in_experiment = rollout.is_experiment() && !chosen.untracked && found;
        Ok((chosen.variation, in_experiment))
    }

    fn clauses_match(
        &self,
        clauses: &[Clause],
        context: &Context,
        scratch: &mut EvalScratch,
    ) -> Result<bool, Detail> {
        for clause in clauses {
            if !self.clause_matches(clause, context, scratch)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(
        &self,
        clause: &Clause,
        context: &Context,
        scratch: &mut EvalScratch,
    ) -> Result<bool, Detail> {
        if clause.op == Operator::SegmentMatch {
            return self.segment_match_clause(clause, context, scratch);
        }
        let attr = clause.attr();
        if !attr.is_valid() {
            return Err(Detail::error(ErrorKind::MalformedFlag));
        }
        if attr.is_top_level() && attr.component(0) == Some("kind") {
            let matched = context
                .kinds()
                .iter()
                .any(|k| operators::match_any_clause_value(clause, &Value::String(k.to_string())));
            return Ok(maybe_negate(clause, matched));
        }
        let Ok(kind) = Kind::try_from_str(clause.context_kind.as_deref().unwrap_or("user")) else {
            return Ok(false);
        };
        let Some(target) = context.for_kind(&kind) else {
            return Ok(false);
        };
        let Some(value) = target.get_value(&attr) else {
            // Unresolved attribute: no match, and negation does not apply.
            return Ok(false);
        };
        let matched = match &value {
            Value::Array(items) => items
                .iter()
                .filter(|v| !v.is_array() && !v.is_object())
                .any(|v| operators::match_any_clause_value(clause, v)),
            Value::Object(_) => false,
            scalar => operators::match_any_clause_value(clause, scalar),
        };
        Ok(maybe_negate(clause, matched))
    }

    fn segment_match_clause(
        &self,
        clause: &Clause,
        context: &Context,
        scratch: &mut EvalScratch,
    ) -> Result<bool, Detail> {
        let mut matched = false;
        for value in &clause.values {
            // Non-string segment keys are skipped, not an error.
            let Some(key) = value.as_str() else { continue };
            if let Some(segment) = self.data.segment(key) {
                if self.segment_matches(&segment, context, scratch)? {
                    matched = true;
                    break;
                }
            }
        }
        Ok(maybe_negate(clause, matched))
    }

    fn segment_matches(
        &self,
        segment: &Segment,
        context: &Context,
        scratch: &mut EvalScratch,
    ) -> Result<bool, Detail> {
        if scratch.segment_stack.iter().any(|k| k == &segment.key) {
            tracing::warn!(
                segment_key = %segment.key,
                "segment rule cycle detected; segment data is malformed"
            );
            return Err(Detail::error(ErrorKind::MalformedFlag));
        }
        if segment.unbounded {
            let Some(reference) = segment.membership_reference() else {
                // A big segment without a generation can never match.
                return Ok(false);
            };
            let Ok(kind) =
                Kind::try_from_str(segment.unbounded_context_kind.as_deref().unwrap_or("user"))
            else {
                return Ok(false);
            };
            let Some(target) = context.for_kind(&kind) else {
                return Ok(false);
            };
            let membership = scratch.membership_for(self.big_segments, target.key());
            if let Some(included) = membership.and_then(|m| m.included(&reference)) {
                return Ok(included);
            }
        } else {
            if let Some(user) = context.for_kind(&Kind::user()) {
                if segment.included_set.contains(user.key()) {
                    return Ok(true);
                }
            }
            for target in &segment.included_contexts {
                if self.segment_target_contains(target, context) {
                    return Ok(true);
                }
            }
            if let Some(user) = context.for_kind(&Kind::user()) {
                if segment.excluded_set.contains(user.key()) {
                    return Ok(false);
                }
            }
            for target in &segment.excluded_contexts {
                if self.segment_target_contains(target, context) {
                    return Ok(false);
                }
            }
        }
        scratch.segment_stack.push(segment.key.clone());
        let mut outcome = Ok(false);
        for rule in &segment.rules {
            match self.segment_rule_matches(rule, context, &segment.key, &segment.salt, scratch) {
                Ok(false) => continue,
                other => {
                    outcome = other;
                    break;
                }
            }
        }
        scratch.segment_stack.pop();
        outcome
    }

    fn segment_target_contains(
        &self,
        target: &crate::model::segment::SegmentTarget,
        context: &Context,
    ) -> bool {
        let Ok(kind) = Kind::try_from_str(target.context_kind.as_deref().unwrap_or("user")) else {
            return false;
        };
        context
            .for_kind(&kind)
            .is_some_and(|c| target.contains(c.key()))
    }

    fn segment_rule_matches(
        &self,
        rule: &SegmentRule,
        context: &Context,
        segment_key: &str,
        salt: &str,
        scratch: &mut EvalScratch,
    ) -> Result<bool, Detail> {
        if !self.clauses_match(&rule.clauses, context, scratch)? {
            return Ok(false);
        }
        let Some(weight) = rule.weight else {
            return Ok(true);
        };
        let bucket_by = match &rule.bucket_by {
            None => None,
            Some(attr) => {
                let reference = if rule.rollout_context_kind.is_some() {
                    AttrRef::from_path(attr)
                } else {
                    AttrRef::from_literal(attr)
                };
                if !reference.is_valid() {
                    return Err(Detail::error(ErrorKind::MalformedFlag));
                }
                Some(reference)
            }
        };
        let (bucket, _) = bucket_context(
            context,
            rule.rollout_context_kind.as_deref(),
            BucketPrefix::KeyAndSalt(segment_key, salt),
            bucket_by.as_ref(),
        );
        Ok(bucket * (TOTAL_WEIGHT as f64) < weight as f64)
    }
}

enum ResultSlot {
    Fallthrough,
    Rule(usize),
}

fn maybe_negate(clause: &Clause, matched: bool) -> bool {
    if clause.negate {
        !matched
    } else {
        matched
    }
}
