//! Per-flag evaluation counters, drained into one summary event per flush.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::events::FeatureRequestEvent;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    flag_key: String,
    variation: Option<usize>,
    version: Option<u64>,
}

#[derive(Debug, Clone)]
struct Counter {
    count: u64,
    value: Value,
}

/// State of one flag inside the summary.
#[derive(Debug, Clone, Default)]
struct FlagSummary {
    default: Value,
    context_kinds: BTreeSet<String>,
}

/// Accumulates evaluation counts between flushes.
#[derive(Debug, Default)]
pub struct EventSummarizer {
    start_date: Option<u64>,
    end_date: u64,
    counters: HashMap<CounterKey, Counter>,
    flags: HashMap<String, FlagSummary>,
}

impl EventSummarizer {
    pub fn new() -> EventSummarizer {
        EventSummarizer::default()
    }

    pub fn summarize(&mut self, event: &FeatureRequestEvent) {
        self.start_date = Some(match self.start_date {
            Some(s) => s.min(event.base.creation_date),
            None => event.base.creation_date,
        });
        self.end_date = self.end_date.max(event.base.creation_date);

        let flag = self.flags.entry(event.key.clone()).or_default();
        flag.default = event.default.clone();
        for kind in event.base.context.kinds() {
            flag.context_kinds.insert(kind.to_string());
        }

        let counter = self
            .counters
            .entry(CounterKey {
                flag_key: event.key.clone(),
                variation: event.variation,
                version: event.version,
            })
            .or_insert_with(|| Counter {
                count: 0,
                value: event.value.clone(),
            });
        counter.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drains the counters into a summary event payload, or `None` when no
    /// evaluations happened this interval.
    pub fn take_event(&mut self) -> Option<Value> {
        if self.counters.is_empty() {
            return None;
        }
        let counters = std::mem::take(&mut self.counters);
        let flags = std::mem::take(&mut self.flags);
        let start_date = self.start_date.take().unwrap_or(0);
        let end_date = std::mem::take(&mut self.end_date);

        let mut features = serde_json::Map::new();
        for (flag_key, summary) in flags {
            let mut flag_counters = Vec::new();
            for (key, counter) in counters.iter().filter(|(k, _)| k.flag_key == flag_key) {
                let mut entry = serde_json::Map::new();
                if let Some(variation) = key.variation {
                    entry.insert("variation".into(), variation.into());
                }
                match key.version {
                    Some(version) => {
                        entry.insert("version".into(), version.into());
                    }
                    // An unknown flag has no version; the wire format marks
                    // it explicitly.
                    None => {
                        entry.insert("unknown".into(), true.into());
                    }
                }
                entry.insert("value".into(), counter.value.clone());
                entry.insert("count".into(), counter.count.into());
                flag_counters.push(Value::Object(entry));
            }
            features.insert(
                flag_key,
                serde_json::json!({
                    "default": summary.default,
                    "contextKinds": summary.context_kinds.iter().collect::<Vec<_>>(),
                    "counters": flag_counters,
                }),
            );
        }
        Some(serde_json::json!({
            "kind": "summary",
            "startDate": start_date,
            "endDate": end_date,
            "features": Value::Object(features),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BaseEvent;
    use flag_engine_core::context::ContextBuilder;
    use serde_json::json;

    fn feature_event(key: &str, variation: Option<usize>, version: Option<u64>) -> FeatureRequestEvent {
        FeatureRequestEvent {
            base: BaseEvent::new(ContextBuilder::new("u").build().unwrap()),
            key: key.to_string(),
            value: json!("v"),
            default: json!("d"),
            variation,
            version,
            reason: None,
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
            sampling_ratio: None,
            exclude_from_summaries: false,
        }
    }

    #[test]
    fn counts_by_flag_variation_and_version() {
        let mut s = EventSummarizer::new();
        s.summarize(&feature_event("f", Some(0), Some(1)));
        s.summarize(&feature_event("f", Some(0), Some(1)));
        s.summarize(&feature_event("f", Some(1), Some(1)));
        s.summarize(&feature_event("g", Some(0), Some(2)));

        let event = s.take_event().unwrap();
        assert_eq!(event["kind"], "summary");
        let f = &event["features"]["f"];
        assert_eq!(f["default"], "d");
        assert_eq!(f["contextKinds"], json!(["user"]));
        let counters = f["counters"].as_array().unwrap();
        assert_eq!(counters.len(), 2);
        let count_for = |variation: u64| {
            counters
                .iter()
                .find(|c| c["variation"] == variation)
                .unwrap()["count"]
                .clone()
        };
        assert_eq!(count_for(0), json!(2));
        assert_eq!(count_for(1), json!(1));
        assert_eq!(event["features"]["g"]["counters"][0]["count"], json!(1));
    }

    #[test]
    fn unknown_flags_are_marked() {
        let mut s = EventSummarizer::new();
        s.summarize(&feature_event("ghost", None, None));
        let event = s.take_event().unwrap();
        let counter = &event["features"]["ghost"]["counters"][0];
        assert_eq!(counter["unknown"], true);
        assert!(counter.get("version").is_none());
    }

    #[test]
    fn take_resets_state() {
        let mut s = EventSummarizer::new();
        s.summarize(&feature_event("f", Some(0), Some(1)));
        assert!(s.take_event().is_some());
        assert!(s.is_empty());
        assert!(s.take_event().is_none());
    }

    #[test]
    fn tracks_date_range() {
        let mut s = EventSummarizer::new();
        let mut early = feature_event("f", Some(0), Some(1));
        early.base.creation_date = 1_000;
        let mut late = feature_event("f", Some(0), Some(1));
        late.base.creation_date = 9_000;
        s.summarize(&late);
        s.summarize(&early);
        let event = s.take_event().unwrap();
        assert_eq!(event["startDate"], 1_000);
        assert_eq!(event["endDate"], 9_000);
    }
}
