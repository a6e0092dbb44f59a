//! Serialization of output events, including private-attribute redaction.

use serde_json::{Map, Value};

use flag_engine_core::attr_ref::AttrRef;
use flag_engine_core::context::Context;

use crate::events::{CustomEvent, FeatureRequestEvent, IdentifyEvent};

/// Redaction settings applied when a full context is serialized.
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    pub all_attributes_private: bool,
    pub private_attributes: Vec<AttrRef>,
}

impl OutputConfig {
    pub fn new(all_attributes_private: bool, private_attributes: &[String]) -> OutputConfig {
        OutputConfig {
            all_attributes_private,
            private_attributes: private_attributes
                .iter()
                .map(|s| AttrRef::from_path(s))
                .collect(),
        }
    }
}

/// `kind -> key` map used by feature and custom events, which do not carry
/// the full context.
fn context_keys(context: &Context) -> Value {
    let mut keys = Map::new();
    if context.is_multi() {
        for c in context.individual_contexts() {
            keys.insert(c.kind().to_string(), c.key().into());
        }
    } else {
        keys.insert(context.kind().to_string(), context.key().into());
    }
    Value::Object(keys)
}

/// The full, redacted context representation used by index, identify, and
/// debug events.
pub fn context_json(context: &Context, config: &OutputConfig) -> Value {
    if context.is_multi() {
        let mut obj = Map::new();
        obj.insert("kind".into(), "multi".into());
        for c in context.individual_contexts() {
            obj.insert(c.kind().to_string(), single_context_json(c, config, false));
        }
        Value::Object(obj)
    } else {
        single_context_json(context, config, true)
    }
}

fn single_context_json(context: &Context, config: &OutputConfig, with_kind: bool) -> Value {
    let mut obj = Map::new();
    let mut redacted: Vec<String> = Vec::new();
    if with_kind {
        obj.insert("kind".into(), context.kind().to_string().into());
    }
    obj.insert("key".into(), context.key().into());

    let private: Vec<&AttrRef> = config
        .private_attributes
        .iter()
        .chain(context.private_attributes().iter())
        .filter(|r| r.is_valid())
        .collect();

    if let Some(name) = context.name() {
        if config.all_attributes_private || is_private_top_level(&private, "name") {
            redacted.push("name".to_string());
        } else {
            obj.insert("name".into(), name.into());
        }
    }
    if context.anonymous() {
        obj.insert("anonymous".into(), true.into());
    }

    let mut attributes: Vec<(&str, &Value)> = context.attributes().collect();
    attributes.sort_by_key(|(name, _)| *name);
    for (name, value) in attributes {
        if config.all_attributes_private {
            redacted.push(name.to_string());
            continue;
        }
        let applicable: Vec<&AttrRef> = private
            .iter()
            .filter(|r| r.component(0) == Some(name))
            .copied()
            .collect();
        if applicable.iter().any(|r| r.depth() == 1) {
            redacted.push(name.to_string());
            continue;
        }
        if applicable.is_empty() {
            obj.insert(name.to_string(), value.clone());
        } else {
            obj.insert(
                name.to_string(),
                redact_within(value, &applicable, 1, &mut redacted),
            );
        }
    }

    if !redacted.is_empty() {
        obj.insert(
            "_meta".into(),
            serde_json::json!({ "redactedAttributes": redacted }),
        );
    }
    Value::Object(obj)
}

fn is_private_top_level(private: &[&AttrRef], name: &str) -> bool {
    private
        .iter()
        .any(|r| r.depth() == 1 && r.component(0) == Some(name))
}

/// Applies path-form private references below the top level. Only object
/// values can be descended; anything else is emitted unchanged.
fn redact_within(
    value: &Value,
    refs: &[&AttrRef],
    depth: usize,
    redacted: &mut Vec<String>,
) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, nested) in map {
        let applicable: Vec<&AttrRef> = refs
            .iter()
            .filter(|r| r.component(depth) == Some(key))
            .copied()
            .collect();
        if let Some(hit) = applicable.iter().find(|r| r.depth() == depth + 1) {
            redacted.push(hit.as_str().to_string());
            continue;
        }
        if applicable.is_empty() {
            out.insert(key.clone(), nested.clone());
        } else {
            out.insert(
                key.clone(),
                redact_within(nested, &applicable, depth + 1, redacted),
            );
        }
    }
    Value::Object(out)
}

pub fn index_event(creation_date: u64, context: &Context, config: &OutputConfig) -> Value {
    serde_json::json!({
        "kind": "index",
        "creationDate": creation_date,
        "context": context_json(context, config),
    })
}

pub fn identify_event(event: &IdentifyEvent, config: &OutputConfig) -> Value {
    serde_json::json!({
        "kind": "identify",
        "creationDate": event.base.creation_date,
        "context": context_json(&event.base.context, config),
    })
}

pub fn feature_event(event: &FeatureRequestEvent) -> Value {
    feature_like_event(event, "feature", None)
}

/// Debug events are feature events that carry the full (redacted) context.
pub fn debug_event(event: &FeatureRequestEvent, config: &OutputConfig) -> Value {
    feature_like_event(event, "debug", Some(config))
}

fn feature_like_event(
    event: &FeatureRequestEvent,
    kind: &str,
    full_context: Option<&OutputConfig>,
) -> Value {
    let mut obj = Map::new();
    obj.insert("kind".into(), kind.into());
    obj.insert("creationDate".into(), event.base.creation_date.into());
    obj.insert("key".into(), event.key.clone().into());
    match full_context {
        Some(config) => {
            obj.insert(
                "context".into(),
                context_json(&event.base.context, config),
            );
        }
        None => {
            obj.insert("contextKeys".into(), context_keys(&event.base.context));
        }
    }
    if let Some(version) = event.version {
        obj.insert("version".into(), version.into());
    }
    if let Some(variation) = event.variation {
        obj.insert("variation".into(), variation.into());
    }
    obj.insert("value".into(), event.value.clone());
    obj.insert("default".into(), event.default.clone());
    if let Some(reason) = &event.reason {
        obj.insert(
            "reason".into(),
            serde_json::to_value(reason).unwrap_or(Value::Null),
        );
    }
    if let Some(prereq_of) = &event.prereq_of {
        obj.insert("prereqOf".into(), prereq_of.clone().into());
    }
    Value::Object(obj)
}

pub fn custom_event(event: &CustomEvent) -> Value {
    let mut obj = Map::new();
    obj.insert("kind".into(), "custom".into());
    obj.insert("creationDate".into(), event.base.creation_date.into());
    obj.insert("key".into(), event.key.clone().into());
    obj.insert("contextKeys".into(), context_keys(&event.base.context));
    if let Some(data) = &event.data {
        obj.insert("data".into(), data.clone());
    }
    if let Some(metric_value) = event.metric_value {
        obj.insert("metricValue".into(), metric_value.into());
    }
    Value::Object(obj)
}
