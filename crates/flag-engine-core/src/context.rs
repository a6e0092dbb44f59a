//! # Evaluation Contexts
//!
//! A [`Context`] is the subject of every flag evaluation: a single entity of
//! some kind (`user`, `organization`, a device, ...) or a multi-kind bundle of
//! several such entities evaluated together. Contexts are immutable once
//! built; construction goes through [`ContextBuilder`] or
//! [`MultiContextBuilder`], both of which validate at `build()` time.
//!
//! ## Examples
//!
//! ```rust
//! use flag_engine_core::context::{ContextBuilder, MultiContextBuilder};
//! use serde_json::json;
//!
//! let user = ContextBuilder::new("user-key-123")
//!     .name("Sandy")
//!     .set("email", json!("sandy@example.com"))
//!     .build()
//!     .unwrap();
//!
//! let org = ContextBuilder::new("org-key-456").kind("organization").build().unwrap();
//!
//! let multi = MultiContextBuilder::new()
//!     .add(user)
//!     .add(org)
//!     .build()
//!     .unwrap();
//! assert!(multi.is_multi());
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

use crate::attr_ref::AttrRef;

const MULTI_KIND: &str = "multi";

/// Errors raised while building a context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context key must not be empty")]
    EmptyKey,
    #[error("context kind {0:?} contains characters outside [-._a-zA-Z0-9]")]
    InvalidKindCharacters(String),
    #[error("context kind must not be {0:?}")]
    ReservedKind(String),
    #[error("multi-kind context must contain at least one context")]
    EmptyMultiContext,
    #[error("multi-kind context has more than one context of kind {0:?}")]
    DuplicateKind(String),
    #[error("multi-kind context cannot nest another multi-kind context")]
    NestedMultiContext,
}

/// A validated context kind.
///
/// Kinds are non-empty strings of `[-._a-zA-Z0-9]`, excluding the reserved
/// words `kind` and (for single contexts) `multi`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(String);

impl Kind {
    /// The default kind, `user`.
    pub fn user() -> Kind {
        Kind("user".to_string())
    }

    /// Validates and wraps an arbitrary kind string.
    pub fn try_from_str(s: &str) -> Result<Kind, ContextError> {
        Self::validate(s)?;
        if s == MULTI_KIND {
            return Err(ContextError::ReservedKind(s.to_string()));
        }
        Ok(Kind(s.to_string()))
    }

    fn validate(s: &str) -> Result<(), ContextError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric() || b"-._".contains(&b)) {
            return Err(ContextError::InvalidKindCharacters(s.to_string()));
        }
        if s == "kind" {
            return Err(ContextError::ReservedKind(s.to_string()));
        }
        Ok(())
    }

    pub fn is_user(&self) -> bool {
        self.0 == "user"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An evaluation context: one entity, or a bundle of entities of distinct
/// kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttrRef>,
    // Sorted by kind; non-empty exactly when kind == "multi".
    contexts: Vec<Context>,
    canonical_key: String,
}

impl Context {
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The context key. For a multi-kind context this is empty; use
    /// [`Context::fully_qualified_key`] instead.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_multi(&self) -> bool {
        self.kind.0 == MULTI_KIND
    }

    /// The individual contexts of a multi-kind context, sorted by kind. For a
    /// single-kind context, a one-element slice containing `self` semantics is
    /// not provided; use [`Context::for_kind`] for kind-directed access.
    pub fn individual_contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// Every kind present: the single kind, or each sub-context's kind.
    pub fn kinds(&self) -> Vec<&Kind> {
        if self.is_multi() {
            self.contexts.iter().map(|c| &c.kind).collect()
        } else {
            vec![&self.kind]
        }
    }

    /// Resolves the context to evaluate for the given kind: `self` when the
    /// kinds match, the matching sub-context of a multi-kind bundle, `None`
    /// otherwise.
    pub fn for_kind(&self, kind: &Kind) -> Option<&Context> {
        if self.is_multi() {
            self.contexts.iter().find(|c| &c.kind == kind)
        } else if &self.kind == kind {
            Some(self)
        } else {
            None
        }
    }

    /// The globally unique key used for event deduplication: the bare key for
    /// a default-kind single context, `kind:key` otherwise, and for a
    /// multi-kind context the kind-sorted concatenation of its sub-contexts'
    /// qualified keys.
    pub fn fully_qualified_key(&self) -> &str {
        &self.canonical_key
    }

    /// Attribute references the application asked to keep out of analytics
    /// output. Never consulted during evaluation.
    pub fn private_attributes(&self) -> &[AttrRef] {
        &self.private_attributes
    }

    /// Iterates the custom (non-built-in) attributes of a single context.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Looks up an attribute value on this single context. Built-ins `kind`,
    /// `key`, `name`, and `anonymous` are addressable; everything else reads
    /// the custom attribute map, descending into nested objects for
    /// multi-component references.
    pub fn get_value(&self, reference: &AttrRef) -> Option<Value> {
        if !reference.is_valid() || self.is_multi() {
            return None;
        }
        let first = reference.component(0)?;
        let top: Value = if reference.is_top_level() {
            match first {
                "kind" => return Some(Value::String(self.kind.0.clone())),
                "key" => return Some(Value::String(self.key.clone())),
                "name" => return self.name.clone().map(Value::String),
                "anonymous" => return Some(Value::Bool(self.anonymous)),
                _ => return self.attributes.get(first).cloned(),
            }
        } else {
            self.attributes.get(first).cloned()?
        };
        let mut current = top;
        for i in 1..reference.depth() {
            let component = reference.component(i)?;
            current = match current {
                Value::Object(mut map) => map.remove(component)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn escape_key_component(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

fn canonical_key_for(kind: &Kind, key: &str) -> String {
    if kind.is_user() {
        key.to_string()
    } else {
        format!("{}:{}", kind, escape_key_component(key))
    }
}

/// Builder for a single-kind [`Context`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttrRef>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            kind: "user".to_string(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Sets a custom attribute. Setting the built-ins `key`, `kind`, `name`,
    /// or `anonymous` through here is rejected at build time elsewhere in
    /// other SDK designs; this builder simply routes them to their dedicated
    /// slots when the value has the right type and drops them otherwise.
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        match (name.as_str(), &value) {
            ("key", Value::String(s)) => self.key = s.clone(),
            ("kind", Value::String(s)) => self.kind = s.clone(),
            ("name", Value::String(s)) => self.name = Some(s.clone()),
            ("anonymous", Value::Bool(b)) => self.anonymous = *b,
            ("key" | "kind" | "name" | "anonymous", _) => {}
            _ => {
                self.attributes.insert(name, value);
            }
        }
        self
    }

    /// Marks an attribute (path syntax) as private for analytics output.
    pub fn private(mut self, reference: &str) -> Self {
        self.private_attributes.push(AttrRef::from_path(reference));
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        let kind = Kind::try_from_str(&self.kind)?;
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        let canonical_key = canonical_key_for(&kind, &self.key);
        Ok(Context {
            kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
            private_attributes: self.private_attributes,
            contexts: Vec::new(),
            canonical_key,
        })
    }
}

/// Builder for a multi-kind [`Context`].
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> MultiContextBuilder {
        MultiContextBuilder::default()
    }

    pub fn add(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        if self.contexts.is_empty() {
            return Err(ContextError::EmptyMultiContext);
        }
        // A single component collapses to that context unchanged.
        if self.contexts.len() == 1 {
            return Ok(self.contexts.into_iter().next().unwrap());
        }
        let mut contexts = self.contexts;
        for c in &contexts {
            if c.is_multi() {
                return Err(ContextError::NestedMultiContext);
            }
        }
        contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        for pair in contexts.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(ContextError::DuplicateKind(pair[0].kind.0.clone()));
            }
        }
        let canonical_key = contexts
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key_component(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Context {
            kind: Kind(MULTI_KIND.to_string()),
            key: String::new(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
            contexts,
            canonical_key,
        })
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if self.is_multi() {
            map.serialize_entry("kind", MULTI_KIND)?;
            for c in &self.contexts {
                map.serialize_entry(c.kind.as_str(), &SingleContextBody(c))?;
            }
        } else {
            map.serialize_entry("kind", self.kind.as_str())?;
            serialize_single_body(&mut map, self)?;
        }
        map.end()
    }
}

struct SingleContextBody<'a>(&'a Context);

impl Serialize for SingleContextBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        serialize_single_body(&mut map, self.0)?;
        map.end()
    }
}

fn serialize_single_body<M: SerializeMap>(map: &mut M, c: &Context) -> Result<(), M::Error> {
    map.serialize_entry("key", &c.key)?;
    if let Some(name) = &c.name {
        map.serialize_entry("name", name)?;
    }
    if c.anonymous {
        map.serialize_entry("anonymous", &true)?;
    }
    for (k, v) in &c.attributes {
        map.serialize_entry(k, v)?;
    }
    if !c.private_attributes.is_empty() {
        map.serialize_entry(
            "_meta",
            &serde_json::json!({
                "privateAttributes": c.private_attributes.iter().map(AttrRef::as_str).collect::<Vec<_>>()
            }),
        )?;
    }
    Ok(())
}
