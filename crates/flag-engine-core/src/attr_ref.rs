//! Attribute references: addressing values inside an evaluation context.
//!
//! An attribute reference is either a plain attribute name (`"email"`) or a
//! slash-prefixed path (`"/address/city"`) that descends into nested JSON
//! objects. Path components use JSON-pointer style escapes: `~1` for `/` and
//! `~0` for `~`. A clause that carries no explicit context kind always treats
//! its attribute as a plain name, even when it contains slashes; parsing into
//! one form or the other is therefore a caller decision.

use serde::{Deserialize, Serialize};

/// Reasons an attribute reference string failed to parse.
///
/// Invalid references are not rejected eagerly: they are carried inside
/// [`AttrRef`] and only surface as a malformed-flag condition when a clause
/// actually tries to use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttrRefError {
    #[error("attribute reference is empty")]
    Empty,
    #[error("attribute reference has a double or trailing slash")]
    DoubleSlash,
    #[error("attribute reference has an invalid escape sequence")]
    InvalidEscape,
}

/// A parsed attribute reference.
///
/// Construct with [`AttrRef::from_path`] for slash-syntax references or
/// [`AttrRef::from_literal`] for plain attribute names. The original string is
/// retained so references round-trip through serialization unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrRef {
    raw: String,
    components: Vec<String>,
    error: Option<AttrRefError>,
}

impl AttrRef {
    /// Parses a reference using path syntax: a leading `/` introduces escaped
    /// components, anything else is a single plain name.
    pub fn from_path(raw: &str) -> AttrRef {
        if raw.is_empty() || raw == "/" {
            return AttrRef::invalid(raw, AttrRefError::Empty);
        }
        if !raw.starts_with('/') {
            return AttrRef {
                raw: raw.to_string(),
                components: vec![raw.to_string()],
                error: None,
            };
        }
        let mut components = Vec::new();
        for part in raw[1..].split('/') {
            if part.is_empty() {
                return AttrRef::invalid(raw, AttrRefError::DoubleSlash);
            }
            match unescape(part) {
                Some(c) => components.push(c),
                None => return AttrRef::invalid(raw, AttrRefError::InvalidEscape),
            }
        }
        AttrRef {
            raw: raw.to_string(),
            components,
            error: None,
        }
    }

    /// Treats the whole string as a single attribute name, slashes included.
    pub fn from_literal(name: &str) -> AttrRef {
        if name.is_empty() {
            return AttrRef::invalid(name, AttrRefError::Empty);
        }
        AttrRef {
            raw: name.to_string(),
            components: vec![name.to_string()],
            error: None,
        }
    }

    fn invalid(raw: &str, error: AttrRefError) -> AttrRef {
        AttrRef {
            raw: raw.to_string(),
            components: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<AttrRefError> {
        self.error
    }

    /// Number of path components; zero for invalid references.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    pub fn component(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The original reference string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the reference names a single top-level attribute.
    pub fn is_top_level(&self) -> bool {
        self.components.len() == 1
    }
}

fn unescape(component: &str) -> Option<String> {
    if !component.contains('~') {
        return Some(component.to_string());
    }
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

impl Serialize for AttrRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for AttrRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AttrRef::from_path(&raw))
    }
}
