//! Clauses: the per-attribute conditions inside flag and segment rules.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attr_ref::AttrRef;
use crate::semver::SemVer;

/// A single condition: an attribute of the context, an operator, and the
/// values to compare against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<String>,
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negate: bool,
    #[serde(skip)]
    pub(crate) preprocessed: ClausePreprocessed,
}

/// Clause comparison operators. Unrecognised operator names deserialize to
/// [`Operator::Unknown`], which matches nothing but is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    #[serde(other)]
    Unknown,
}

/// Derived clause state built once after deserialization.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClausePreprocessed {
    /// How `attribute` is to be read: a literal name when the clause has no
    /// context kind, a slash-syntax reference otherwise.
    pub attr: Option<AttrRef>,
    /// Fast-path set for `in` clauses with two or more string values.
    pub string_value_set: Option<HashSet<String>>,
    /// Per-value parses for operators that need them; index-aligned with
    /// `values`. A `None` entry means that value can never match.
    pub parsed_values: Option<Vec<Option<ParsedValue>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum ParsedValue {
    Regex(regex::Regex),
    Instant(DateTime<Utc>),
    Version(SemVer),
}

impl Clause {
    /// Builds the derived state. Must run exactly once after deserialization,
    /// before the clause is evaluated.
    pub(crate) fn preprocess(&mut self) {
        self.preprocessed.attr = Some(if self.context_kind.is_some() {
            AttrRef::from_path(&self.attribute)
        } else {
            AttrRef::from_literal(&self.attribute)
        });
        match self.op {
            Operator::In => {
                if self.values.len() >= 2 && self.values.iter().all(Value::is_string) {
                    self.preprocessed.string_value_set = Some(
                        self.values
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                    );
                }
            }
            Operator::Matches => {
                self.preprocessed.parsed_values = Some(
                    self.values
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .and_then(|s| regex::Regex::new(s).ok())
                                .map(ParsedValue::Regex)
                        })
                        .collect(),
                );
            }
            Operator::Before | Operator::After => {
                self.preprocessed.parsed_values = Some(
                    self.values
                        .iter()
                        .map(|v| parse_time_value(v).map(ParsedValue::Instant))
                        .collect(),
                );
            }
            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                self.preprocessed.parsed_values = Some(
                    self.values
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .and_then(SemVer::parse)
                                .map(ParsedValue::Version)
                        })
                        .collect(),
                );
            }
            _ => {}
        }
    }

    /// The attribute reference in effect for this clause. Falls back to
    /// parsing on the spot if preprocessing never ran.
    pub(crate) fn attr(&self) -> AttrRef {
        match &self.preprocessed.attr {
            Some(a) => a.clone(),
            None if self.context_kind.is_some() => AttrRef::from_path(&self.attribute),
            None => AttrRef::from_literal(&self.attribute),
        }
    }
}

/// Parses a clause or context value as a timestamp: RFC 3339 strings or
/// numeric milliseconds since epoch.
pub(crate) fn parse_time_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_f64()?;
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
