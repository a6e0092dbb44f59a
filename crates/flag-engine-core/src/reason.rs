//! Evaluation results and the reasons behind them.

use serde::Serialize;
use serde_json::Value;

/// Why an evaluation produced the variation it did.
///
/// Modelled as a kind discriminant plus optional detail fields so that one
/// struct covers every reason shape and serializes directly into the wire
/// representation (`{"kind": "RULE_MATCH", "ruleIndex": 0, ...}`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    kind: ReasonKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prerequisite_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    in_experiment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    big_segments_status: Option<BigSegmentsStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonKind {
    Off,
    Fallthrough,
    TargetMatch,
    RuleMatch,
    PrerequisiteFailed,
    Error,
}

/// Error conditions reported inside an evaluation reason. Evaluation never
/// fails with a Rust error; these collapse into the returned [`Detail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The client has not finished acquiring an initial data set.
    ClientNotReady,
    /// No flag exists with the requested key.
    FlagNotFound,
    /// The flag definition is internally inconsistent (bad variation index,
    /// empty rollout, invalid attribute reference, dependency cycle).
    MalformedFlag,
    /// A typed variation call received a value of a different JSON type.
    WrongType,
    /// Unexpected internal failure.
    Exception,
}

/// Freshness of big-segment data consulted during an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    NotConfigured,
    StoreError,
}

impl BigSegmentsStatus {
    /// Statuses are ordered by severity; an evaluation that touches several
    /// big segments reports the worst one observed.
    fn severity(self) -> u8 {
        match self {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::Stale => 1,
            BigSegmentsStatus::NotConfigured => 2,
            BigSegmentsStatus::StoreError => 3,
        }
    }

    pub fn worst(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl Reason {
    pub fn off() -> Reason {
        Reason::base(ReasonKind::Off)
    }

    pub fn fallthrough(in_experiment: bool) -> Reason {
        Reason {
            in_experiment,
            ..Reason::base(ReasonKind::Fallthrough)
        }
    }

    pub fn target_match() -> Reason {
        Reason::base(ReasonKind::TargetMatch)
    }

    pub fn rule_match(rule_index: usize, rule_id: Option<String>, in_experiment: bool) -> Reason {
        Reason {
            rule_index: Some(rule_index),
            rule_id,
            in_experiment,
            ..Reason::base(ReasonKind::RuleMatch)
        }
    }

    pub fn prerequisite_failed(prerequisite_key: impl Into<String>) -> Reason {
        Reason {
            prerequisite_key: Some(prerequisite_key.into()),
            ..Reason::base(ReasonKind::PrerequisiteFailed)
        }
    }

    pub fn error(error_kind: ErrorKind) -> Reason {
        Reason {
            error_kind: Some(error_kind),
            ..Reason::base(ReasonKind::Error)
        }
    }

    fn base(kind: ReasonKind) -> Reason {
        Reason {
            kind,
            rule_index: None,
            rule_id: None,
            prerequisite_key: None,
            error_kind: None,
            in_experiment: false,
            big_segments_status: None,
        }
    }

    pub fn kind(&self) -> ReasonKind {
        self.kind
    }

    pub fn rule_index(&self) -> Option<usize> {
        self.rule_index
    }

    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    pub fn prerequisite_key(&self) -> Option<&str> {
        self.prerequisite_key.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn in_experiment(&self) -> bool {
        self.in_experiment
    }

    pub fn big_segments_status(&self) -> Option<BigSegmentsStatus> {
        self.big_segments_status
    }

    pub fn with_big_segments_status(mut self, status: BigSegmentsStatus) -> Reason {
        self.big_segments_status = Some(status);
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == ReasonKind::Error
    }
}

/// The outcome of evaluating one flag for one context.
///
/// `value` is `None` when the evaluation could not produce a variation (an
/// error, or an off state with no off-variation); the caller substitutes its
/// own default in that case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl Detail {
    pub fn new(value: Option<Value>, variation_index: Option<usize>, reason: Reason) -> Detail {
        Detail {
            value,
            variation_index,
            reason,
        }
    }

    /// A detail carrying no variation, as produced by evaluation errors.
    pub fn error(kind: ErrorKind) -> Detail {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::error(kind),
        }
    }

    /// Replaces a missing value with the caller's default.
    pub fn or_default(mut self, default: Value) -> Detail {
        if self.value.is_none() {
            self.value = Some(default);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_reason_kinds() {
        assert_eq!(
            serde_json::to_value(Reason::off()).unwrap(),
            json!({"kind": "OFF"})
        );
        assert_eq!(
            serde_json::to_value(Reason::fallthrough(false)).unwrap(),
            json!({"kind": "FALLTHROUGH"})
        );
        assert_eq!(
            serde_json::to_value(Reason::fallthrough(true)).unwrap(),
            json!({"kind": "FALLTHROUGH", "inExperiment": true})
        );
        assert_eq!(
            serde_json::to_value(Reason::rule_match(2, Some("r".into()), false)).unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 2, "ruleId": "r"})
        );
        assert_eq!(
            serde_json::to_value(Reason::prerequisite_failed("other")).unwrap(),
            json!({"kind": "PREREQUISITE_FAILED", "prerequisiteKey": "other"})
        );
        assert_eq!(
            serde_json::to_value(Reason::error(ErrorKind::MalformedFlag)).unwrap(),
            json!({"kind": "ERROR", "errorKind": "MALFORMED_FLAG"})
        );
    }

    #[test]
    fn big_segments_status_ordering() {
        use BigSegmentsStatus::*;
        assert_eq!(Healthy.worst(Stale), Stale);
        assert_eq!(StoreError.worst(Healthy), StoreError);
        assert_eq!(Stale.worst(NotConfigured), NotConfigured);
    }

    #[test]
    fn detail_default_substitution() {
        let d = Detail::error(ErrorKind::FlagNotFound).or_default(json!(false));
        assert_eq!(d.value, Some(json!(false)));
        assert_eq!(d.variation_index, None);
        let d = Detail::new(Some(json!("a")), Some(0), Reason::off()).or_default(json!("b"));
        assert_eq!(d.value, Some(json!("a")));
    }
}
