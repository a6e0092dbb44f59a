//! Clause operator semantics.
//!
//! All operators are total: a type mismatch, unparseable operand, or unknown
//! operator is simply a non-match, never an error. `segmentMatch` is resolved
//! by the evaluator itself and always reports non-match here.

use serde_json::Value;

use crate::model::clause::{parse_time_value, Clause, Operator, ParsedValue};
use crate::semver::SemVer;

/// Tests one context value (a scalar) against all of a clause's values,
/// succeeding if any value matches.
pub(crate) fn match_any_clause_value(clause: &Clause, context_value: &Value) -> bool {
    match clause.op {
        Operator::In => {
            if let (Some(set), Value::String(s)) =
                (&clause.preprocessed.string_value_set, context_value)
            {
                return set.contains(s);
            }
            clause.values.iter().any(|v| value_eq(v, context_value))
        }
        Operator::StartsWith => match_strings(clause, context_value, |a, b| a.starts_with(b)),
        Operator::EndsWith => match_strings(clause, context_value, |a, b| a.ends_with(b)),
        Operator::Contains => match_strings(clause, context_value, |a, b| a.contains(b)),
        Operator::Matches => {
            let Some(s) = context_value.as_str() else {
                return false;
            };
            with_parsed(clause, |p| match p {
                ParsedValue::Regex(re) => re.is_match(s),
                _ => false,
            })
        }
        Operator::LessThan => match_numbers(clause, context_value, |a, b| a < b),
        Operator::LessThanOrEqual => match_numbers(clause, context_value, |a, b| a <= b),
        Operator::GreaterThan => match_numbers(clause, context_value, |a, b| a > b),
        Operator::GreaterThanOrEqual => match_numbers(clause, context_value, |a, b| a >= b),
        Operator::Before => match_times(clause, context_value, |ctx, clause| ctx < clause),
        Operator::After => match_times(clause, context_value, |ctx, clause| ctx > clause),
        Operator::SemVerEqual => match_versions(clause, context_value, |a, b| a == b),
        Operator::SemVerLessThan => match_versions(clause, context_value, |a, b| a < b),
        Operator::SemVerGreaterThan => match_versions(clause, context_value, |a, b| a > b),
        Operator::SegmentMatch | Operator::Unknown => false,
    }
}

/// Numeric equality is value-based (`1 == 1.0`); everything else is strict
/// JSON equality.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(xf), Some(yf)) => xf == yf,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn match_strings(clause: &Clause, context_value: &Value, f: fn(&str, &str) -> bool) -> bool {
    let Some(s) = context_value.as_str() else {
        return false;
    };
    clause
        .values
        .iter()
        .any(|v| v.as_str().is_some_and(|cv| f(s, cv)))
}

fn match_numbers(clause: &Clause, context_value: &Value, f: fn(f64, f64) -> bool) -> bool {
    let Some(n) = context_value.as_f64() else {
        return false;
    };
    clause
        .values
        .iter()
        .any(|v| v.as_f64().is_some_and(|cv| f(n, cv)))
}

fn match_times(
    clause: &Clause,
    context_value: &Value,
    f: fn(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) -> bool,
) -> bool {
    let Some(t) = parse_time_value(context_value) else {
        return false;
    };
    with_parsed(clause, |p| match p {
        ParsedValue::Instant(cv) => f(t, *cv),
        _ => false,
    })
}

fn match_versions(clause: &Clause, context_value: &Value, f: fn(&SemVer, &SemVer) -> bool) -> bool {
    let Some(v) = context_value.as_str().and_then(SemVer::parse) else {
        return false;
    };
    with_parsed(clause, |p| match p {
        ParsedValue::Version(cv) => f(&v, cv),
        _ => false,
    })
}

/// Runs the predicate over the preprocessed values, skipping the
/// never-matching sentinels left by parse failures.
fn with_parsed(clause: &Clause, f: impl Fn(&ParsedValue) -> bool) -> bool {
    match &clause.preprocessed.parsed_values {
        Some(parsed) => parsed.iter().flatten().any(f),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn clause(op: &str, values: Value) -> Clause {
        let mut c: Clause = serde_json::from_value(json!({
            "attribute": "attr", "op": op, "values": values
        }))
        .unwrap();
        c.preprocess();
        c
    }

    #[test_case("in", json!(["a", "b"]), json!("b"), true)]
    #[test_case("in", json!(["a", "b"]), json!("c"), false)]
    #[test_case("in", json!([99]), json!(99), true)]
    #[test_case("in", json!([99]), json!(99.0), true; "number equality is numeric")]
    #[test_case("in", json!([true]), json!(true), true)]
    #[test_case("in", json!(["99"]), json!(99), false; "no cross type match")]
    #[test_case("startsWith", json!(["foo"]), json!("foobar"), true)]
    #[test_case("startsWith", json!(["bar"]), json!("foobar"), false)]
    #[test_case("endsWith", json!(["bar"]), json!("foobar"), true)]
    #[test_case("contains", json!(["oob"]), json!("foobar"), true)]
    #[test_case("contains", json!(["oob"]), json!(42), false; "contains on non string")]
    #[test_case("matches", json!(["^f.*r$"]), json!("foobar"), true)]
    #[test_case("matches", json!(["^x"]), json!("foobar"), false)]
    #[test_case("matches", json!(["["]), json!("anything"), false; "bad regex never matches")]
    #[test_case("lessThan", json!([10]), json!(5), true)]
    #[test_case("lessThan", json!([10]), json!(10), false)]
    #[test_case("lessThanOrEqual", json!([10]), json!(10), true)]
    #[test_case("greaterThan", json!([10]), json!(11), true)]
    #[test_case("greaterThanOrEqual", json!([10]), json!(10), true)]
    #[test_case("before", json!(["2024-01-01T00:00:00Z"]), json!("2023-12-31T00:00:00Z"), true)]
    #[test_case("before", json!(["2024-01-01T00:00:00Z"]), json!("2024-06-01T00:00:00Z"), false)]
    #[test_case("after", json!(["2024-01-01T00:00:00Z"]), json!("2024-06-01T00:00:00Z"), true)]
    #[test_case("after", json!([0]), json!(1), true; "epoch millis accepted")]
    #[test_case("after", json!(["not-a-date"]), json!("2024-06-01T00:00:00Z"), false)]
    #[test_case("semVerEqual", json!(["2.0"]), json!("2.0.0"), true)]
    #[test_case("semVerLessThan", json!(["2.0.0"]), json!("1.9.0"), true)]
    #[test_case("semVerGreaterThan", json!(["2.0.0-rc1"]), json!("2.0.0"), true)]
    #[test_case("semVerEqual", json!(["nonsense"]), json!("2.0.0"), false)]
    #[test_case("segmentMatch", json!(["s"]), json!("s"), false; "segment match not handled here")]
    #[test_case("someFutureOp", json!(["x"]), json!("x"), false; "unknown op never matches")]
    fn operator_table(op: &str, values: Value, context_value: Value, expected: bool) {
        assert_eq!(
            match_any_clause_value(&clause(op, values), &context_value),
            expected
        );
    }
}
