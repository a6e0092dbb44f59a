//! Deterministic bucketing for rollouts, experiments, and weighted segment
//! rules.
//!
//! The bucket value is a float in `[0, 1)` derived from a SHA-256 digest of
//! `"{flagKey}.{salt}.{contextValue}"` (or `"{seed}.{contextValue}"` when an
//! experiment seed is present): the first four digest bytes, read big-endian,
//! divided by 2^32. The computation is pure bytes-in/float-out, so identical
//! inputs bucket identically on every platform.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::attr_ref::AttrRef;
use crate::context::{Context, Kind};

/// The first half of the hash input: flag key + salt, or an experiment seed.
#[derive(Debug, Clone, Copy)]
pub enum BucketPrefix<'a> {
    KeyAndSalt(&'a str, &'a str),
    Seed(i64),
}

/// Computes the bucket value for a context.
///
/// Returns the bucket and whether a usable context value was actually found;
/// a missing context kind or non-bucketable attribute value buckets to `0.0`
/// with `found = false`, which experiments use to clear `inExperiment`.
pub fn bucket_context(
    context: &Context,
    context_kind: Option<&str>,
    prefix: BucketPrefix<'_>,
    bucket_by: Option<&AttrRef>,
) -> (f64, bool) {
    let kind = match Kind::try_from_str(context_kind.unwrap_or("user")) {
        Ok(k) => k,
        Err(_) => return (0.0, false),
    };
    let target = match context.for_kind(&kind) {
        Some(c) => c,
        None => return (0.0, false),
    };
    let id = match bucket_by {
        None => target.key().to_string(),
        Some(reference) => match target.get_value(reference) {
            Some(Value::String(s)) => s,
            // Integer attributes are bucketable; anything else is not.
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            _ => return (0.0, false),
        },
    };
    (bucket_value(prefix, &id), true)
}

fn bucket_value(prefix: BucketPrefix<'_>, id: &str) -> f64 {
    let input = match prefix {
        BucketPrefix::KeyAndSalt(key, salt) => format!("{}.{}.{}", key, salt, id),
        BucketPrefix::Seed(seed) => format!("{}.{}", seed, id),
    };
    let digest = Sha256::digest(input.as_bytes());
    let reduced = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    reduced as f64 / (u32::MAX as f64 + 1.0)
}
