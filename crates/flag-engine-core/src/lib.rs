//! # Flag Engine Core
//!
//! This crate provides the evaluation plane of the flag engine:
//! - Evaluation contexts (single- and multi-kind) with validated kinds
//! - The flag/segment data model as delivered by the control plane, with
//!   one-shot post-deserialization preprocessing
//! - Attribute references for addressing nested context attributes
//! - The deterministic evaluation engine: prerequisites, targets, rules,
//!   rollouts/experiments, and segment matching
//! - Evaluation results and reasons
//!
//! It performs no I/O and holds no mutable state; the companion
//! `flag-engine-client` crate supplies stores, data sources, and the event
//! pipeline, and feeds this crate through the [`eval::DataProvider`] and
//! [`membership::BigSegmentProvider`] seams.
//!
//! ## Examples
//!
//! ```rust
//! use flag_engine_core::context::ContextBuilder;
//! use flag_engine_core::eval::{DataProvider, Evaluator};
//! use flag_engine_core::model::{FeatureFlag, Segment};
//! use std::sync::Arc;
//!
//! struct NoData;
//!
//! impl DataProvider for NoData {
//!     fn flag(&self, _: &str) -> Option<Arc<FeatureFlag>> { None }
//!     fn segment(&self, _: &str) -> Option<Arc<Segment>> { None }
//! }
//!
//! let mut flag: FeatureFlag = serde_json::from_str(
//!     r#"{"key":"f","on":true,"variations":[true,false],
//!         "fallthrough":{"variation":0},"salt":"x"}"#,
//! ).unwrap();
//! flag.preprocess();
//!
//! let context = ContextBuilder::new("user-1").build().unwrap();
//! let detail = Evaluator::new(&NoData).evaluate(&flag, &context, &mut |_| {});
//! assert_eq!(detail.value, Some(serde_json::Value::Bool(true)));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod attr_ref;
pub mod context;
pub mod eval;
pub mod membership;
pub mod model;
pub mod reason;
mod semver;

// Re-export commonly used types
pub use attr_ref::AttrRef;
pub use context::{Context, ContextBuilder, ContextError, Kind, MultiContextBuilder};
pub use eval::{DataProvider, Evaluator, PrerequisiteEvent};
pub use membership::{BigSegmentLookup, BigSegmentProvider, Membership};
pub use model::{FeatureFlag, Segment};
pub use reason::{BigSegmentsStatus, Detail, ErrorKind, Reason, ReasonKind};
