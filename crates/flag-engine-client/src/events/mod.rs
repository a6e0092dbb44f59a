//! # Analytics Event Pipeline
//!
//! Evaluations, identifies, and custom metrics flow into a bounded inbox;
//! the inbox worker deduplicates contexts, accumulates the per-flag summary,
//! and fills the output buffer; the flush worker delivers batches and tracks
//! server time for debug-event expiry. Overflow anywhere drops events and
//! counts the drop for diagnostics, never blocking the caller.

pub mod dedup;
pub mod diagnostics;
pub mod dispatch;
pub mod output;
pub mod sender;
pub mod summarizer;

use chrono::Utc;
use serde_json::Value;

use flag_engine_core::context::Context;
use flag_engine_core::reason::Reason;

pub use dispatch::EventProcessor;
pub use sender::{EventSender, EventSenderResult};

pub(crate) fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Fields shared by every input event.
#[derive(Debug, Clone)]
pub struct BaseEvent {
    /// Millis since epoch at which the application produced the event.
    pub creation_date: u64,
    pub context: Context,
}

impl BaseEvent {
    pub fn new(context: Context) -> BaseEvent {
        BaseEvent {
            creation_date: now_millis(),
            context,
        }
    }
}

/// One flag evaluation, as reported to the pipeline by the client.
#[derive(Debug, Clone)]
pub struct FeatureRequestEvent {
    pub base: BaseEvent,
    pub key: String,
    pub value: Value,
    /// The application's fallback value, recorded in the summary.
    pub default: Value,
    pub variation: Option<usize>,
    pub version: Option<u64>,
    pub reason: Option<Reason>,
    /// Set when this evaluation happened as a prerequisite of another flag.
    pub prereq_of: Option<String>,
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
    pub sampling_ratio: Option<u32>,
    pub exclude_from_summaries: bool,
}

#[derive(Debug, Clone)]
pub struct IdentifyEvent {
    pub base: BaseEvent,
}

#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub base: BaseEvent,
    pub key: String,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
}

/// Everything an application action can feed into the pipeline.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Feature(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
}

impl InputEvent {
    pub(crate) fn base(&self) -> &BaseEvent {
        match self {
            InputEvent::Feature(e) => &e.base,
            InputEvent::Identify(e) => &e.base,
            InputEvent::Custom(e) => &e.base,
        }
    }
}
