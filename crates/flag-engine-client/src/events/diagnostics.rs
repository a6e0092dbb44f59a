//! Diagnostic event payloads: a one-time init record describing the SDK and
//! its configuration, and periodic statistics records with counters that
//! reset on every report.

use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

/// One streaming connection attempt, reported in the next statistics record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInit {
    /// Millis since epoch at which the attempt began.
    pub timestamp: u64,
    pub duration_millis: u64,
    pub failed: bool,
}

/// Mutable diagnostic state shared between the sources and the event
/// pipeline's flush worker.
pub struct DiagnosticsAccumulator {
    id: DiagnosticId,
    data_since: Mutex<u64>,
    stream_inits: Mutex<Vec<StreamInit>>,
    dropped_events: Mutex<u64>,
    deduplicated_contexts: Mutex<u64>,
}

#[derive(Debug, Clone)]
struct DiagnosticId {
    diagnostic_id: String,
    sdk_key_suffix: String,
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

impl DiagnosticsAccumulator {
    pub fn new(sdk_key: &str) -> DiagnosticsAccumulator {
        let suffix_start = sdk_key.len().saturating_sub(6);
        DiagnosticsAccumulator {
            id: DiagnosticId {
                diagnostic_id: Uuid::new_v4().to_string(),
                sdk_key_suffix: sdk_key[suffix_start..].to_string(),
            },
            data_since: Mutex::new(now_millis()),
            stream_inits: Mutex::new(Vec::new()),
            dropped_events: Mutex::new(0),
            deduplicated_contexts: Mutex::new(0),
        }
    }

    pub fn record_stream_init(&self, timestamp: u64, duration_millis: u64, failed: bool) {
        self.stream_inits.lock().expect("diagnostics lock").push(StreamInit {
            timestamp,
            duration_millis,
            failed,
        });
    }

    pub fn record_events_dropped(&self, count: u64) {
        *self.dropped_events.lock().expect("diagnostics lock") += count;
    }

    pub fn record_context_deduplicated(&self) {
        *self.deduplicated_contexts.lock().expect("diagnostics lock") += 1;
    }

    /// The startup record: static SDK and configuration description.
    pub fn init_event(&self, configuration: Value) -> Value {
        json!({
            "kind": "diagnostic-init",
            "id": {
                "diagnosticId": self.id.diagnostic_id,
                "sdkKeySuffix": self.id.sdk_key_suffix,
            },
            "creationDate": now_millis(),
            "sdk": {
                "name": "flag-engine-client",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "platform": {
                "name": "rust",
                "osArch": std::env::consts::ARCH,
                "osName": std::env::consts::OS,
            },
            "configuration": configuration,
        })
    }

    /// Drains the counters into a periodic statistics record.
    pub fn stats_event(&self, events_in_last_batch: u64) -> Value {
        let data_since = {
            let mut since = self.data_since.lock().expect("diagnostics lock");
            std::mem::replace(&mut *since, now_millis())
        };
        let stream_inits: Vec<StreamInit> =
            std::mem::take(&mut *self.stream_inits.lock().expect("diagnostics lock"));
        let dropped = std::mem::replace(&mut *self.dropped_events.lock().expect("diagnostics lock"), 0);
        let dedup = std::mem::replace(
            &mut *self.deduplicated_contexts.lock().expect("diagnostics lock"),
            0,
        );
        json!({
            "kind": "diagnostic",
            "id": {
                "diagnosticId": self.id.diagnostic_id,
                "sdkKeySuffix": self.id.sdk_key_suffix,
            },
            "creationDate": now_millis(),
            "dataSinceDate": data_since,
            "droppedEvents": dropped,
            "deduplicatedUsers": dedup,
            "eventsInLastBatch": events_in_last_batch,
            "streamInits": stream_inits.iter().map(|s| json!({
                "timestamp": s.timestamp,
                "durationMillis": s.duration_millis,
                "failed": s.failed,
            })).collect::<Vec<_>>(),
        })
    }
}
