//! # Data Sources
//!
//! Ingestion of flag data from the control plane. Two real sources exist,
//! [`streaming::StreamingDataSource`] (server-sent events) and
//! [`polling::PollingDataSource`], plus [`NullDataSource`] for offline mode.
//! Sources never touch the store directly: every commit goes through the
//! [`UpdateSink`], which owns versioning, change fan-out, and the status
//! machine.

pub mod polling;
pub mod sink;
pub mod streaming;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::store::{DataKind, FullDataSet, ItemDescriptor};

/// States of the data-source status machine.
///
/// `Initializing` is only left by the first successful payload; recoverable
/// trouble after that is `Interrupted` (never a regression to
/// `Initializing`), and `Off` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    Initializing,
    Valid,
    Interrupted,
    Off,
}

impl fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataSourceState::Initializing => "INITIALIZING",
            DataSourceState::Valid => "VALID",
            DataSourceState::Interrupted => "INTERRUPTED",
            DataSourceState::Off => "OFF",
        };
        f.write_str(s)
    }
}

/// Classification of a data-source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    /// Transport-level I/O failure.
    NetworkError,
    /// Non-success HTTP response.
    ErrorResponse,
    /// Payload failed to parse or violated the schema.
    InvalidData,
    /// The data store rejected a commit.
    StoreError,
    Unknown,
}

/// A failure attached to the data-source status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceError {
    pub kind: DataSourceErrorKind,
    /// HTTP status for `ErrorResponse` failures.
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl DataSourceError {
    pub fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> DataSourceError {
        DataSourceError {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn http(status_code: u16) -> DataSourceError {
        DataSourceError {
            kind: DataSourceErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: format!("HTTP error {}", status_code),
            time: Utc::now(),
        }
    }

    /// Stable identity used to aggregate error counts during an outage.
    pub fn aggregation_key(&self) -> String {
        match (self.kind, self.status_code) {
            (DataSourceErrorKind::ErrorResponse, Some(code)) => {
                format!("ERROR_RESPONSE({})", code)
            }
            (DataSourceErrorKind::NetworkError, _) => "NETWORK_ERROR".to_string(),
            (DataSourceErrorKind::ErrorResponse, None) => "ERROR_RESPONSE".to_string(),
            (DataSourceErrorKind::InvalidData, _) => "INVALID_DATA".to_string(),
            (DataSourceErrorKind::StoreError, _) => "STORE_ERROR".to_string(),
            (DataSourceErrorKind::Unknown, _) => "UNKNOWN".to_string(),
        }
    }
}

/// Current status of the data source, queryable synchronously and broadcast
/// on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    pub state_since: DateTime<Utc>,
    pub last_error: Option<DataSourceError>,
}

/// The single entry point through which sources commit data and report
/// status. Implemented by [`sink::UpdateSinkImpl`].
pub trait UpdateSink: Send + Sync {
    /// Replaces all data (normalised and ordered internally).
    fn init(&self, data: FullDataSet) -> Result<(), StoreError>;

    /// Applies one change; returns whether the version was new enough to
    /// land.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor)
        -> Result<bool, StoreError>;

    fn update_status(&self, state: DataSourceState, error: Option<DataSourceError>);
}

/// A flag-data ingestion mechanism with a lifecycle.
pub trait DataSource: Send + Sync {
    /// Spawns the ingestion worker. The returned receiver resolves `true`
    /// once the source has stored a first valid payload, or `false` on
    /// permanent failure.
    fn start(self: Arc<Self>, sink: Arc<dyn UpdateSink>) -> oneshot::Receiver<bool>;

    /// Requests shutdown; the worker exits after its current network call.
    fn close(&self);
}

/// Data source used in offline mode: reports itself valid immediately and
/// never produces data, so evaluations serve whatever the store holds.
pub struct NullDataSource;

impl DataSource for NullDataSource {
    fn start(self: Arc<Self>, sink: Arc<dyn UpdateSink>) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        sink.update_status(DataSourceState::Valid, None);
        let _ = tx.send(true);
        rx
    }

    fn close(&self) {}
}
