//! Error types for the client runtime.
//!
//! Errors at I/O boundaries are recovered locally: logged, counted, and
//! surfaced through status providers. The types here are what crosses the
//! seams between components; evaluation itself never returns an error to the
//! caller.

/// Failure of a data-store operation.
///
/// Wrapped persistent stores report these; the in-memory store is infallible
/// but shares the same trait signatures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The underlying persistent store could not be reached or threw.
    #[error("persistent store unavailable: {message}")]
    Unavailable {
        /// Driver-reported failure description
        message: String,
    },

    /// Stored bytes could not be parsed back into an item.
    #[error("stored item could not be deserialized: {message}")]
    InvalidStoredItem {
        /// Details about the malformed payload
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> StoreError {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> StoreError {
        StoreError::InvalidStoredItem {
            message: message.into(),
        }
    }
}

/// Failure to construct or start the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Which option was rejected and why
        message: String,
    },

    /// The SDK key was empty or unusable.
    #[error("invalid SDK key")]
    InvalidSdkKey,

    /// The client was already closed.
    #[error("client has been closed")]
    Closed,
}

impl ClientError {
    pub fn configuration(message: impl Into<String>) -> ClientError {
        ClientError::Configuration {
            message: message.into(),
        }
    }
}
