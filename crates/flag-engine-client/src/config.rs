//! Client configuration.
//!
//! Configuration is a plain record of option values with defaults, validated
//! once at client construction. Components receive the already-validated
//! sub-records they care about.

use std::sync::Arc;
use std::time::Duration;

use crate::bigsegments::BigSegmentStore;
use crate::error::ClientError;
use crate::store::persistent::CacheMode;
use crate::store::PersistentDataStore;

/// Base URIs of the control plane.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub streaming_base_uri: String,
    pub polling_base_uri: String,
    pub events_base_uri: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        ServiceEndpoints {
            streaming_base_uri: "https://stream.flag-engine.io".to_string(),
            polling_base_uri: "https://sdk.flag-engine.io".to_string(),
            events_base_uri: "https://events.flag-engine.io".to_string(),
        }
    }
}

/// How flag data is ingested.
#[derive(Debug, Clone)]
pub enum DataSourceConfig {
    Streaming {
        initial_reconnect_delay: Duration,
    },
    Polling {
        poll_interval: Duration,
        payload_filter: Option<String>,
    },
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig::Streaming {
            initial_reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Where flag data is held.
#[derive(Clone, Default)]
pub enum DataStoreConfig {
    #[default]
    InMemory,
    Persistent {
        store: Arc<dyn PersistentDataStore>,
        cache: CacheMode,
    },
}

/// Analytics event pipeline options.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Ring-buffer capacity; events beyond it are dropped and counted.
    pub capacity: usize,
    pub flush_interval: Duration,
    pub all_attributes_private: bool,
    /// Attribute references (path syntax) withheld from event output.
    pub private_attributes: Vec<String>,
    /// Capacity of the context-key deduplication set.
    pub context_keys_capacity: usize,
    pub context_keys_flush_interval: Duration,
    pub diagnostic_recording_interval: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            enabled: true,
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            context_keys_capacity: 1_000,
            context_keys_flush_interval: Duration::from_secs(300),
            diagnostic_recording_interval: Duration::from_secs(900),
        }
    }
}

/// Big-segment store options; absent means big segments are not configured.
#[derive(Clone)]
pub struct BigSegmentsConfig {
    pub store: Arc<dyn BigSegmentStore>,
    pub context_cache_size: usize,
    pub context_cache_time: Duration,
    pub status_poll_interval: Duration,
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub fn new(store: Arc<dyn BigSegmentStore>) -> BigSegmentsConfig {
        BigSegmentsConfig {
            store,
            context_cache_size: 1_000,
            context_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Options applied to the outbound HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Proxy URL, including credentials if the proxy requires them.
    pub proxy: Option<String>,
    pub custom_headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(300),
            proxy: None,
            custom_headers: Vec::new(),
        }
    }
}

impl HttpConfig {
    /// Builds the shared reqwest client the runtime components use.
    pub fn build_client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout);
        if let Some(url) = &self.proxy {
            match reqwest::Proxy::all(url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unparseable proxy URL");
                }
            }
        }
        builder.build().unwrap_or_default()
    }
}

/// Top-level client configuration.
#[derive(Clone)]
pub struct Config {
    pub service_endpoints: ServiceEndpoints,
    pub data_source: DataSourceConfig,
    pub data_store: DataStoreConfig,
    pub events: EventsConfig,
    pub big_segments: Option<BigSegmentsConfig>,
    pub http: HttpConfig,
    /// Offline mode: no network at all; evaluations serve store contents.
    pub offline: bool,
    /// How long `start` waits for the data source before giving up.
    pub start_wait: Duration,
    pub log_data_source_outage_as_error_after: Duration,
    pub diagnostic_opt_out: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_endpoints: ServiceEndpoints::default(),
            data_source: DataSourceConfig::default(),
            data_store: DataStoreConfig::default(),
            events: EventsConfig::default(),
            big_segments: None,
            http: HttpConfig::default(),
            offline: false,
            start_wait: Duration::from_secs(5),
            log_data_source_outage_as_error_after: Duration::from_secs(60),
            diagnostic_opt_out: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.events.capacity == 0 {
            return Err(ClientError::configuration("events.capacity must be > 0"));
        }
        if self.events.context_keys_capacity == 0 {
            return Err(ClientError::configuration(
                "events.context_keys_capacity must be > 0",
            ));
        }
        if self.events.flush_interval < Duration::from_millis(100) {
            return Err(ClientError::configuration(
                "events.flush_interval must be at least 100ms",
            ));
        }
        if self.events.diagnostic_recording_interval < Duration::from_secs(60) {
            return Err(ClientError::configuration(
                "events.diagnostic_recording_interval must be at least 60s",
            ));
        }
        if let DataSourceConfig::Polling { poll_interval, .. } = &self.data_source {
            if *poll_interval < Duration::from_secs(1) {
                return Err(ClientError::configuration(
                    "polling.poll_interval must be at least 1s",
                ));
            }
        }
        if let Some(big_segments) = &self.big_segments {
            if big_segments.context_cache_size == 0 {
                return Err(ClientError::configuration(
                    "big_segments.context_cache_size must be > 0",
                ));
            }
        }
        Ok(())
    }

    /// A summary of non-secret settings for the diagnostic init event.
    pub fn diagnostic_description(&self) -> serde_json::Value {
        serde_json::json!({
            "streamingDisabled": !matches!(self.data_source, DataSourceConfig::Streaming { .. }),
            "customBaseURI": self.service_endpoints.polling_base_uri != ServiceEndpoints::default().polling_base_uri,
            "customStreamURI": self.service_endpoints.streaming_base_uri != ServiceEndpoints::default().streaming_base_uri,
            "customEventsURI": self.service_endpoints.events_base_uri != ServiceEndpoints::default().events_base_uri,
            "eventsCapacity": self.events.capacity,
            "eventsFlushIntervalMillis": self.events.flush_interval.as_millis() as u64,
            "allAttributesPrivate": self.events.all_attributes_private,
            "contextKeysCapacity": self.events.context_keys_capacity,
            "contextKeysFlushIntervalMillis": self.events.context_keys_flush_interval.as_millis() as u64,
            "diagnosticRecordingIntervalMillis": self.events.diagnostic_recording_interval.as_millis() as u64,
            "usingRelayDaemon": false,
            "offline": self.offline,
            "startWaitMillis": self.start_wait.as_millis() as u64,
            "dataStoreType": match self.data_store {
                DataStoreConfig::InMemory => "memory",
                DataStoreConfig::Persistent { .. } => "custom",
            },
            "bigSegmentsConfigured": self.big_segments.is_some(),
        })
    }
}
