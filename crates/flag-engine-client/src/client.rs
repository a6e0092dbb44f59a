//! # The Client Facade
//!
//! [`FlagClient`] wires the runtime together: store, update sink, data
//! source, big segments, event pipeline, and the status/change broadcasters.
//! Evaluation calls are synchronous and never fail: every problem collapses
//! into the caller's default value with an explanatory reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::oneshot;

use flag_engine_core::context::Context;
use flag_engine_core::eval::{DataProvider, Evaluator, PrerequisiteEvent};
use flag_engine_core::model::{FeatureFlag, Segment};
use flag_engine_core::reason::{Detail, ErrorKind, Reason, ReasonKind};

use crate::bigsegments::{BigSegmentStoreStatus, BigSegmentStoreWrapper};
use crate::broadcast::{
    Broadcaster, FlagChangeEvent, FlagValueChangeEvent, ListenerHandle,
};
use crate::config::{Config, DataSourceConfig, DataStoreConfig};
use crate::datasource::polling::{PollingDataSource, ReqwestPollRequestor};
use crate::datasource::sink::UpdateSinkImpl;
use crate::datasource::streaming::{ReqwestStreamingConnector, StreamingDataSource};
use crate::datasource::{DataSource, DataSourceStatus, NullDataSource, UpdateSink};
use crate::error::ClientError;
use crate::events::diagnostics::DiagnosticsAccumulator;
use crate::events::sender::ReqwestEventSender;
use crate::events::{
    BaseEvent, CustomEvent, EventProcessor, EventSender, FeatureRequestEvent, IdentifyEvent,
    InputEvent,
};
use crate::store::memory::InMemoryDataStore;
use crate::store::persistent::PersistentStoreWrapper;
use crate::store::{DataKind, DataStore, DataStoreStatus};

/// Options for [`FlagClient::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsOptions {
    /// Only include flags marked as available to client-side SDKs.
    pub client_side_only: bool,
    /// Include evaluation reasons in the flag metadata.
    pub with_reasons: bool,
}

/// A snapshot of all flag values for one context, suitable for bootstrapping
/// a front end.
#[derive(Debug, Clone)]
pub struct FeatureFlagsState {
    valid: bool,
    flags: Vec<(String, FlagState)>,
}

#[derive(Debug, Clone)]
struct FlagState {
    value: Value,
    variation: Option<usize>,
    version: u64,
    reason: Option<Reason>,
    track_events: bool,
    debug_events_until_date: Option<u64>,
}

impl FeatureFlagsState {
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.flags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, s)| &s.value)
    }

    /// The bootstrap JSON representation: flag values at the top level plus
    /// `$flagsState` metadata and a `$valid` marker.
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        let mut meta = serde_json::Map::new();
        for (key, state) in &self.flags {
            obj.insert(key.clone(), state.value.clone());
            let mut entry = serde_json::Map::new();
            if let Some(variation) = state.variation {
                entry.insert("variation".into(), variation.into());
            }
            entry.insert("version".into(), state.version.into());
            if let Some(reason) = &state.reason {
                entry.insert("reason".into(), serde_json::to_value(reason).unwrap_or(Value::Null));
            }
            if state.track_events {
                entry.insert("trackEvents".into(), true.into());
            }
            if let Some(until) = state.debug_events_until_date {
                entry.insert("debugEventsUntilDate".into(), until.into());
            }
            meta.insert(key.clone(), Value::Object(entry));
        }
        obj.insert("$flagsState".into(), Value::Object(meta));
        obj.insert("$valid".into(), self.valid.into());
        Value::Object(obj)
    }
}

enum StartState {
    NotStarted,
    Started,
}

struct ClientInner {
    store: Arc<dyn DataStore>,
    persistent_wrapper: Option<Arc<PersistentStoreWrapper>>,
    sink: Arc<UpdateSinkImpl>,
    data_source: Arc<dyn DataSource>,
    events: Option<EventProcessor>,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
    flag_changes: Arc<Broadcaster<FlagChangeEvent>>,
    data_source_status_broadcasts: Arc<Broadcaster<DataSourceStatus>>,
    data_store_status_broadcasts: Arc<Broadcaster<DataStoreStatus>>,
    big_segment_status_broadcasts: Arc<Broadcaster<BigSegmentStoreStatus>>,
    offline: bool,
    start_wait: std::time::Duration,
    start_state: Mutex<StartState>,
    start_result: Mutex<Option<oneshot::Receiver<bool>>>,
    closed: AtomicBool,
}

/// The feature-flag client. One instance per process is the norm; it is
/// cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct FlagClient {
    inner: Arc<ClientInner>,
}

impl FlagClient {
    /// Builds the client. Must be called from within a tokio runtime; worker
    /// tasks are spawned on it. Call [`FlagClient::start`] afterwards to
    /// begin data synchronisation.
    pub fn build(sdk_key: &str, config: Config) -> Result<FlagClient, ClientError> {
        Self::build_with(sdk_key, config, None, None)
    }

    pub(crate) fn build_with(
        sdk_key: &str,
        config: Config,
        data_source_override: Option<Arc<dyn DataSource>>,
        event_sender_override: Option<Arc<dyn EventSender>>,
    ) -> Result<FlagClient, ClientError> {
        config.validate()?;
        if sdk_key.is_empty() && !config.offline {
            return Err(ClientError::InvalidSdkKey);
        }

        let flag_changes = Arc::new(Broadcaster::new());
        let data_source_status_broadcasts = Arc::new(Broadcaster::new());
        let data_store_status_broadcasts = Arc::new(Broadcaster::new());
        let big_segment_status_broadcasts = Arc::new(Broadcaster::new());

        let (store, persistent_wrapper): (Arc<dyn DataStore>, _) = match &config.data_store {
            DataStoreConfig::InMemory => (Arc::new(InMemoryDataStore::new()), None),
            DataStoreConfig::Persistent { store, cache } => {
                let wrapper = Arc::new(PersistentStoreWrapper::new(
                    store.clone(),
                    *cache,
                    data_store_status_broadcasts.clone(),
                ));
                (wrapper.clone() as Arc<dyn DataStore>, Some(wrapper))
            }
        };

        let sink = Arc::new(UpdateSinkImpl::new(
            store.clone(),
            flag_changes.clone(),
            data_source_status_broadcasts.clone(),
            config.log_data_source_outage_as_error_after,
        ));

        let diagnostics = Arc::new(DiagnosticsAccumulator::new(sdk_key));
        let http_client = config.http.build_client();

        let events = if config.events.enabled && !config.offline {
            let sender = event_sender_override.unwrap_or_else(|| {
                Arc::new(ReqwestEventSender::new(
                    http_client.clone(),
                    &config.service_endpoints.events_base_uri,
                    sdk_key,
                    config.http.custom_headers.clone(),
                ))
            });
            Some(EventProcessor::new(
                &config.events,
                sender,
                diagnostics.clone(),
                !config.diagnostic_opt_out,
                config.diagnostic_description(),
            ))
        } else {
            None
        };

        let big_segments = config.big_segments.as_ref().map(|bs| {
            Arc::new(BigSegmentStoreWrapper::new(
                bs.store.clone(),
                bs.context_cache_size,
                bs.context_cache_time,
                bs.status_poll_interval,
                bs.stale_after,
                big_segment_status_broadcasts.clone(),
            ))
        });

        let data_source: Arc<dyn DataSource> = match data_source_override {
            Some(source) => source,
            None if config.offline => Arc::new(NullDataSource),
            None => match &config.data_source {
                DataSourceConfig::Streaming {
                    initial_reconnect_delay,
                } => {
                    let connector = Arc::new(ReqwestStreamingConnector::new(
                        http_client.clone(),
                        &config.service_endpoints.streaming_base_uri,
                        sdk_key,
                        config.http.custom_headers.clone(),
                    ));
                    Arc::new(StreamingDataSource::new(
                        connector,
                        *initial_reconnect_delay,
                        Some(diagnostics.clone()),
                    ))
                }
                DataSourceConfig::Polling {
                    poll_interval,
                    payload_filter,
                } => {
                    let requestor = Arc::new(ReqwestPollRequestor::new(
                        http_client,
                        &config.service_endpoints.polling_base_uri,
                        sdk_key,
                        payload_filter.as_deref(),
                        config.http.custom_headers.clone(),
                    ));
                    Arc::new(PollingDataSource::new(requestor, *poll_interval))
                }
            },
        };

        Ok(FlagClient {
            inner: Arc::new(ClientInner {
                store,
                persistent_wrapper,
                sink,
                data_source,
                events,
                big_segments,
                flag_changes,
                data_source_status_broadcasts,
                data_store_status_broadcasts,
                big_segment_status_broadcasts,
                offline: config.offline,
                start_wait: config.start_wait,
                start_state: Mutex::new(StartState::NotStarted),
                start_result: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Starts data synchronisation and waits up to `start_wait` for the
    /// first payload. Returns whether the client is initialized.
    pub async fn start(&self) -> bool {
        let receiver = {
            let mut state = self.inner.start_state.lock().expect("start lock");
            match *state {
                StartState::NotStarted => {
                    *state = StartState::Started;
                    Some(
                        self.inner
                            .data_source
                            .clone()
                            .start(self.inner.sink.clone() as Arc<dyn UpdateSink>),
                    )
                }
                StartState::Started => None,
            }
        };
        if let Some(rx) = receiver {
            *self.inner.start_result.lock().expect("start lock") = Some(rx);
        }
        let rx = self.inner.start_result.lock().expect("start lock").take();
        if let Some(rx) = rx {
            match tokio::time::timeout(self.inner.start_wait, rx).await {
                Ok(Ok(success)) => return success || self.is_initialized(),
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(
                        wait_secs = self.inner.start_wait.as_secs(),
                        "timed out waiting for flag data; continuing uninitialised"
                    );
                }
            }
        }
        self.is_initialized()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.offline || self.inner.store.is_initialized()
    }

    // ----- evaluation -----

    pub fn bool_variation(&self, context: &Context, key: &str, default: bool) -> bool {
        self.bool_variation_detail(context, key, default).value
            == Some(Value::Bool(true))
    }

    pub fn bool_variation_detail(&self, context: &Context, key: &str, default: bool) -> Detail {
        self.typed_detail(context, key, Value::Bool(default), |v| v.is_boolean())
    }

    pub fn string_variation(&self, context: &Context, key: &str, default: &str) -> String {
        match self
            .typed_detail(context, key, Value::String(default.to_string()), |v| {
                v.is_string()
            })
            .value
        {
            Some(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    pub fn string_variation_detail(&self, context: &Context, key: &str, default: &str) -> Detail {
        self.typed_detail(context, key, Value::String(default.to_string()), |v| {
            v.is_string()
        })
    }

    pub fn f64_variation(&self, context: &Context, key: &str, default: f64) -> f64 {
        self.typed_detail(context, key, json!(default), Value::is_number)
            .value
            .as_ref()
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    pub fn i64_variation(&self, context: &Context, key: &str, default: i64) -> i64 {
        self.typed_detail(context, key, json!(default), Value::is_number)
            .value
            .as_ref()
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn json_variation(&self, context: &Context, key: &str, default: Value) -> Value {
        self.evaluate_internal(context, key, default.clone(), false)
            .value
            .unwrap_or(default)
    }

    pub fn json_variation_detail(&self, context: &Context, key: &str, default: Value) -> Detail {
        self.evaluate_internal(context, key, default, true)
    }

    /// Evaluates with full detail; the reason is also attached to the
    /// generated analytics event.
    pub fn variation_detail(&self, context: &Context, key: &str, default: Value) -> Detail {
        self.evaluate_internal(context, key, default, true)
    }

    fn typed_detail(
        &self,
        context: &Context,
        key: &str,
        default: Value,
        type_ok: fn(&Value) -> bool,
    ) -> Detail {
        let detail = self.evaluate_internal(context, key, default.clone(), false);
        match &detail.value {
            Some(v) if type_ok(v) => detail,
            _ if detail.reason.is_error() => detail,
            _ => Detail {
                value: Some(default),
                variation_index: None,
                reason: Reason::error(ErrorKind::WrongType),
            },
        }
    }

    fn evaluate_internal(
        &self,
        context: &Context,
        key: &str,
        default: Value,
        include_reason: bool,
    ) -> Detail {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Detail::error(ErrorKind::ClientNotReady).or_default(default);
        }
        if !self.is_initialized() && !self.inner.store.is_initialized() {
            tracing::warn!(key, "evaluation before client initialisation; serving default");
            return Detail::error(ErrorKind::ClientNotReady).or_default(default);
        }
        let flag = match self.inner.store.get(DataKind::Features, key) {
            Err(e) => {
                tracing::error!(key, error = %e, "data store failure during evaluation");
                return Detail::error(ErrorKind::Exception).or_default(default);
            }
            Ok(descriptor) => descriptor.and_then(|d| d.item).and_then(|i| i.into_flag()),
        };
        let Some(flag) = flag else {
            tracing::info!(key, "unknown feature flag requested; serving default");
            self.send_event(InputEvent::Feature(FeatureRequestEvent {
                base: BaseEvent::new(context.clone()),
                key: key.to_string(),
                value: default.clone(),
                default: default.clone(),
                variation: None,
                version: None,
                reason: include_reason.then(|| Reason::error(ErrorKind::FlagNotFound)),
                prereq_of: None,
                track_events: false,
                debug_events_until_date: None,
                sampling_ratio: None,
                exclude_from_summaries: false,
            }));
            return Detail::error(ErrorKind::FlagNotFound).or_default(default);
        };

        let provider = StoreDataProvider {
            store: self.inner.store.as_ref(),
        };
        let mut prereq_events: Vec<PrerequisiteEvent> = Vec::new();
        let detail = {
            let evaluator = match &self.inner.big_segments {
                Some(wrapper) => Evaluator::with_big_segments(&provider, wrapper.as_ref()),
                None => Evaluator::new(&provider),
            };
            evaluator.evaluate(&flag, context, &mut |e| prereq_events.push(e))
        };
        for prereq in prereq_events {
            self.send_flag_event(
                context,
                &prereq.prerequisite_flag,
                prereq.detail,
                Value::Null,
                false,
                Some(prereq.prerequisite_of_flag_key),
            );
        }
        let detail = detail.or_default(default.clone());
        self.send_flag_event(context, &flag, detail.clone(), default, include_reason, None);
        detail
    }

    fn send_flag_event(
        &self,
        context: &Context,
        flag: &FeatureFlag,
        detail: Detail,
        default: Value,
        include_reason: bool,
        prereq_of: Option<String>,
    ) {
        let mut track = flag.track_events;
        let mut reason_required = include_reason;
        if detail.reason.in_experiment() {
            track = true;
            reason_required = true;
        }
        match detail.reason.kind() {
            ReasonKind::RuleMatch => {
                if let Some(index) = detail.reason.rule_index() {
                    if flag.rules.get(index).is_some_and(|r| r.track_events) {
                        track = true;
                        reason_required = true;
                    }
                }
            }
            ReasonKind::Fallthrough if flag.track_events_fallthrough => {
                track = true;
                reason_required = true;
            }
            _ => {}
        }
        self.send_event(InputEvent::Feature(FeatureRequestEvent {
            base: BaseEvent::new(context.clone()),
            key: flag.key.clone(),
            value: detail.value.unwrap_or(Value::Null),
            default,
            variation: detail.variation_index,
            version: Some(flag.version),
            reason: reason_required.then_some(detail.reason),
            prereq_of,
            track_events: track,
            debug_events_until_date: flag.debug_events_until_date,
            sampling_ratio: flag.sampling_ratio,
            exclude_from_summaries: flag.exclude_from_summaries,
        }));
    }

    fn send_event(&self, event: InputEvent) {
        if let Some(events) = &self.inner.events {
            events.send(event);
        }
    }

    /// Evaluates every flag for the given context without emitting events.
    pub fn all_flags_state(&self, context: &Context, options: AllFlagsOptions) -> FeatureFlagsState {
        if !self.is_initialized() && !self.inner.store.is_initialized() {
            return FeatureFlagsState {
                valid: false,
                flags: Vec::new(),
            };
        }
        let all = match self.inner.store.get_all(DataKind::Features) {
            Ok(all) => all,
            Err(e) => {
                tracing::error!(error = %e, "data store failure reading all flags");
                return FeatureFlagsState {
                    valid: false,
                    flags: Vec::new(),
                };
            }
        };
        let provider = StoreDataProvider {
            store: self.inner.store.as_ref(),
        };
        let mut flags = Vec::new();
        for (key, descriptor) in all {
            let Some(flag) = descriptor.item.and_then(|i| i.into_flag()) else {
                continue;
            };
            if options.client_side_only && !flag.client_side {
                continue;
            }
            let evaluator = match &self.inner.big_segments {
                Some(wrapper) => Evaluator::with_big_segments(&provider, wrapper.as_ref()),
                None => Evaluator::new(&provider),
            };
            let detail = evaluator.evaluate(&flag, context, &mut |_| {});
            flags.push((
                key,
                FlagState {
                    value: detail.value.unwrap_or(Value::Null),
                    variation: detail.variation_index,
                    version: flag.version,
                    reason: options.with_reasons.then_some(detail.reason),
                    track_events: flag.track_events,
                    debug_events_until_date: flag.debug_events_until_date,
                },
            ));
        }
        flags.sort_by(|(a, _), (b, _)| a.cmp(b));
        FeatureFlagsState { valid: true, flags }
    }

    // ----- events -----

    pub fn identify(&self, context: &Context) {
        self.send_event(InputEvent::Identify(IdentifyEvent {
            base: BaseEvent::new(context.clone()),
        }));
    }

    pub fn track(&self, context: &Context, event_key: &str) {
        self.track_metric(context, event_key, None, None);
    }

    pub fn track_data(&self, context: &Context, event_key: &str, data: Value) {
        self.track_metric(context, event_key, Some(data), None);
    }

    pub fn track_metric(
        &self,
        context: &Context,
        event_key: &str,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) {
        self.send_event(InputEvent::Custom(CustomEvent {
            base: BaseEvent::new(context.clone()),
            key: event_key.to_string(),
            data,
            metric_value,
        }));
    }

    /// Requests an out-of-cycle event flush; returns immediately.
    pub fn flush(&self) {
        if let Some(events) = &self.inner.events {
            events.trigger_flush();
        }
    }

    // ----- status and listeners -----

    pub fn data_source_status(&self) -> DataSourceStatus {
        self.inner.sink.current_status()
    }

    pub fn add_data_source_status_listener(
        &self,
        listener: impl Fn(&DataSourceStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.data_source_status_broadcasts.add_listener(listener)
    }

    pub fn data_store_status(&self) -> DataStoreStatus {
        DataStoreStatus {
            available: self
                .inner
                .persistent_wrapper
                .as_ref()
                .map_or(true, |w| w.is_available()),
            stale: false,
        }
    }

    pub fn add_data_store_status_listener(
        &self,
        listener: impl Fn(&DataStoreStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.data_store_status_broadcasts.add_listener(listener)
    }

    pub fn big_segment_store_status(&self) -> Option<BigSegmentStoreStatus> {
        self.inner.big_segments.as_ref().map(|w| w.status())
    }

    pub fn add_big_segment_store_status_listener(
        &self,
        listener: impl Fn(&BigSegmentStoreStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.big_segment_status_broadcasts.add_listener(listener)
    }

    pub fn add_flag_change_listener(
        &self,
        listener: impl Fn(&FlagChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.flag_changes.add_listener(listener)
    }

    pub fn remove_flag_change_listener(&self, handle: ListenerHandle) {
        self.inner.flag_changes.remove_listener(handle);
    }

    /// Watches one flag for one context, re-evaluating on every flag-change
    /// event and notifying only when the JSON value actually differs.
    pub fn add_flag_value_change_listener(
        &self,
        flag_key: &str,
        context: Context,
        listener: impl Fn(&FlagValueChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let client = self.clone();
        let flag_key = flag_key.to_string();
        let last_value = Mutex::new(self.json_variation(&context, &flag_key, Value::Null));
        self.inner.flag_changes.add_listener(move |event| {
            if event.key != flag_key {
                return;
            }
            let new_value = client.json_variation(&context, &flag_key, Value::Null);
            let mut last = last_value.lock().expect("value change lock");
            if *last != new_value {
                let change = FlagValueChangeEvent {
                    key: flag_key.clone(),
                    old_value: last.clone(),
                    new_value: new_value.clone(),
                };
                *last = new_value;
                drop(last);
                listener(&change);
            }
        })
    }

    /// Shuts the client down: drains events, stops ingestion, closes the
    /// component workers, in reverse dependency order.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = &self.inner.events {
            events.close().await;
        }
        self.inner.data_source.close();
        if let Some(big_segments) = &self.inner.big_segments {
            big_segments.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn test_sink(&self) -> Arc<UpdateSinkImpl> {
        self.inner.sink.clone()
    }
}

struct StoreDataProvider<'a> {
    store: &'a dyn DataStore,
}

impl DataProvider for StoreDataProvider<'_> {
    fn flag(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        self.store
            .get(DataKind::Features, key)
            .ok()
            .flatten()
            .and_then(|d| d.item)
            .and_then(|i| i.into_flag())
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.store
            .get(DataKind::Segments, key)
            .ok()
            .flatten()
            .and_then(|d| d.item)
            .and_then(|i| i.into_segment())
    }
}
