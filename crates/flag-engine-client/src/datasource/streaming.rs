//! The streaming data source: a persistent server-sent-events connection.
//!
//! The connection delivers `put` (full payload), `patch`, and `delete`
//! messages; anything that breaks the data contract restarts the connection
//! under jittered exponential backoff, while unknown event types are logged
//! and ignored. HTTP 401/403 at connect time are terminal.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::sync::{oneshot, watch};

use flag_engine_core::model::{FeatureFlag, Segment};

use crate::datasource::{
    DataSource, DataSourceError, DataSourceErrorKind, DataSourceState, UpdateSink,
};
use crate::events::diagnostics::DiagnosticsAccumulator;
use crate::store::{DataKind, FullDataSet, ItemDescriptor};

/// A raw SSE byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Why a connection attempt failed.
#[derive(Debug, Clone)]
pub enum ConnectFailure {
    Http(u16),
    Network(String),
}

/// Opens the SSE connection. The default implementation is
/// [`ReqwestStreamingConnector`]; tests substitute scripted streams.
#[async_trait]
pub trait StreamingConnector: Send + Sync {
    async fn connect(&self) -> Result<ByteStream, ConnectFailure>;
}

/// Default maximum delay between reconnection attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A connection that survives this long is considered healthy and resets the
/// backoff.
const BACKOFF_RESET_THRESHOLD: Duration = Duration::from_secs(60);

pub struct StreamingDataSource {
    connector: Arc<dyn StreamingConnector>,
    initial_reconnect_delay: Duration,
    diagnostics: Option<Arc<DiagnosticsAccumulator>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamingDataSource {
    pub fn new(
        connector: Arc<dyn StreamingConnector>,
        initial_reconnect_delay: Duration,
        diagnostics: Option<Arc<DiagnosticsAccumulator>>,
    ) -> StreamingDataSource {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        StreamingDataSource {
            connector,
            initial_reconnect_delay,
            diagnostics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    async fn run(
        self: Arc<Self>,
        sink: Arc<dyn UpdateSink>,
        init_tx: oneshot::Sender<bool>,
    ) {
        let mut init_tx = Some(init_tx);
        let mut shutdown = self.shutdown_rx.clone();
        let mut backoff = Backoff::new(self.initial_reconnect_delay, MAX_RECONNECT_DELAY);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let attempt_started = Instant::now();
            let attempt_timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                c = self.connector.connect() => c,
            };
            match connected {
                Ok(stream) => {
                    self.record_stream_init(attempt_timestamp, attempt_started, false);
                    let outcome = self
                        .consume(stream, &sink, &mut init_tx, &mut shutdown)
                        .await;
                    if attempt_started.elapsed() >= BACKOFF_RESET_THRESHOLD {
                        backoff.reset();
                    }
                    match outcome {
                        StreamOutcome::Shutdown => break,
                        StreamOutcome::Restart(error) => {
                            tracing::warn!(
                                error = %error.message,
                                "stream interrupted; will reconnect"
                            );
                            sink.update_status(DataSourceState::Interrupted, Some(error));
                        }
                    }
                }
                Err(ConnectFailure::Http(status)) if is_terminal_http(status) => {
                    self.record_stream_init(attempt_timestamp, attempt_started, true);
                    tracing::error!(
                        status,
                        "streaming connection rejected; SDK key is invalid, giving up"
                    );
                    sink.update_status(
                        DataSourceState::Off,
                        Some(DataSourceError::http(status)),
                    );
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(false);
                    }
                    return;
                }
                Err(failure) => {
                    self.record_stream_init(attempt_timestamp, attempt_started, true);
                    let error = match failure {
                        ConnectFailure::Http(status) => DataSourceError::http(status),
                        ConnectFailure::Network(message) => {
                            DataSourceError::new(DataSourceErrorKind::NetworkError, message)
                        }
                    };
                    tracing::warn!(
                        error = %error.message,
                        "streaming connection failed; will retry"
                    );
                    sink.update_status(DataSourceState::Interrupted, Some(error));
                }
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(tx) = init_tx.take() {
            let _ = tx.send(false);
        }
    }

    async fn consume(
        &self,
        mut stream: ByteStream,
        sink: &Arc<dyn UpdateSink>,
        init_tx: &mut Option<oneshot::Sender<bool>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamOutcome {
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.changed() => return StreamOutcome::Shutdown,
                c = stream.next() => c,
            };
            match chunk {
                None => {
                    return StreamOutcome::Restart(DataSourceError::new(
                        DataSourceErrorKind::NetworkError,
                        "stream closed by server",
                    ));
                }
                Some(Err(e)) => {
                    return StreamOutcome::Restart(DataSourceError::new(
                        DataSourceErrorKind::NetworkError,
                        e.to_string(),
                    ));
                }
                Some(Ok(bytes)) => {
                    for event in parser.feed(&bytes) {
                        if let Err(outcome) = self.process_event(event, sink, init_tx) {
                            return outcome;
                        }
                    }
                }
            }
        }
    }

    fn process_event(
        &self,
        event: SseEvent,
        sink: &Arc<dyn UpdateSink>,
        init_tx: &mut Option<oneshot::Sender<bool>>,
    ) -> Result<(), StreamOutcome> {
        match event.name.as_str() {
            "put" => {
                let body: PutBody = parse_event_data(&event.data)?;
                let data = body.data.into_data_set();
                sink.init(data).map_err(store_error_outcome)?;
                sink.update_status(DataSourceState::Valid, None);
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(true);
                }
                Ok(())
            }
            "patch" => {
                let body: PatchBody = parse_event_data(&event.data)?;
                let (kind, key) = parse_path(&body.path)?;
                let item = match kind {
                    DataKind::Features => {
                        let mut flag: FeatureFlag =
                            serde_json::from_value(body.data).map_err(invalid_data_outcome)?;
                        flag.preprocess();
                        ItemDescriptor::flag(flag)
                    }
                    DataKind::Segments => {
                        let mut segment: Segment =
                            serde_json::from_value(body.data).map_err(invalid_data_outcome)?;
                        segment.preprocess();
                        ItemDescriptor::segment(segment)
                    }
                };
                sink.upsert(kind, &key, item).map_err(store_error_outcome)?;
                Ok(())
            }
            "delete" => {
                let body: DeleteBody = parse_event_data(&event.data)?;
                let (kind, key) = parse_path(&body.path)?;
                sink.upsert(kind, &key, ItemDescriptor::tombstone(body.version))
                    .map_err(store_error_outcome)?;
                Ok(())
            }
            other => {
                tracing::info!(event = other, "ignoring unrecognised stream event");
                Ok(())
            }
        }
    }

    fn record_stream_init(&self, timestamp: u64, started: Instant, failed: bool) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_stream_init(
                timestamp,
                started.elapsed().as_millis() as u64,
                failed,
            );
        }
    }
}

impl DataSource for StreamingDataSource {
    fn start(self: Arc<Self>, sink: Arc<dyn UpdateSink>) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(self.run(sink, tx));
        rx
    }

    fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum StreamOutcome {
    Shutdown,
    Restart(DataSourceError),
}

fn is_terminal_http(status: u16) -> bool {
    status == 401 || status == 403
}

fn parse_event_data<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, StreamOutcome> {
    serde_json::from_str(data).map_err(invalid_data_outcome)
}

fn invalid_data_outcome(e: impl std::fmt::Display) -> StreamOutcome {
    StreamOutcome::Restart(DataSourceError::new(
        DataSourceErrorKind::InvalidData,
        e.to_string(),
    ))
}

fn store_error_outcome(e: crate::error::StoreError) -> StreamOutcome {
    StreamOutcome::Restart(DataSourceError::new(
        DataSourceErrorKind::StoreError,
        e.to_string(),
    ))
}

fn parse_path(path: &str) -> Result<(DataKind, String), StreamOutcome> {
    if let Some(key) = path.strip_prefix("/flags/") {
        if !key.is_empty() {
            return Ok((DataKind::Features, key.to_string()));
        }
    }
    if let Some(key) = path.strip_prefix("/segments/") {
        if !key.is_empty() {
            return Ok((DataKind::Segments, key.to_string()));
        }
    }
    Err(invalid_data_outcome(format!(
        "unrecognised resource path {:?}",
        path
    )))
}

#[derive(Deserialize)]
struct PutBody {
    #[serde(default)]
    #[allow(dead_code)]
    path: Option<String>,
    data: AllData,
}

#[derive(Deserialize)]
struct PatchBody {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteBody {
    path: String,
    version: u64,
}

/// The full payload shape shared by stream `put` events and polling
/// responses.
#[derive(Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

impl AllData {
    pub fn into_data_set(self) -> FullDataSet {
        let segments = self
            .segments
            .into_iter()
            .map(|(key, mut segment)| {
                segment.preprocess();
                (key, ItemDescriptor::segment(segment))
            })
            .collect();
        let flags = self
            .flags
            .into_iter()
            .map(|(key, mut flag)| {
                flag.preprocess();
                (key, ItemDescriptor::flag(flag))
            })
            .collect();
        vec![(DataKind::Segments, segments), (DataKind::Features, flags)]
    }
}

/// Incremental SSE frame parser: accumulates lines, emits an event at every
/// blank line. Comment lines (leading `:`) and fields other than `event` and
/// `data` are ignored.
struct SseParser {
    buffer: String,
    event_name: String,
    data: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

impl SseParser {
    fn new() -> SseParser {
        SseParser {
            buffer: String::new(),
            event_name: String::new(),
            data: Vec::new(),
        }
    }

    fn feed(&mut self, bytes: &Bytes) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() || !self.event_name.is_empty() {
                    events.push(SseEvent {
                        name: std::mem::take(&mut self.event_name),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event_name = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }
}

/// Production connector: `GET {base_uri}/all` with the SDK key and an SSE
/// accept header.
pub struct ReqwestStreamingConnector {
    client: reqwest::Client,
    uri: String,
    sdk_key: String,
    custom_headers: Vec<(String, String)>,
}

impl ReqwestStreamingConnector {
    pub fn new(
        client: reqwest::Client,
        base_uri: &str,
        sdk_key: &str,
        custom_headers: Vec<(String, String)>,
    ) -> ReqwestStreamingConnector {
        ReqwestStreamingConnector {
            client,
            uri: format!("{}/all", base_uri.trim_end_matches('/')),
            sdk_key: sdk_key.to_string(),
            custom_headers,
        }
    }
}

#[async_trait]
impl StreamingConnector for ReqwestStreamingConnector {
    async fn connect(&self) -> Result<ByteStream, ConnectFailure> {
        let mut request = self
            .client
            .get(&self.uri)
            .header(reqwest::header::AUTHORIZATION, &self.sdk_key)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (name, value) in &self.custom_headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConnectFailure::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectFailure::Http(status.as_u16()));
        }
        Ok(Box::pin(response.bytes_stream().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })))
    }
}

/// Jittered exponential backoff, as used between reconnection attempts.
struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            attempts: 0,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.initial.saturating_mul(1u32 << self.attempts.min(16));
        let capped = exp.min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        // Jitter into [capped/2, capped] to avoid reconnect stampedes.
        let half = capped / 2;
        half + capped.mul_f64(0.5 * rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Result<Vec<Bytes>, ConnectFailure>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Result<Vec<Bytes>, ConnectFailure>>) -> Arc<ScriptedConnector> {
            Arc::new(ScriptedConnector {
                scripts: Mutex::new(scripts.into()),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamingConnector for ScriptedConnector {
        async fn connect(&self) -> Result<ByteStream, ConnectFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.len() > 1 {
                    scripts.pop_front()
                } else {
                    // The final script replays on every later attempt.
                    scripts.front().cloned()
                }
            };
            match next {
                Some(Ok(chunks)) => {
                    let stream = futures_util::stream::iter(
                        chunks.into_iter().map(Ok::<_, std::io::Error>),
                    )
                    // Keep the connection open after the scripted chunks so
                    // the source does not immediately reconnect.
                    .chain(futures_util::stream::pending());
                    Ok(Box::pin(stream))
                }
                Some(Err(failure)) => Err(failure),
                None => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        inits: Mutex<Vec<FullDataSet>>,
        upserts: Mutex<Vec<(DataKind, String, ItemDescriptor)>>,
        statuses: Mutex<Vec<(DataSourceState, Option<DataSourceError>)>>,
        fail_commits: std::sync::atomic::AtomicBool,
    }

    impl UpdateSink for RecordingSink {
        fn init(&self, data: FullDataSet) -> Result<(), crate::error::StoreError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(crate::error::StoreError::unavailable("down"));
            }
            self.inits.lock().unwrap().push(data);
            Ok(())
        }

        fn upsert(
            &self,
            kind: DataKind,
            key: &str,
            item: ItemDescriptor,
        ) -> Result<bool, crate::error::StoreError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(crate::error::StoreError::unavailable("down"));
            }
            self.upserts
                .lock()
                .unwrap()
                .push((kind, key.to_string(), item));
            Ok(true)
        }

        fn update_status(&self, state: DataSourceState, error: Option<DataSourceError>) {
            self.statuses.lock().unwrap().push((state, error));
        }
    }

    fn sse(text: &str) -> Bytes {
        Bytes::from(text.to_string())
    }

    fn put_event() -> Bytes {
        sse(concat!(
            "event: put\n",
            "data: {\"data\":{\"flags\":{\"a\":{\"key\":\"a\",\"version\":1,\"on\":false,\"variations\":[true],\"salt\":\"s\"}},\"segments\":{}}}\n",
            "\n"
        ))
    }

    fn source(
        connector: Arc<ScriptedConnector>,
    ) -> (Arc<StreamingDataSource>, Arc<RecordingSink>) {
        let source = Arc::new(StreamingDataSource::new(
            connector,
            Duration::from_millis(10),
            None,
        ));
        (source, Arc::new(RecordingSink::default()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn sse_parser_frames_events() {
        let mut parser = SseParser::new();
        let events = parser.feed(&sse(
            ": comment\nevent: put\ndata: {\"x\":1}\n\nevent: patch\ndata: one\ndata: two\n\n",
        ));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "put");
        assert_eq!(events[0].data, "{\"x\":1}");
        assert_eq!(events[1].name, "patch");
        assert_eq!(events[1].data, "one\ntwo");
        // Partial frames wait for the terminating blank line.
        assert!(parser.feed(&sse("event: delete\ndata: {}")).is_empty());
        let events = parser.feed(&sse("\n\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "delete");
    }

    #[tokio::test]
    async fn put_initialises_and_completes_start() {
        let connector = ScriptedConnector::new(vec![Ok(vec![put_event()])]);
        let (source, sink) = source(connector);
        let init = source.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        assert!(init.await.unwrap());
        assert_eq!(sink.inits.lock().unwrap().len(), 1);
        let statuses = sink.statuses.lock().unwrap();
        assert_eq!(statuses.last().unwrap().0, DataSourceState::Valid);
    }

    #[tokio::test]
    async fn patch_and_delete_route_by_path() {
        let connector = ScriptedConnector::new(vec![Ok(vec![
            put_event(),
            sse("event: patch\ndata: {\"path\":\"/flags/a\",\"data\":{\"key\":\"a\",\"version\":2,\"on\":true,\"variations\":[true],\"fallthrough\":{\"variation\":0},\"salt\":\"s\"}}\n\n"),
            sse("event: patch\ndata: {\"path\":\"/segments/s\",\"data\":{\"key\":\"s\",\"version\":1,\"salt\":\"s\"}}\n\n"),
            sse("event: delete\ndata: {\"path\":\"/flags/a\",\"version\":3}\n\n"),
        ])]);
        let (source, sink) = source(connector);
        source.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap();
        settle().await;
        let upserts = sink.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 3);
        assert_eq!(upserts[0].0, DataKind::Features);
        assert_eq!(upserts[0].1, "a");
        assert_eq!(upserts[0].2.version, 2);
        assert_eq!(upserts[1].0, DataKind::Segments);
        assert!(upserts[2].2.is_tombstone());
        assert_eq!(upserts[2].2.version, 3);
    }

    #[tokio::test]
    async fn malformed_json_restarts_connection() {
        let connector = ScriptedConnector::new(vec![
            Ok(vec![sse("event: put\ndata: {not json}\n\n")]),
            Ok(vec![put_event()]),
        ]);
        let (source, sink) = source(connector.clone());
        let init = source.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        assert!(init.await.unwrap());
        assert!(connector.connects.load(Ordering::SeqCst) >= 2);
        let statuses = sink.statuses.lock().unwrap();
        let interrupted = statuses
            .iter()
            .find(|(s, _)| *s == DataSourceState::Interrupted)
            .expect("reported interruption");
        assert_eq!(
            interrupted.1.as_ref().unwrap().kind,
            DataSourceErrorKind::InvalidData
        );
    }

    #[tokio::test]
    async fn unknown_path_restarts_connection() {
        let connector = ScriptedConnector::new(vec![
            Ok(vec![sse(
                "event: patch\ndata: {\"path\":\"/mysteries/x\",\"data\":{}}\n\n",
            )]),
            Ok(vec![put_event()]),
        ]);
        let (source, sink) = source(connector.clone());
        source.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap();
        assert!(connector.connects.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn store_error_restarts_with_store_error_status() {
        let connector = ScriptedConnector::new(vec![
            Ok(vec![put_event()]),
            Ok(vec![put_event()]),
        ]);
        let (source, sink) = source(connector);
        sink.fail_commits.store(true, Ordering::SeqCst);
        let init = source.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        settle().await;
        {
            let statuses = sink.statuses.lock().unwrap();
            let (_, error) = statuses
                .iter()
                .find(|(s, _)| *s == DataSourceState::Interrupted)
                .expect("interrupted");
            assert_eq!(
                error.as_ref().unwrap().kind,
                DataSourceErrorKind::StoreError
            );
        }
        // Once the store recovers, the retried connection initialises.
        sink.fail_commits.store(false, Ordering::SeqCst);
        assert!(init.await.unwrap());
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored_without_restart() {
        let connector = ScriptedConnector::new(vec![Ok(vec![
            sse("event: shenanigans\ndata: {}\n\n"),
            put_event(),
        ])]);
        let (source, sink) = source(connector.clone());
        assert!(source.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_terminal() {
        let connector = ScriptedConnector::new(vec![Err(ConnectFailure::Http(401))]);
        let (source, sink) = source(connector.clone());
        let init = source.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        assert!(!init.await.unwrap());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let statuses = sink.statuses.lock().unwrap();
        assert_eq!(statuses.last().unwrap().0, DataSourceState::Off);
    }

    #[tokio::test]
    async fn recoverable_http_errors_reconnect() {
        let connector = ScriptedConnector::new(vec![
            Err(ConnectFailure::Http(503)),
            Err(ConnectFailure::Network("connection refused".into())),
            Ok(vec![put_event()]),
        ]);
        let (source, sink) = source(connector.clone());
        assert!(source.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_inits_are_recorded() {
        let diagnostics = Arc::new(DiagnosticsAccumulator::new("sdk-key"));
        let connector = ScriptedConnector::new(vec![
            Err(ConnectFailure::Http(500)),
            Ok(vec![put_event()]),
        ]);
        let source = Arc::new(StreamingDataSource::new(
            connector,
            Duration::from_millis(10),
            Some(diagnostics.clone()),
        ));
        let sink = Arc::new(RecordingSink::default());
        assert!(source.clone().start(sink as Arc<dyn UpdateSink>).await.unwrap());
        let stats = diagnostics.stats_event(0);
        let inits = stats["streamInits"].as_array().unwrap();
        assert_eq!(inits.len(), 2);
        assert_eq!(inits[0]["failed"], true);
        assert_eq!(inits[1]["failed"], false);
    }

    #[tokio::test]
    async fn close_stops_the_worker() {
        let connector = ScriptedConnector::new(vec![Ok(vec![put_event()])]);
        let (source, sink) = source(connector);
        let init = source.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        assert!(init.await.unwrap());
        source.close();
        settle().await;
        // No further connections or commits after close.
        assert_eq!(sink.inits.lock().unwrap().len(), 1);
    }
}
