//! The polling data source: periodic full-payload fetches with ETag reuse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::datasource::streaming::AllData;
use crate::datasource::{
    DataSource, DataSourceError, DataSourceErrorKind, DataSourceState, UpdateSink,
};

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one poll request.
pub enum PollResponse {
    /// 200: a full payload, with the ETag to present next time.
    Updated {
        body: String,
        etag: Option<String>,
    },
    /// 304: data unchanged.
    NotModified,
}

#[derive(Debug, Clone)]
pub enum PollFailure {
    Http(u16),
    Network(String),
}

/// Transport seam for the polling endpoint. The default implementation is
/// [`ReqwestPollRequestor`].
#[async_trait]
pub trait PollRequestor: Send + Sync {
    async fn fetch(&self, etag: Option<&str>) -> Result<PollResponse, PollFailure>;
}

pub struct PollingDataSource {
    requestor: Arc<dyn PollRequestor>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PollingDataSource {
    pub fn new(requestor: Arc<dyn PollRequestor>, interval: Duration) -> PollingDataSource {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        PollingDataSource {
            requestor,
            interval,
            shutdown_tx,
            shutdown_rx,
        }
    }

    async fn run(self: Arc<Self>, sink: Arc<dyn UpdateSink>, init_tx: oneshot::Sender<bool>) {
        let mut init_tx = Some(init_tx);
        let mut shutdown = self.shutdown_rx.clone();
        let mut etag: Option<String> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let response = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.requestor.fetch(etag.as_deref()) => r,
            };
            match response {
                Ok(PollResponse::Updated { body, etag: new_etag }) => {
                    match serde_json::from_str::<AllData>(&body) {
                        Ok(all_data) => match sink.init(all_data.into_data_set()) {
                            Ok(()) => {
                                etag = new_etag;
                                sink.update_status(DataSourceState::Valid, None);
                                if let Some(tx) = init_tx.take() {
                                    let _ = tx.send(true);
                                }
                            }
                            Err(e) => {
                                // A store failure during commit reports the
                                // source as still initializing; this source
                                // has always done so even after a previously
                                // successful poll.
                                tracing::warn!(error = %e, "failed to store polled flag data");
                                sink.update_status(
                                    DataSourceState::Initializing,
                                    Some(DataSourceError::new(
                                        DataSourceErrorKind::StoreError,
                                        e.to_string(),
                                    )),
                                );
                            }
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "polled flag data failed to parse");
                            sink.update_status(
                                DataSourceState::Interrupted,
                                Some(DataSourceError::new(
                                    DataSourceErrorKind::InvalidData,
                                    e.to_string(),
                                )),
                            );
                        }
                    }
                }
                Ok(PollResponse::NotModified) => {
                    sink.update_status(DataSourceState::Valid, None);
                }
                Err(PollFailure::Http(status)) if status == 401 || status == 403 => {
                    tracing::error!(
                        status,
                        "polling request rejected; SDK key is invalid, giving up"
                    );
                    sink.update_status(
                        DataSourceState::Off,
                        Some(DataSourceError::http(status)),
                    );
                    break;
                }
                Err(failure) => {
                    let error = match failure {
                        PollFailure::Http(status) => DataSourceError::http(status),
                        PollFailure::Network(message) => {
                            DataSourceError::new(DataSourceErrorKind::NetworkError, message)
                        }
                    };
                    tracing::warn!(error = %error.message, "poll attempt failed; will retry");
                    sink.update_status(DataSourceState::Interrupted, Some(error));
                }
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        if let Some(tx) = init_tx.take() {
            let _ = tx.send(false);
        }
    }
}

impl DataSource for PollingDataSource {
    fn start(self: Arc<Self>, sink: Arc<dyn UpdateSink>) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(self.run(sink, tx));
        rx
    }

    fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Production requestor: `GET {base_uri}/sdk/latest-all` with
/// `If-None-Match` caching.
pub struct ReqwestPollRequestor {
    client: reqwest::Client,
    uri: String,
    sdk_key: String,
    custom_headers: Vec<(String, String)>,
}

impl ReqwestPollRequestor {
    pub fn new(
        client: reqwest::Client,
        base_uri: &str,
        sdk_key: &str,
        payload_filter: Option<&str>,
        custom_headers: Vec<(String, String)>,
    ) -> ReqwestPollRequestor {
        let mut uri = format!("{}/sdk/latest-all", base_uri.trim_end_matches('/'));
        if let Some(filter) = payload_filter {
            uri.push_str("?filter=");
            uri.push_str(filter);
        }
        ReqwestPollRequestor {
            client,
            uri,
            sdk_key: sdk_key.to_string(),
            custom_headers,
        }
    }
}

#[async_trait]
impl PollRequestor for ReqwestPollRequestor {
    async fn fetch(&self, etag: Option<&str>) -> Result<PollResponse, PollFailure> {
        let mut request = self
            .client
            .get(&self.uri)
            .header(reqwest::header::AUTHORIZATION, &self.sdk_key);
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        for (name, value) in &self.custom_headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PollFailure::Network(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(PollResponse::NotModified);
        }
        if !status.is_success() {
            return Err(PollFailure::Http(status.as_u16()));
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| PollFailure::Network(e.to_string()))?;
        Ok(PollResponse::Updated { body, etag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{DataKind, FullDataSet, ItemDescriptor};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Scripted = Result<(PollResponseScript, Option<String>), PollFailure>;

    #[derive(Clone)]
    enum PollResponseScript {
        Body(String),
        NotModified,
    }

    struct ScriptedRequestor {
        scripts: Mutex<VecDeque<Scripted>>,
        etags_seen: Mutex<Vec<Option<String>>>,
        fetches: AtomicUsize,
    }

    impl ScriptedRequestor {
        fn new(scripts: Vec<Scripted>) -> Arc<ScriptedRequestor> {
            Arc::new(ScriptedRequestor {
                scripts: Mutex::new(scripts.into()),
                etags_seen: Mutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PollRequestor for ScriptedRequestor {
        async fn fetch(&self, etag: Option<&str>) -> Result<PollResponse, PollFailure> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.etags_seen
                .lock()
                .unwrap()
                .push(etag.map(str::to_string));
            let next = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.len() > 1 {
                    scripts.pop_front()
                } else {
                    scripts.front().cloned()
                }
            };
            match next {
                Some(Ok((PollResponseScript::Body(body), etag))) => {
                    Ok(PollResponse::Updated { body, etag })
                }
                Some(Ok((PollResponseScript::NotModified, _))) => Ok(PollResponse::NotModified),
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
        statuses: Mutex<Vec<(DataSourceState, Option<DataSourceError>)>>,
        fail_commits: AtomicBool,
    }

    impl UpdateSink for RecordingSink {
        fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("down"));
            }
            self.inits.lock().unwrap().push(data);
            Ok(())
        }

        fn upsert(
            &self,
            _kind: DataKind,
            _key: &str,
            _item: ItemDescriptor,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }

        fn update_status(&self, state: DataSourceState, error: Option<DataSourceError>) {
            self.statuses.lock().unwrap().push((state, error));
        }
    }

    fn body() -> String {
        r#"{"flags":{"a":{"key":"a","version":1,"on":false,"variations":[true],"salt":"s"}},"segments":{}}"#
            .to_string()
    }

    fn source(requestor: Arc<ScriptedRequestor>) -> (Arc<PollingDataSource>, Arc<RecordingSink>) {
        (
            Arc::new(PollingDataSource::new(requestor, Duration::from_millis(20))),
            Arc::new(RecordingSink::default()),
        )
    }

    #[tokio::test]
    async fn first_poll_initialises() {
        let requestor = ScriptedRequestor::new(vec![Ok((
            PollResponseScript::Body(body()),
            Some("etag-1".into()),
        ))]);
        let (src, sink) = source(requestor);
        assert!(src.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        assert_eq!(sink.inits.lock().unwrap().len(), 1);
        assert_eq!(
            sink.statuses.lock().unwrap().last().unwrap().0,
            DataSourceState::Valid
        );
    }

    #[tokio::test]
    async fn etag_is_replayed_and_304_is_a_noop() {
        let requestor = ScriptedRequestor::new(vec![
            Ok((PollResponseScript::Body(body()), Some("etag-1".into()))),
            Ok((PollResponseScript::NotModified, None)),
        ]);
        let (src, sink) = source(requestor.clone());
        assert!(src.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Only the first response carried data.
        assert_eq!(sink.inits.lock().unwrap().len(), 1);
        let etags = requestor.etags_seen.lock().unwrap();
        assert_eq!(etags[0], None);
        assert_eq!(etags[1].as_deref(), Some("etag-1"));
        src.close();
    }

    #[tokio::test]
    async fn unauthorized_is_terminal() {
        let requestor = ScriptedRequestor::new(vec![Err(PollFailure::Http(401))]);
        let (src, sink) = source(requestor.clone());
        assert!(!src.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        assert_eq!(
            sink.statuses.lock().unwrap().last().unwrap().0,
            DataSourceState::Off
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(requestor.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_next_tick() {
        let requestor = ScriptedRequestor::new(vec![
            Err(PollFailure::Http(503)),
            Err(PollFailure::Network("refused".into())),
            Ok((PollResponseScript::Body(body()), None)),
        ]);
        let (src, sink) = source(requestor);
        assert!(src.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        let statuses = sink.statuses.lock().unwrap();
        assert!(statuses
            .iter()
            .any(|(s, e)| *s == DataSourceState::Interrupted
                && e.as_ref().map(|e| e.status_code) == Some(Some(503))));
        assert!(statuses
            .iter()
            .any(|(s, e)| *s == DataSourceState::Interrupted
                && e.as_ref().map(|e| e.kind) == Some(DataSourceErrorKind::NetworkError)));
        assert_eq!(statuses.last().unwrap().0, DataSourceState::Valid);
    }

    #[tokio::test]
    async fn malformed_body_reports_invalid_data() {
        let requestor = ScriptedRequestor::new(vec![
            Ok((PollResponseScript::Body("{oops".into()), None)),
            Ok((PollResponseScript::Body(body()), None)),
        ]);
        let (src, sink) = source(requestor);
        assert!(src.clone().start(sink.clone() as Arc<dyn UpdateSink>).await.unwrap());
        let statuses = sink.statuses.lock().unwrap();
        assert!(statuses
            .iter()
            .any(|(s, e)| *s == DataSourceState::Interrupted
                && e.as_ref().map(|e| e.kind) == Some(DataSourceErrorKind::InvalidData)));
    }

    #[tokio::test]
    async fn store_error_during_commit_reports_initializing() {
        let requestor = ScriptedRequestor::new(vec![Ok((
            PollResponseScript::Body(body()),
            None,
        ))]);
        let (src, sink) = source(requestor);
        sink.fail_commits.store(true, Ordering::SeqCst);
        let init = src.clone().start(sink.clone() as Arc<dyn UpdateSink>);
        tokio::time::sleep(Duration::from_millis(60)).await;
        {
            let statuses = sink.statuses.lock().unwrap();
            let (state, error) = statuses.last().unwrap();
            assert_eq!(*state, DataSourceState::Initializing);
            assert_eq!(
                error.as_ref().unwrap().kind,
                DataSourceErrorKind::StoreError
            );
        }
        sink.fail_commits.store(false, Ordering::SeqCst);
        assert!(init.await.unwrap());
    }
}
