//! End-to-end ingestion: a scripted SSE stream drives the real update sink,
//! in-memory store, and flag-change broadcaster.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use flag_engine_client::broadcast::{Broadcaster, FlagChangeEvent};
use flag_engine_client::datasource::sink::UpdateSinkImpl;
use flag_engine_client::datasource::streaming::{
    ByteStream, ConnectFailure, StreamingConnector, StreamingDataSource,
};
use flag_engine_client::datasource::{DataSource, DataSourceState, UpdateSink};
use flag_engine_client::store::memory::InMemoryDataStore;
use flag_engine_client::store::{DataKind, DataStore};

struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Bytes>>>,
}

#[async_trait]
impl StreamingConnector for ScriptedConnector {
    async fn connect(&self) -> Result<ByteStream, ConnectFailure> {
        let Some(chunks) = self.scripts.lock().unwrap().pop_front() else {
            futures_util::future::pending::<()>().await;
            unreachable!()
        };
        let stream = futures_util::stream::iter(
            chunks.into_iter().map(Ok::<_, std::io::Error>),
        )
        .chain(futures_util::stream::pending());
        Ok(Box::pin(stream))
    }
}

fn frame(event: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

#[tokio::test]
async fn put_then_patch_lands_in_store_with_one_change_event() {
    let connector = Arc::new(ScriptedConnector {
        scripts: Mutex::new(VecDeque::from([vec![
            frame(
                "put",
                r#"{"data":{"flags":{
                    "a":{"key":"a","version":1,"on":true,"variations":[true],"fallthrough":{"variation":0},"salt":"s"},
                    "b":{"key":"b","version":1,"on":true,"variations":[true],"fallthrough":{"variation":0},"salt":"s"}
                },"segments":{}}}"#,
            ),
            frame(
                "patch",
                r#"{"path":"/flags/a","data":{"key":"a","version":2,"on":false,"variations":[true],"offVariation":0,"salt":"s"}}"#,
            ),
            frame("delete", r#"{"path":"/flags/b","version":3}"#),
        ]])),
    });

    let store = Arc::new(InMemoryDataStore::new());
    let flag_changes: Arc<Broadcaster<FlagChangeEvent>> = Arc::new(Broadcaster::new());
    let status_broadcasts = Arc::new(Broadcaster::new());
    let sink = Arc::new(UpdateSinkImpl::new(
        store.clone() as Arc<dyn DataStore>,
        flag_changes.clone(),
        status_broadcasts,
        Duration::from_secs(60),
    ));
    let changed_keys = Arc::new(Mutex::new(Vec::new()));
    {
        let changed_keys = changed_keys.clone();
        flag_changes.add_listener(move |e: &FlagChangeEvent| {
            changed_keys.lock().unwrap().push(e.key.clone());
        });
    }

    let source = Arc::new(StreamingDataSource::new(
        connector,
        Duration::from_millis(10),
        None,
    ));
    let ready = source
        .clone()
        .start(sink.clone() as Arc<dyn UpdateSink>)
        .await
        .unwrap();
    assert!(ready);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(store.is_initialized());
    assert_eq!(sink.current_status().state, DataSourceState::Valid);

    let a = store.get(DataKind::Features, "a").unwrap().unwrap();
    assert_eq!(a.version, 2);
    let flag_a = a.item.unwrap().as_flag().unwrap().clone();
    assert!(!flag_a.on);

    let b = store.get(DataKind::Features, "b").unwrap().unwrap();
    assert!(b.is_tombstone());
    assert_eq!(b.version, 3);

    // The put fans out one event per new flag; the patch and delete add one
    // each for the keys they touched.
    let keys = changed_keys.lock().unwrap().clone();
    let patches_for_a = keys.iter().filter(|k| *k == "a").count();
    let deletes_for_b = keys.iter().filter(|k| *k == "b").count();
    assert_eq!(patches_for_a, 2, "put + patch");
    assert_eq!(deletes_for_b, 2, "put + delete");

    source.close();
}
