//! The event pipeline's two workers and its public handle.
//!
//! The inbox worker owns all mutable pipeline state (buffer, summarizer,
//! deduplication set); the flush worker owns delivery. They communicate over
//! bounded channels, and every overflow drops events with a counted drop
//! rather than blocking an application thread.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::EventsConfig;
use crate::events::dedup::ContextDeduplicator;
use crate::events::diagnostics::DiagnosticsAccumulator;
use crate::events::output::{self, OutputConfig};
use crate::events::sender::EventSender;
use crate::events::summarizer::EventSummarizer;
use crate::events::{now_millis, BaseEvent, FeatureRequestEvent, InputEvent};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum EventMessage {
    Event(Box<InputEvent>),
    Flush,
    Shutdown(oneshot::Sender<()>),
}

enum FlushTask {
    Events(Vec<Value>),
    Diagnostic(Value),
    Stop(oneshot::Sender<()>),
}

/// Handle through which the client feeds the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct EventProcessor {
    inbox: mpsc::Sender<EventMessage>,
    disabled: Arc<AtomicBool>,
    diagnostics: Arc<DiagnosticsAccumulator>,
    inbox_full_logged: Arc<AtomicBool>,
}

impl EventProcessor {
    pub fn new(
        config: &EventsConfig,
        sender: Arc<dyn EventSender>,
        diagnostics: Arc<DiagnosticsAccumulator>,
        diagnostics_enabled: bool,
        diagnostic_config: Value,
    ) -> EventProcessor {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.capacity.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let disabled = Arc::new(AtomicBool::new(false));
        let last_server_time = Arc::new(AtomicI64::new(0));
        let last_batch_size = Arc::new(AtomicU64::new(0));

        tokio::spawn(flush_worker(
            flush_rx,
            sender,
            disabled.clone(),
            last_server_time.clone(),
            last_batch_size.clone(),
        ));

        if diagnostics_enabled {
            let init = diagnostics.init_event(diagnostic_config);
            let _ = flush_tx.try_send(FlushTask::Diagnostic(init));
        }

        let state = InboxState {
            buffer: Vec::new(),
            capacity: config.capacity,
            overflow_logged: false,
            summarizer: EventSummarizer::new(),
            dedup: ContextDeduplicator::new(config.context_keys_capacity),
            output_config: OutputConfig::new(
                config.all_attributes_private,
                &config.private_attributes,
            ),
            disabled: disabled.clone(),
            last_server_time,
            last_batch_size,
            diagnostics: diagnostics.clone(),
            diagnostics_enabled,
            flush_tx,
        };
        tokio::spawn(inbox_worker(
            inbox_rx,
            state,
            config.flush_interval,
            config.context_keys_flush_interval,
            config.diagnostic_recording_interval,
        ));

        EventProcessor {
            inbox: inbox_tx,
            disabled,
            diagnostics,
            inbox_full_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queues an event; never blocks. Overflow drops the event and counts it.
    pub fn send(&self, event: InputEvent) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match self.inbox.try_send(EventMessage::Event(Box::new(event))) {
            Ok(()) => {
                self.inbox_full_logged.store(false, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.diagnostics.record_events_dropped(1);
                if !self.inbox_full_logged.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        "event inbox is full; analytics events are being dropped"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Asks the inbox worker to flush ahead of the timer.
    pub fn trigger_flush(&self) {
        let _ = self.inbox.try_send(EventMessage::Flush);
    }

    /// Final flush and shutdown, bounded by a drain timeout.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inbox
            .send(EventMessage::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ack_rx).await;
        }
    }
}

struct InboxState {
    buffer: Vec<Value>,
    capacity: usize,
    overflow_logged: bool,
    summarizer: EventSummarizer,
    dedup: ContextDeduplicator,
    output_config: OutputConfig,
    disabled: Arc<AtomicBool>,
    last_server_time: Arc<AtomicI64>,
    last_batch_size: Arc<AtomicU64>,
    diagnostics: Arc<DiagnosticsAccumulator>,
    diagnostics_enabled: bool,
    flush_tx: mpsc::Sender<FlushTask>,
}

async fn inbox_worker(
    mut inbox: mpsc::Receiver<EventMessage>,
    mut state: InboxState,
    flush_interval: Duration,
    dedup_flush_interval: Duration,
    diagnostic_interval: Duration,
) {
    let start = tokio::time::Instant::now();
    let mut flush_timer = tokio::time::interval_at(start + flush_interval, flush_interval);
    let mut dedup_timer =
        tokio::time::interval_at(start + dedup_flush_interval, dedup_flush_interval);
    let mut diagnostic_timer =
        tokio::time::interval_at(start + diagnostic_interval, diagnostic_interval);
    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                None => break,
                Some(EventMessage::Event(event)) => state.process(*event),
                Some(EventMessage::Flush) => state.flush(),
                Some(EventMessage::Shutdown(ack)) => {
                    state.flush();
                    let (done_tx, done_rx) = oneshot::channel();
                    if state.flush_tx.send(FlushTask::Stop(done_tx)).await.is_ok() {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, done_rx).await;
                    }
                    let _ = ack.send(());
                    break;
                }
            },
            _ = flush_timer.tick() => state.flush(),
            _ = dedup_timer.tick() => state.dedup.clear(),
            _ = diagnostic_timer.tick() => state.send_diagnostics(),
        }
    }
}

impl InboxState {
    fn process(&mut self, event: InputEvent) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match event {
            InputEvent::Feature(e) => {
                let sampled = sample(e.sampling_ratio);
                if !e.exclude_from_summaries {
                    self.summarizer.summarize(&e);
                }
                self.notice_context(&e.base);
                if e.track_events && sampled {
                    self.enqueue(output::feature_event(&e));
                }
                if self.debug_eligible(&e) && sampled {
                    self.enqueue(output::debug_event(&e, &self.output_config.clone()));
                }
            }
            InputEvent::Identify(e) => {
                self.dedup.notice(e.base.context.fully_qualified_key());
                self.enqueue(output::identify_event(&e, &self.output_config.clone()));
            }
            InputEvent::Custom(e) => {
                self.notice_context(&e.base);
                self.enqueue(output::custom_event(&e));
            }
        }
    }

    /// Emits an index event the first time a context key is seen within the
    /// deduplication interval.
    fn notice_context(&mut self, base: &BaseEvent) {
        if self.dedup.notice(base.context.fully_qualified_key()) {
            self.diagnostics.record_context_deduplicated();
        } else {
            self.enqueue(output::index_event(
                base.creation_date,
                &base.context,
                &self.output_config.clone(),
            ));
        }
    }

    fn debug_eligible(&self, event: &FeatureRequestEvent) -> bool {
        let Some(debug_until) = event.debug_events_until_date else {
            return false;
        };
        let server = self.last_server_time.load(Ordering::SeqCst).max(0) as u64;
        debug_until > now_millis().max(server)
    }

    fn enqueue(&mut self, event: Value) {
        if self.buffer.len() >= self.capacity {
            self.diagnostics.record_events_dropped(1);
            if !self.overflow_logged {
                self.overflow_logged = true;
                tracing::warn!(
                    capacity = self.capacity,
                    "event buffer is full; analytics events are being dropped"
                );
            }
            return;
        }
        self.buffer.push(event);
    }

    fn flush(&mut self) {
        self.overflow_logged = false;
        let mut events = std::mem::take(&mut self.buffer);
        if let Some(summary) = self.summarizer.take_event() {
            // The summary always closes the batch.
            events.push(summary);
        }
        if events.is_empty() || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        match self.flush_tx.try_send(FlushTask::Events(events)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(FlushTask::Events(events))) => {
                self.diagnostics.record_events_dropped(events.len() as u64);
                tracing::warn!(
                    "event delivery cannot keep up; dropping a batch of {} events",
                    events.len()
                );
            }
            Err(_) => {}
        }
    }

    fn send_diagnostics(&mut self) {
        if !self.diagnostics_enabled || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let stats = self
            .diagnostics
            .stats_event(self.last_batch_size.load(Ordering::SeqCst));
        let _ = self.flush_tx.try_send(FlushTask::Diagnostic(stats));
    }
}

fn sample(ratio: Option<u32>) -> bool {
    match ratio {
        None | Some(1) => true,
        // Zero means never emit.
        Some(0) => false,
        Some(n) => rand::thread_rng().gen_range(0..n) == 0,
    }
}

async fn flush_worker(
    mut tasks: mpsc::Receiver<FlushTask>,
    sender: Arc<dyn EventSender>,
    disabled: Arc<AtomicBool>,
    last_server_time: Arc<AtomicI64>,
    last_batch_size: Arc<AtomicU64>,
) {
    while let Some(task) = tasks.recv().await {
        match task {
            FlushTask::Events(events) => {
                if disabled.load(Ordering::SeqCst) {
                    continue;
                }
                let count = events.len() as u64;
                let result = sender.send_events(events).await;
                last_batch_size.store(count, Ordering::SeqCst);
                apply_result(&result, &disabled, &last_server_time);
            }
            FlushTask::Diagnostic(payload) => {
                if disabled.load(Ordering::SeqCst) {
                    continue;
                }
                let result = sender.send_diagnostic(payload).await;
                apply_result(&result, &disabled, &last_server_time);
            }
            FlushTask::Stop(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
}

fn apply_result(
    result: &crate::events::EventSenderResult,
    disabled: &AtomicBool,
    last_server_time: &AtomicI64,
) {
    if let Some(server_time) = result.server_time {
        last_server_time.store(server_time.timestamp_millis(), Ordering::SeqCst);
    }
    if result.must_shutdown {
        tracing::error!("event delivery permanently disabled by server response");
        disabled.store(true, Ordering::SeqCst);
    }
}
