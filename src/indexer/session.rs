// SPDX-License-Identifier: Apache-2.0

//! The indexing session: a single task owning the bulk queue, the in-memory
//! batch table, start times, counters, and the cluster-readiness flag. All
//! state changes happen on this task; HTTP requests and health probes run as
//! spawned tasks that deliver completion events back through a channel, so
//! a partially built batch is never observable by a dispatch.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use tokio::select;
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::config::ElasticsearchConfig;
use crate::document::Document;
use crate::indexer::backlog::{Backlog, BacklogError};
use crate::indexer::bulk;
use crate::indexer::dispatch::{BulkSummary, DispatchError, Dispatcher};
use crate::indexer::stats::{self, Stats, StatsHandler};

/// Replay cadence while the backlog fits in one pass.
const REPLAY_DELAY: Duration = Duration::from_secs(60);
/// Replay cadence while more entries remain than one pass submits.
const REPLAY_BUSY_DELAY: Duration = Duration::from_secs(15);
/// Batches submitted per replay pass.
const REPLAY_MAX_PER_PASS: usize = 25;
/// A reclaim runs after every this many spills.
const RECLAIM_EVERY_SPILLS: u64 = 10;
/// Upper bound of the multiplicative startup jitter on flush parameters.
const JITTER_MAX: f64 = 0.45;

const EVENT_CHANNEL_SIZE: usize = 64;

/// Mailbox messages from the pipeline.
pub enum Message {
    Ingest { lines: u64, docs: Vec<Document> },
    TailError,
    Flush,
    Shutdown,
}

/// Completions delivered back onto the session task.
enum Event {
    Response {
        id: String,
        result: Result<BulkSummary, DispatchError>,
    },
    Probe {
        healthy: bool,
    },
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub servers: Vec<String>,
    pub timeout: u64,
    pub flush_interval: u64,
    pub flush_size: usize,
    pub default_index: String,
    pub default_type: String,
    pub batch_dir: PathBuf,
    pub batch_disk_space: Option<u64>,
    pub stats_interval: u64,
    pub templates: BTreeMap<String, Value>,
    pub replay_delay: Duration,
    pub replay_busy_delay: Duration,
    pub health_probe_interval: Duration,
}

impl IndexerConfig {
    pub fn new(es: &ElasticsearchConfig, stats_interval: u64) -> Self {
        Self {
            servers: es.servers.clone(),
            timeout: es.timeout,
            flush_interval: es.flush_interval,
            flush_size: es.flush_size,
            default_index: es.index.clone(),
            default_type: es.doc_type.clone(),
            batch_dir: es.batch_dir.clone(),
            batch_disk_space: es.batch_disk_space,
            stats_interval,
            templates: es.templates.clone(),
            replay_delay: REPLAY_DELAY,
            replay_busy_delay: REPLAY_BUSY_DELAY,
            health_probe_interval: Duration::from_secs(60),
        }
    }
}

pub struct Indexer {
    flush_interval: Duration,
    flush_size: usize,
    default_index: String,
    default_type: String,
    stats_interval: Duration,
    replay_delay: Duration,
    replay_busy_delay: Duration,
    health_probe_interval: Duration,
    templates: BTreeMap<String, Value>,

    dispatcher: std::sync::Arc<Dispatcher>,
    backlog: Backlog,

    queue: Vec<Bytes>,
    batches: HashMap<String, Bytes>,
    started: HashMap<String, Instant>,
    stats: Stats,
    stats_handler: Option<StatsHandler>,

    es_ready: bool,
    shutdown: bool,
    mailbox_open: bool,
    force_flush: bool,
    probe_inflight: bool,
    next_flush: Option<Instant>,
    next_replay: Option<Instant>,
    spill_count: u64,
    retry_spill: Vec<String>,
    inflight: usize,

    events_tx: BoundedSender<Event>,
    events_rx: BoundedReceiver<Event>,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        stats_handler: Option<StatsHandler>,
    ) -> Result<Self, BacklogError> {
        let backlog = Backlog::open(config.batch_dir.clone(), config.batch_disk_space)?;

        // Desynchronize co-deployed instances: both flush parameters get the
        // same multiplicative jitter in [1.00, 1.45].
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..=JITTER_MAX);
        let flush_size = ((config.flush_size as f64 * jitter).round() as usize).max(1);
        let flush_interval = Duration::from_secs_f64(config.flush_interval as f64 * jitter);
        debug!(
            flush_size,
            ?flush_interval,
            "flush parameters after startup jitter"
        );

        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_SIZE);

        Ok(Self {
            flush_interval,
            flush_size,
            default_index: config.default_index,
            default_type: config.default_type,
            stats_interval: Duration::from_secs(config.stats_interval.max(1)),
            replay_delay: config.replay_delay,
            replay_busy_delay: config.replay_busy_delay,
            health_probe_interval: config.health_probe_interval,
            templates: config.templates,
            dispatcher: std::sync::Arc::new(Dispatcher::new(config.servers, config.timeout)),
            backlog,
            queue: Vec::new(),
            batches: HashMap::new(),
            started: HashMap::new(),
            stats: Stats::default(),
            stats_handler,
            es_ready: false,
            shutdown: false,
            mailbox_open: true,
            force_flush: false,
            probe_inflight: false,
            next_flush: None,
            next_replay: None,
            spill_count: 0,
            retry_spill: Vec::new(),
            inflight: 0,
            events_tx,
            events_rx,
        })
    }

    /// Run the session until shutdown has drained the queue and every
    /// in-flight request has completed.
    pub async fn run(mut self, mut mailbox: BoundedReceiver<Message>, cancel: CancellationToken) {
        if !self.templates.is_empty() {
            self.dispatcher.sync_templates(&self.templates).await;
        }

        // Entries left over from an earlier run get a replay pass.
        if matches!(self.backlog.list(), Ok(ids) if !ids.is_empty()) {
            self.next_replay = Some(Instant::now() + self.replay_delay);
        }

        let mut stats_timer = interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        let mut health_timer = interval_at(
            Instant::now() + Duration::from_secs(1),
            self.health_probe_interval,
        );

        loop {
            if self.shutdown && self.inflight == 0 && self.queue.is_empty() {
                break;
            }

            let flush_at = self.next_flush.unwrap_or_else(far_future);
            let replay_at = self.next_replay.unwrap_or_else(far_future);

            select! {
                _ = cancel.cancelled(), if !self.shutdown => {
                    self.begin_shutdown();
                }
                Some(event) = self.events_rx.next() => {
                    self.handle_event(event);
                }
                msg = mailbox.next(), if self.mailbox_open => {
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => {
                            // Every producer is gone: end of input.
                            self.mailbox_open = false;
                            self.begin_shutdown();
                        }
                    }
                }
                _ = sleep_until(flush_at), if self.next_flush.is_some() => {
                    self.flush();
                }
                _ = sleep_until(replay_at), if self.next_replay.is_some() => {
                    self.replay();
                }
                _ = stats_timer.tick(), if !self.shutdown => {
                    self.report_stats();
                }
                _ = health_timer.tick(), if !self.es_ready && !self.shutdown => {
                    self.probe_health();
                }
            }
        }

        self.report_stats();
        info!("indexing session closed");
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Ingest { lines, docs } => {
                self.stats.received += lines;
                if !self.shutdown {
                    self.enqueue(docs);
                }
            }
            Message::TailError => {
                self.stats.wheel_error += 1;
            }
            Message::Flush => {
                if !self.shutdown {
                    self.flush();
                }
            }
            Message::Shutdown => self.begin_shutdown(),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Response { id, result } => self.on_response(id, result),
            Event::Probe { healthy } => {
                self.probe_inflight = false;
                if healthy && !self.es_ready {
                    info!("cluster healthy, dispatching directly");
                    self.es_ready = true;
                }
            }
        }
    }

    /// Render and append documents to the queue, then arrange a flush: an
    /// immediate one when the queue has reached the flush size, a timed one
    /// otherwise.
    fn enqueue(&mut self, docs: Vec<Document>) {
        for doc in docs {
            let record = bulk::render_record(doc, &self.default_index, &self.default_type);
            self.queue.push(record);
            self.stats.docs += 1;
        }

        if self.queue.len() >= self.flush_size && !self.force_flush {
            self.force_flush = true;
            self.flush();
        } else if self.next_flush.is_none() && !self.shutdown {
            self.next_flush = Some(Instant::now() + self.flush_interval);
        }
    }

    /// Seal the queue into a content-addressed batch and hand it to the
    /// dispatcher, or to the backlog while the cluster is not ready.
    fn flush(&mut self) {
        self.next_flush = None;
        self.force_flush = false;

        // Batches whose earlier spill failed get another chance.
        let retries = std::mem::take(&mut self.retry_spill);
        for id in retries {
            if let Some(bytes) = self.batches.get(&id).cloned() {
                self.spill_bytes(&id, bytes);
            }
        }

        if !self.queue.is_empty() {
            let records = std::mem::take(&mut self.queue);
            let total: usize = records.iter().map(Bytes::len).sum();
            let mut buf = Vec::with_capacity(total);
            for record in &records {
                buf.extend_from_slice(record);
            }
            let bytes = Bytes::from(buf);
            let id = bulk::batch_id(&bytes);
            debug!(
                batch = %id,
                records = records.len(),
                bytes = bytes.len(),
                "sealed batch"
            );

            self.stats.batches += 1;
            self.started.insert(id.clone(), Instant::now());
            self.batches.insert(id.clone(), bytes.clone());

            if self.es_ready {
                self.dispatch(id, bytes);
            } else {
                self.spill_bytes(&id, bytes);
            }
        }

        if !self.shutdown {
            self.next_flush = Some(Instant::now() + self.flush_interval);
        }
    }

    /// Issue the bulk request off-task; the response comes back as an event.
    fn dispatch(&mut self, id: String, bytes: Bytes) {
        self.stats.http_req += 1;
        self.inflight += 1;
        let dispatcher = self.dispatcher.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher.send_bulk(bytes).await;
            let _ = events.send(Event::Response { id, result }).await;
        });
    }

    fn on_response(&mut self, id: String, result: Result<BulkSummary, DispatchError>) {
        self.inflight -= 1;
        let elapsed = self.started.get(&id).map(Instant::elapsed);

        match result {
            Ok(summary) => {
                self.stats.bulk_success += 1;
                self.stats.indexed += summary.indexed;
                self.stats.errors += summary.item_errors;
                debug!(
                    batch = %id,
                    indexed = summary.indexed,
                    item_errors = summary.item_errors,
                    took_ms = summary.took_ms,
                    elapsed = ?elapsed,
                    "bulk delivered"
                );

                if let Err(err) = self.backlog.remove(&id) {
                    warn!(batch = %id, %err, "failed to remove delivered batch file");
                }
                self.batches.remove(&id);
                self.started.remove(&id);
                if !self.es_ready {
                    info!("first successful bulk response, dispatching directly");
                    self.es_ready = true;
                }
            }
            Err(err) => {
                self.stats.bulk_failure += 1;
                warn!(batch = %id, %err, elapsed = ?elapsed, "bulk dispatch failed");

                if !self.backlog.contains(&id) {
                    if let Some(bytes) = self.batches.get(&id).cloned() {
                        self.spill_bytes(&id, bytes);
                    }
                } else if self.next_replay.is_none() && !self.shutdown {
                    self.next_replay = Some(Instant::now() + self.replay_delay);
                }
                // The start time stays so a later retry reports full latency.
            }
        }

        self.backlog.release(&id);
    }

    fn spill_bytes(&mut self, id: &str, bytes: Bytes) {
        match self.backlog.spill(id, &bytes) {
            Ok(wrote) => {
                if wrote {
                    self.stats.backlogged += bulk::record_count(&bytes);
                    self.spill_count += 1;
                    if self.spill_count % RECLAIM_EVERY_SPILLS == 0 {
                        self.reclaim();
                    }
                }
                self.batches.remove(id);
                if self.next_replay.is_none() && !self.shutdown {
                    self.next_replay = Some(Instant::now() + self.replay_delay);
                }
            }
            Err(err) => {
                error!(batch = %id, %err, "backlog write failed, batch stays in memory");
                if !self.retry_spill.iter().any(|r| r == id) {
                    self.retry_spill.push(id.to_string());
                }
            }
        }
    }

    /// Submit up to one pass worth of backlog entries to the dispatcher.
    /// Entries locked by another process (or already in flight here) are
    /// skipped this pass.
    fn replay(&mut self) {
        self.next_replay = None;

        let mut ids = match self.backlog.list() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%err, "backlog listing failed");
                if !self.shutdown {
                    self.next_replay = Some(Instant::now() + self.replay_delay);
                }
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        ids.shuffle(&mut rand::thread_rng());
        let total = ids.len();

        let mut submitted = 0;
        for id in ids {
            if submitted >= REPLAY_MAX_PER_PASS {
                break;
            }
            match self.backlog.read_locked(&id) {
                Ok(Some(bytes)) => {
                    self.stats.consumed += 1;
                    self.started.entry(id.clone()).or_insert_with(Instant::now);
                    self.dispatch(id, bytes);
                    submitted += 1;
                }
                Ok(None) => {} // locked elsewhere or gone
                Err(err) => warn!(batch = %id, %err, "backlog read failed"),
            }
        }
        debug!(submitted, backlog = total, "replay pass complete");

        if !self.shutdown {
            let delay = if total > REPLAY_MAX_PER_PASS {
                self.replay_busy_delay
            } else {
                self.replay_delay
            };
            self.next_replay = Some(Instant::now() + delay);
        }
    }

    fn reclaim(&mut self) {
        let outcome = self.backlog.reclaim();
        self.stats.cleanup_success += outcome.removed;
        self.stats.cleanup_fail += outcome.failed;
        if outcome.removed > 0 || outcome.failed > 0 {
            info!(
                removed = outcome.removed,
                failed = outcome.failed,
                remaining_bytes = outcome.remaining_bytes,
                "backlog reclaim complete"
            );
        }
    }

    fn probe_health(&mut self) {
        if self.probe_inflight {
            return;
        }
        self.probe_inflight = true;
        let dispatcher = self.dispatcher.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let healthy = dispatcher.cluster_healthy().await;
            let _ = events.send(Event::Probe { healthy }).await;
        });
    }

    /// Terminal: one final flush, no new timers afterwards. In-flight
    /// requests run to completion and still spill on failure.
    fn begin_shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        info!(queued = self.queue.len(), "shutdown requested, draining");
        self.shutdown = true;
        self.next_replay = None;
        self.flush();
    }

    fn report_stats(&mut self) {
        let snapshot = self.stats.snapshot();
        info!("{}", stats::report_line(&snapshot));
        if let Some(handler) = self.stats_handler.as_mut() {
            if let Err(err) = handler(&snapshot) {
                error!(%err, "stats handler failed, disabling it");
                self.stats_handler = None;
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
