//! Admission-controlled request queue.
//!
//! A single long-lived consumer drains the bounded queue channel and spawns
//! one worker per request, never letting more than `max_concurrent` run at
//! once. Admission consults recent moving averages: a request whose TTL the
//! queue wait plus the namespace's query time would already blow is refused
//! synchronously, before any work starts.
//!
//! When a request opts into monitoring, a listener is interposed between the
//! pipeline output and the caller output to record latency, mean score, and
//! satisfaction into a rolling quality window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::EngineError;
use crate::metrics::{metrics, Counter, Gauge};
use crate::request::{self, AssembledRequest, PipelineOptions};
use crate::signal::{CancelSignal, WorkerGauge};
use crate::spaces::Namespace;
use crate::tracker::{LatencyTracker, QualityRecord, QualitySnapshot, QualityTracker};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub buffer: usize,
    pub max_concurrent: usize,
    pub tracker_min_step: Duration,
    pub tracker_max_buckets: usize,
    /// Lookback window for admission averages.
    pub admission_period: Duration,
    pub pipeline: PipelineOptions,
}

impl QueueOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            buffer: cfg.queue_buffer,
            max_concurrent: cfg.max_concurrent_queries,
            tracker_min_step: cfg.tracker_min_step(),
            tracker_max_buckets: cfg.tracker_max_buckets,
            admission_period: cfg.tracker_period(),
            pipeline: PipelineOptions::from_config(cfg),
        }
    }
}

struct QueuedRequest {
    req: AssembledRequest,
    ns: Arc<Namespace>,
    enqueued_at: Instant,
}

pub struct RequestQueue {
    tx: mpsc::Sender<QueuedRequest>,
    stop: CancelSignal,
    queue_wait: LatencyTracker,
    monitor: Arc<QualityTracker>,
    live: Arc<WorkerGauge>,
    opts: QueueOptions,
}

impl RequestQueue {
    /// Build the queue and start its consumer.
    pub fn start(opts: QueueOptions, stop: CancelSignal) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(opts.buffer.max(1));
        let queue = Arc::new(Self {
            tx,
            stop,
            queue_wait: LatencyTracker::new(opts.tracker_min_step, opts.tracker_max_buckets),
            monitor: Arc::new(QualityTracker::new(
                opts.tracker_min_step,
                opts.tracker_max_buckets,
            )),
            live: Arc::new(WorkerGauge::new()),
            opts,
        });
        tokio::spawn(Arc::clone(&queue).consume_loop(rx));
        queue
    }

    /// Latency admission check: refuse when the recent averages already
    /// exceed the request TTL.
    pub fn admit(&self, ns: &Namespace, ttl: Duration) -> Result<(), EngineError> {
        let period = self.opts.admission_period;
        let queue_avg = self.queue_wait.average(period).unwrap_or(Duration::ZERO);
        let query_avg = ns.query_latency.average(period).unwrap_or(Duration::ZERO);
        let projected = queue_avg + query_avg;
        if projected > ttl {
            metrics().incr(Counter::QueriesRejectedLatency);
            return Err(EngineError::LatencyBudget {
                projected_ms: projected.as_millis() as u64,
                ttl_ms: ttl.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub async fn enqueue(
        &self,
        req: AssembledRequest,
        ns: Arc<Namespace>,
    ) -> Result<(), EngineError> {
        if self.stop.is_cancelled() {
            return Err(EngineError::Stopped);
        }
        let item = QueuedRequest {
            req,
            ns,
            enqueued_at: Instant::now(),
        };
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                metrics().incr(Counter::QueriesRejectedFull);
                Err(EngineError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::Stopped),
        }
    }

    pub fn queue_latency(&self, period: Duration) -> Option<Duration> {
        self.queue_wait.average(period)
    }

    pub fn monitor_snapshot(&self, period: Duration) -> QualitySnapshot {
        self.monitor.snapshot(period)
    }

    pub fn live_workers(&self) -> usize {
        self.live.current()
    }

    async fn consume_loop(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedRequest>) {
        info!(max_concurrent = self.opts.max_concurrent, "request queue consumer started");
        loop {
            let item = tokio::select! {
                _ = self.stop.cancelled() => break,
                item = rx.recv() => match item {
                    Some(i) => i,
                    None => break,
                },
            };
            self.live.wait_below(self.opts.max_concurrent).await;
            self.live.add();
            metrics().set_gauge(Gauge::QueueLiveWorkers, self.live.current() as u64);
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.run_one(item).await;
            });
        }
        // Let in-flight workers finish before the consumer exits.
        self.live.wait_idle().await;
        info!("request queue consumer stopped");
    }

    async fn run_one(self: Arc<Self>, item: QueuedRequest) {
        let _exit = scopeguard::guard(Arc::clone(&self.live), |g| g.done());

        let wait = item.enqueued_at.elapsed();
        self.queue_wait.register(wait);

        let mut req = item.req;
        if wait > req.spec.ttl() {
            metrics().incr(Counter::QueriesDroppedWait);
            warn!(
                query_id = %req.query_id,
                waited_ms = wait.as_millis() as u64,
                ttl_ms = req.spec.ttl_ms,
                "request dropped: queue wait exceeded ttl"
            );
            // Dropping the request closes its output channel unreplied.
            return;
        }

        if req.spec.monitor {
            self.interpose_monitor(&mut req);
        }

        debug!(
            query_id = %req.query_id,
            namespace = %req.spec.namespace,
            priority = req.spec.priority,
            "query dispatched"
        );
        let started = Instant::now();
        request::execute(req, Arc::clone(&item.ns), &self.opts.pipeline).await;
        item.ns.query_latency.register(started.elapsed());
    }

    /// Swap the request output for an intermediate channel and forward the
    /// single result to the caller after recording its quality.
    fn interpose_monitor(&self, req: &mut AssembledRequest) {
        let (mtx, mut mrx) = mpsc::channel(1);
        let caller_tx = std::mem::replace(&mut req.out_tx, mtx);
        let monitor = Arc::clone(&self.monitor);
        let k = req.spec.k.max(1);
        let created = req.created;
        let query_id = req.query_id.clone();
        tokio::spawn(async move {
            if let Some(buf) = mrx.recv().await {
                let hits = buf.trim();
                let mean_score = if hits.is_empty() {
                    0.0
                } else {
                    hits.iter().map(|h| h.score).sum::<f64>() / hits.len() as f64
                };
                monitor.register(QualityRecord {
                    latency: created.elapsed(),
                    mean_score,
                    satisfaction: hits.len() as f64 / k as f64,
                });
                metrics().incr(Counter::QueriesMonitored);
                let _ = caller_tx.try_send(buf);
            }
            debug!(query_id = %query_id, "monitor listener finished");
        });
    }
}
