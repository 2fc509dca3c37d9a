//! Namespace: an ordered collection of partitions sharing one dimension.
//!
//! Insertion tries existing partitions in order and grows the partition list
//! lazily up to a cap. A single-flighted maintenance task walks partitions
//! round-robin, compacting retired entries and removing partitions that
//! emptied. Scan fan-out streams one channel per partition while capping how
//! many partition scans are open at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chan::send_guarded;
use crate::metrics::{metrics, Counter, Gauge};
use crate::pipeline::{ExitHook, StageArgs, WorkerArgs};
use crate::signal::{CancelSignal, WorkerGauge};
use crate::space::{Entry, Partition, StoredEntry};
use crate::tracker::LatencyTracker;

pub struct Namespace {
    name: String,
    partitions: Arc<RwLock<Vec<Arc<Partition>>>>,
    /// Namespace-wide dimension; 0 means unset.
    dim: AtomicUsize,
    max_partitions: usize,
    partition_capacity: usize,
    /// Round-robin maintenance position.
    cursor: AtomicUsize,
    maintenance_active: AtomicBool,
    /// Sliding window of query execution latency for this namespace.
    pub query_latency: LatencyTracker,
    /// Opaque payloads accepted alongside entries. Held by reference, never
    /// exposed through reads.
    payloads: SyncMutex<HashMap<u64, serde_json::Value>>,
}

impl Namespace {
    pub fn new(
        name: &str,
        partition_capacity: usize,
        max_partitions: usize,
        tracker_min_step: Duration,
        tracker_max_buckets: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            partitions: Arc::new(RwLock::new(Vec::new())),
            dim: AtomicUsize::new(0),
            max_partitions: max_partitions.max(1),
            partition_capacity: partition_capacity.max(1),
            cursor: AtomicUsize::new(0),
            maintenance_active: AtomicBool::new(false),
            query_latency: LatencyTracker::new(tracker_min_step, tracker_max_buckets),
            payloads: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        let parts = self.partitions.read().await;
        let mut total = 0;
        for p in parts.iter() {
            total += p.len().await;
        }
        total
    }

    /// Total capacity of the partitions currently allocated.
    pub async fn capacity(&self) -> usize {
        let parts = self.partitions.read().await;
        parts.iter().map(|p| p.capacity()).sum()
    }

    pub async fn partition_count(&self) -> usize {
        self.partitions.read().await.len()
    }

    /// Admit an entry: first partition that accepts wins; on all-full a new
    /// partition is created iff the partition cap allows. The first insert
    /// into an empty namespace fixes the namespace dimension.
    pub async fn insert(
        &self,
        id: u64,
        entry: Arc<Entry>,
        payload: Option<serde_json::Value>,
    ) -> bool {
        let Some(vector) = entry.current() else {
            return false;
        };
        if vector.dim() == 0 {
            return false;
        }
        let mut parts = self.partitions.write().await;
        let ns_dim = self.dim.load(Ordering::SeqCst);
        if ns_dim != 0 && ns_dim != vector.dim() {
            return false;
        }

        let mut accepted = false;
        for p in parts.iter() {
            if p.insert(id, Arc::clone(&entry)).await {
                accepted = true;
                break;
            }
        }
        if !accepted {
            if parts.len() >= self.max_partitions {
                return false;
            }
            let p = Arc::new(Partition::new(self.partition_capacity));
            if !p.insert(id, Arc::clone(&entry)).await {
                return false;
            }
            parts.push(p);
            debug!(namespace = %self.name, partitions = parts.len(), "partition created");
        }

        self.dim.store(vector.dim(), Ordering::SeqCst);
        if let Some(pl) = payload {
            self.payloads.lock().insert(id, pl);
        }
        true
    }

    /// Start the background maintenance loop. Single-flighted: returns false
    /// when one is already running. The loop ends when `stop` fires.
    pub fn spawn_maintenance(self: Arc<Self>, interval: Duration, stop: CancelSignal) -> bool {
        if self.maintenance_active.swap(true, Ordering::SeqCst) {
            return false;
        }
        let ns = self;
        tokio::spawn(async move {
            info!(namespace = %ns.name, ?interval, "maintenance loop started");
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so work starts one
            // interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                ns.maintain_one().await;
            }
            ns.maintenance_active.store(false, Ordering::SeqCst);
            info!(namespace = %ns.name, "maintenance loop stopped");
        });
        true
    }

    /// One maintenance step: clean the partition under the cursor and drop
    /// it if it emptied. The cursor stays put on removal since the list
    /// shrinks underneath it.
    pub async fn maintain_one(&self) {
        let mut parts = self.partitions.write().await;
        if parts.is_empty() {
            self.dim.store(0, Ordering::SeqCst);
            return;
        }
        let i = self.cursor.load(Ordering::SeqCst) % parts.len();
        let removed = parts[i].clean().await;
        if removed > 0 {
            debug!(namespace = %self.name, partition = i, removed, "maintenance cleaned");
        }
        if parts[i].len().await == 0 {
            parts.remove(i);
            metrics().incr(Counter::PartitionsRemoved);
        } else {
            self.cursor.store(i + 1, Ordering::SeqCst);
        }
        if parts.is_empty() {
            self.dim.store(0, Ordering::SeqCst);
        }
    }

    /// Stream one scan channel per partition, never holding more than
    /// `args.workers` partition scans open at once. Fails at entry on a bad
    /// extent or worker count; a child scan that fails to start is skipped.
    pub fn scan(
        &self,
        extent: f64,
        args: StageArgs,
    ) -> Option<mpsc::Receiver<mpsc::Receiver<StoredEntry>>> {
        if !(extent > 0.0 && extent <= 1.0) || !args.ok() {
            return None;
        }
        let (tx, rx) = mpsc::channel(args.base.buffer.max(1));
        let partitions = Arc::clone(&self.partitions);
        let name = self.name.clone();
        tokio::spawn(async move {
            let _exit = args
                .base
                .on_exit
                .clone()
                .map(|h| scopeguard::guard(h, |h| (*h)()));
            let gauge = Arc::new(WorkerGauge::new());
            let parts = partitions.read_owned().await;
            let deadline = Instant::now() + args.base.ttl;
            for p in parts.iter() {
                if args.base.cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = gauge.wait_below(args.workers) => {}
                    _ = args.base.cancel.cancelled() => break,
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                gauge.add();
                let g = Arc::clone(&gauge);
                let hook: ExitHook = Arc::new(move || g.done());
                let child_args = WorkerArgs {
                    buffer: args.base.buffer,
                    cancel: args.base.cancel.clone(),
                    ttl: remaining,
                    on_exit: Some(hook),
                };
                match p.scan(extent, child_args) {
                    Some(child) => {
                        metrics().raise_gauge(Gauge::ScanOpenChildrenPeak, gauge.current() as u64);
                        if !send_guarded(&tx, child, &args.base.cancel, deadline)
                            .await
                            .is_sent()
                        {
                            break;
                        }
                    }
                    None => {
                        // Child never started; release its slot and move on.
                        gauge.done();
                    }
                }
            }
            debug!(namespace = %name, "scan fan-out finished");
        });
        Some(rx)
    }

    /// Empty every partition and drop them all. Returns the number of
    /// entries discarded.
    pub async fn clear(&self) -> usize {
        let mut parts = self.partitions.write().await;
        let mut total = 0;
        for p in parts.iter() {
            total += p.clear().await.len();
        }
        parts.clear();
        self.dim.store(0, Ordering::SeqCst);
        self.payloads.lock().clear();
        total
    }

    #[cfg(test)]
    pub(crate) fn stored_payloads(&self) -> usize {
        self.payloads.lock().len()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("dim", &self.dim())
            .field("max_partitions", &self.max_partitions)
            .finish()
    }
}
