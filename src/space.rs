//! Single search-space partition: a bounded, uniform-dimension collection of
//! vector entries.
//!
//! Entries self-report retirement: `Entry::current` returns `None` once the
//! expiry passed or the vector was cleared. Scanners skip stale entries and
//! a low-priority maintenance pass compacts them later, so expiry never takes
//! the writer lock.
//!
//! `scan` holds a read guard for the whole stream lifetime. Multiple scans
//! overlap freely; `insert`/`clean`/`clear` wait until the scans end.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::chan::send_guarded;
use crate::metrics::{metrics, Counter};
use crate::pipeline::WorkerArgs;
use crate::vector::Vector;

/// A stored vector with an optional expiry.
///
/// The only observable state is the `current` capability: it yields the
/// vector while the entry is live and `None` once it retired.
#[derive(Debug)]
pub struct Entry {
    vector: SyncRwLock<Option<Arc<Vector>>>,
    expires_at: Option<std::time::Instant>,
}

impl Entry {
    pub fn new(vector: Vector) -> Self {
        Self {
            vector: SyncRwLock::new(Some(Arc::new(vector))),
            expires_at: None,
        }
    }

    pub fn with_ttl(vector: Vector, ttl: Duration) -> Self {
        Self {
            vector: SyncRwLock::new(Some(Arc::new(vector))),
            expires_at: Some(std::time::Instant::now() + ttl),
        }
    }

    /// Current vector, or `None` once retired (expired or cleared).
    pub fn current(&self) -> Option<Arc<Vector>> {
        if let Some(expiry) = self.expires_at {
            if std::time::Instant::now() >= expiry {
                return None;
            }
        }
        self.vector.read().clone()
    }

    /// Retire the entry immediately.
    pub fn clear(&self) {
        *self.vector.write() = None;
    }
}

/// An entry as held by a partition, tagged with its external id.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: u64,
    pub entry: Arc<Entry>,
}

#[derive(Debug)]
struct PartitionState {
    entries: Vec<StoredEntry>,
    /// Established dimension; 0 means unset.
    dim: usize,
}

/// One partition of a namespace. Capacity is fixed at creation; the
/// dimension is adopted from the first insert and may only change once the
/// partition has emptied.
#[derive(Debug)]
pub struct Partition {
    state: Arc<RwLock<PartitionState>>,
    capacity: usize,
}

impl Partition {
    pub fn new(capacity: usize) -> Self {
        // A zero-capacity partition could never accept an entry.
        Self {
            state: Arc::new(RwLock::new(PartitionState {
                entries: Vec::new(),
                dim: 0,
            })),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn dim(&self) -> usize {
        self.state.read().await.dim
    }

    /// Insert an entry. Returns false when the entry is retired, the
    /// partition is full, or the dimension differs from the established one.
    pub async fn insert(&self, id: u64, entry: Arc<Entry>) -> bool {
        let Some(vector) = entry.current() else {
            return false;
        };
        if vector.dim() == 0 {
            return false;
        }
        let mut st = self.state.write().await;
        if st.entries.len() >= self.capacity {
            return false;
        }
        if st.entries.is_empty() {
            st.dim = vector.dim();
        } else if st.dim != vector.dim() {
            return false;
        }
        st.entries.push(StoredEntry { id, entry });
        metrics().incr(Counter::PartitionInserts);
        true
    }

    /// Remove retired entries, preserving the relative order of the rest.
    /// Returns the number removed.
    pub async fn clean(&self) -> usize {
        let mut st = self.state.write().await;
        let before = st.entries.len();
        st.entries.retain(|e| e.entry.current().is_some());
        let removed = before - st.entries.len();
        if st.entries.is_empty() {
            st.dim = 0;
        }
        if removed > 0 {
            metrics().add_to(Counter::PartitionCleaned, removed as u64);
        }
        removed
    }

    /// Atomically empty the partition, returning the old contents.
    pub async fn clear(&self) -> Vec<StoredEntry> {
        let mut st = self.state.write().await;
        st.dim = 0;
        std::mem::take(&mut st.entries)
    }

    /// Stream approximately `ceil(n * extent)` live entries, spread
    /// uniformly over the partition by a fixed stride. The scanner holds a
    /// read guard until its stream ends; every emission races the shared
    /// cancel and the scan deadline, and a deadline miss closes the stream
    /// early.
    ///
    /// Returns `None` when `extent` is out of (0, 1].
    pub fn scan(&self, extent: f64, args: WorkerArgs) -> Option<mpsc::Receiver<StoredEntry>> {
        if !(extent > 0.0 && extent <= 1.0) {
            return None;
        }
        let (tx, rx) = mpsc::channel(args.buffer.max(1));
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let _exit = args.on_exit.clone().map(|h| scopeguard::guard(h, |h| (*h)()));
            let guard = state.read_owned().await;
            let n = guard.entries.len();
            if n == 0 {
                return;
            }
            let target = ((n as f64) * extent).ceil() as usize;
            let step = n / target;
            let remainder = n % target;
            let deadline = Instant::now() + args.ttl;
            let mut cursor = 0usize;
            for i in 0..target {
                if args.cancel.is_cancelled() || cursor >= n {
                    break;
                }
                let item = &guard.entries[cursor];
                if item.entry.current().is_some() {
                    if !send_guarded(&tx, item.clone(), &args.cancel, deadline)
                        .await
                        .is_sent()
                    {
                        debug!(emitted = i, total = target, "partition scan exited early");
                        break;
                    }
                    metrics().incr(Counter::ScanEmitted);
                }
                cursor += step + usize::from(i < remainder);
            }
        });
        Some(rx)
    }
}
