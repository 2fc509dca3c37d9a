//! Staged concurrent search pipeline: scan → map → filter → merge.
//!
//! Each stage runs a pool of workers that share the stage input through a
//! mutex-held receiver. Every transfer races the shared cancel broadcast and
//! the stage deadline, so a cancelled or expired query converges on a
//! consistent exit at the next suspension point. A stage's output closes
//! only after all of its workers have exited, because each worker holds a
//! clone of the output sender.
//!
//! Merge keeps one ranked buffer per worker and flushes a copy downstream
//! every `flush_every` receives, trading a small duplication factor for a
//! lock-free hot path; the consumer reconciles with one more insert pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::chan::{recv_guarded, send_guarded, RecvOutcome};
use crate::ranked::{Hit, RankedBuffer};
use crate::signal::{CancelSignal, WorkerGauge};
use crate::space::StoredEntry;
use crate::vector::Vector;

pub type MapFn = Arc<dyn Fn(&Vector) -> Option<f64> + Send + Sync>;
pub type KeepFn = Arc<dyn Fn(f64) -> bool + Send + Sync>;
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Per-worker contract shared by every stage and scanner.
#[derive(Clone)]
pub struct WorkerArgs {
    /// Output channel capacity.
    pub buffer: usize,
    pub cancel: CancelSignal,
    /// Hard cap on the worker's lifetime.
    pub ttl: Duration,
    /// Invoked from each worker as it exits, on every exit path.
    pub on_exit: Option<ExitHook>,
}

impl WorkerArgs {
    pub fn ok(&self) -> bool {
        self.ttl > Duration::ZERO
    }
}

impl std::fmt::Debug for WorkerArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerArgs")
            .field("buffer", &self.buffer)
            .field("ttl", &self.ttl)
            .field("has_exit_hook", &self.on_exit.is_some())
            .finish()
    }
}

/// Stage contract: worker args plus a pool size.
#[derive(Debug, Clone)]
pub struct StageArgs {
    pub workers: usize,
    pub base: WorkerArgs,
}

impl StageArgs {
    pub fn ok(&self) -> bool {
        self.workers >= 1 && self.base.ok()
    }
}

fn fire_exit(hook: &Option<ExitHook>) {
    if let Some(h) = hook {
        (**h)();
    }
}

/// Spawn a pool of workers applying `work` to each input item; `None`
/// results are per-item drops. Within one worker, output order follows
/// input order.
fn spawn_stage_workers<I, O, F>(
    rx: mpsc::Receiver<I>,
    args: &StageArgs,
    tx: mpsc::Sender<O>,
    work: F,
) where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Option<O> + Clone + Send + Sync + 'static,
{
    let shared = Arc::new(Mutex::new(rx));
    for _ in 0..args.workers {
        let shared = Arc::clone(&shared);
        let tx = tx.clone();
        let wargs = args.base.clone();
        let work = work.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + wargs.ttl;
            loop {
                let item = {
                    let mut rx = shared.lock().await;
                    match recv_guarded(&mut rx, &wargs.cancel, deadline).await {
                        RecvOutcome::Item(i) => i,
                        _ => break,
                    }
                };
                if let Some(out) = work(item) {
                    if !send_guarded(&tx, out, &wargs.cancel, deadline).await.is_sent() {
                        break;
                    }
                }
            }
            fire_exit(&wargs.on_exit);
        });
    }
}

/// Map stage: score each live entry, attach the vector reference, drop
/// incomparable or retired candidates.
pub fn stage_map(
    rx: mpsc::Receiver<StoredEntry>,
    args: StageArgs,
    map_fn: MapFn,
) -> Option<mpsc::Receiver<Hit>> {
    if !args.ok() {
        return None;
    }
    let (tx, out) = mpsc::channel(args.base.buffer.max(1));
    spawn_stage_workers(rx, &args, tx, move |item: StoredEntry| {
        let vector = item.entry.current()?;
        let score = (*map_fn)(&vector)?;
        Some(Hit {
            id: item.id,
            score,
            filled: true,
            vector: Some(vector),
        })
    });
    Some(out)
}

/// Filter stage: keep hits whose score passes the predicate.
pub fn stage_filter(
    rx: mpsc::Receiver<Hit>,
    args: StageArgs,
    keep_fn: KeepFn,
) -> Option<mpsc::Receiver<Hit>> {
    if !args.ok() {
        return None;
    }
    let (tx, out) = mpsc::channel(args.base.buffer.max(1));
    spawn_stage_workers(rx, &args, tx, move |hit: Hit| {
        if (*keep_fn)(hit.score) {
            Some(hit)
        } else {
            None
        }
    });
    Some(out)
}

/// Merge stage: per-worker top-K buffers, flushed periodically and on input
/// close. Output is a stream of ranked buffers for the consumer to fold.
pub fn stage_merge(
    rx: mpsc::Receiver<Hit>,
    args: StageArgs,
    k: usize,
    ascending: bool,
    flush_every: usize,
) -> Option<mpsc::Receiver<RankedBuffer>> {
    if !args.ok() || k == 0 || flush_every == 0 {
        return None;
    }
    let (tx, out) = mpsc::channel(args.base.buffer.max(1));
    let shared = Arc::new(Mutex::new(rx));
    for _ in 0..args.workers {
        let shared = Arc::clone(&shared);
        let tx = tx.clone();
        let wargs = args.base.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + wargs.ttl;
            let mut local = RankedBuffer::new(k);
            let mut received = 0usize;
            loop {
                let outcome = {
                    let mut rx = shared.lock().await;
                    recv_guarded(&mut rx, &wargs.cancel, deadline).await
                };
                match outcome {
                    RecvOutcome::Item(hit) => {
                        local.insert(hit, ascending);
                        received += 1;
                        if received % flush_every == 0 {
                            let full = std::mem::replace(&mut local, RankedBuffer::new(k));
                            if !send_guarded(&tx, full, &wargs.cancel, deadline)
                                .await
                                .is_sent()
                            {
                                break;
                            }
                        }
                    }
                    RecvOutcome::Closed => {
                        let _ = send_guarded(&tx, local, &wargs.cancel, deadline).await;
                        break;
                    }
                    _ => break,
                }
            }
            fire_exit(&wargs.on_exit);
        });
    }
    Some(out)
}

/// Everything needed to assemble the three stages for one query.
#[derive(Clone)]
pub struct PipelineArgs {
    pub stage: StageArgs,
    pub map_fn: MapFn,
    pub keep_fn: KeepFn,
    pub k: usize,
    pub ascending: bool,
    pub flush_every: usize,
}

/// Orchestrator around the staged pipeline. Scanner channels are attached
/// with `add_scanner`; their forwarders drain into the faucet feeding the
/// map stage. `wait_then_close` seals the faucet once the forwarders are
/// done, which lets closure propagate stage by stage to the merge output.
pub struct Pipeline {
    faucet: SyncMutex<Option<mpsc::Sender<StoredEntry>>>,
    output: Mutex<mpsc::Receiver<RankedBuffer>>,
    forwarders: Arc<WorkerGauge>,
    closed: AtomicBool,
    cancel: CancelSignal,
    deadline: Instant,
}

impl Pipeline {
    /// Build the three stages. `None` means a stage refused its arguments;
    /// the caller must cancel the shared signal to reap any stage already
    /// spawned.
    pub fn build(args: PipelineArgs) -> Option<Pipeline> {
        if !args.stage.ok() || args.k == 0 || args.flush_every == 0 {
            return None;
        }
        let (faucet_tx, faucet_rx) = mpsc::channel(args.stage.base.buffer.max(1));
        let mapped = stage_map(faucet_rx, args.stage.clone(), Arc::clone(&args.map_fn))?;
        let filtered = stage_filter(mapped, args.stage.clone(), Arc::clone(&args.keep_fn))?;
        let merged = stage_merge(
            filtered,
            args.stage.clone(),
            args.k,
            args.ascending,
            args.flush_every,
        )?;
        Some(Pipeline {
            faucet: SyncMutex::new(Some(faucet_tx)),
            output: Mutex::new(merged),
            forwarders: Arc::new(WorkerGauge::new()),
            closed: AtomicBool::new(false),
            cancel: args.stage.base.cancel.clone(),
            deadline: Instant::now() + args.stage.base.ttl,
        })
    }

    /// Attach one scanner stream. A forwarder drains it into the faucet,
    /// racing cancel and the pipeline deadline. Returns false once the
    /// faucet has been sealed.
    pub fn add_scanner(&self, mut rx: mpsc::Receiver<StoredEntry>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let tx = match &*self.faucet.lock() {
            Some(tx) => tx.clone(),
            None => return false,
        };
        self.forwarders.add();
        let gauge = Arc::clone(&self.forwarders);
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        tokio::spawn(async move {
            let _exit = scopeguard::guard(gauge, |g| g.done());
            loop {
                match recv_guarded(&mut rx, &cancel, deadline).await {
                    RecvOutcome::Item(item) => {
                        if !send_guarded(&tx, item, &cancel, deadline).await.is_sent() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        true
    }

    /// Latch the closed flag, wait for every forwarder to exit, then seal
    /// the faucet. Only the first call does the work; repeats return false.
    pub async fn wait_then_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.forwarders.wait_idle().await;
        *self.faucet.lock() = None;
        debug!("pipeline faucet sealed");
        true
    }

    /// Drain the merge output, handing each ranked buffer to `rcv`. Exits
    /// when the output closes, the cancel fires, or `rcv` returns false.
    pub async fn consume<F: FnMut(RankedBuffer) -> bool>(&self, mut rcv: F) {
        let mut out = self.output.lock().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = out.recv() => match item {
                    Some(buf) => {
                        if !rcv(buf) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    pub fn live_forwarders(&self) -> usize {
        self.forwarders.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Entry;

    fn worker_args(cancel: &CancelSignal) -> WorkerArgs {
        WorkerArgs {
            buffer: 16,
            cancel: cancel.clone(),
            ttl: Duration::from_secs(2),
            on_exit: None,
        }
    }

    fn stage_args(cancel: &CancelSignal, workers: usize) -> StageArgs {
        StageArgs {
            workers,
            base: worker_args(cancel),
        }
    }

    fn stored(id: u64, values: Vec<f64>) -> StoredEntry {
        StoredEntry {
            id,
            entry: Arc::new(Entry::new(Vector::new(values))),
        }
    }

    fn first_coord() -> MapFn {
        Arc::new(|v: &Vector| v.peek(0))
    }

    fn keep_all() -> KeepFn {
        Arc::new(|_| true)
    }

    #[tokio::test]
    async fn map_scores_and_drops_retired() {
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(8);
        let mut out = stage_map(rx, stage_args(&cancel, 1), first_coord()).unwrap();

        let retired = stored(1, vec![9.0]);
        retired.entry.clear();
        tx.send(stored(0, vec![5.0])).await.unwrap();
        tx.send(retired).await.unwrap();
        tx.send(stored(2, vec![7.0])).await.unwrap();
        drop(tx);

        let a = out.recv().await.unwrap();
        let b = out.recv().await.unwrap();
        assert!(out.recv().await.is_none());
        assert_eq!((a.id, a.score), (0, 5.0));
        assert_eq!((b.id, b.score), (2, 7.0));
        assert!(a.filled && a.vector.is_some());
    }

    #[tokio::test]
    async fn map_drops_incomparable_candidates() {
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(8);
        // Mapper that only accepts dimension 2.
        let map_fn: MapFn = Arc::new(|v: &Vector| {
            if v.dim() == 2 {
                Some(v.norm())
            } else {
                None
            }
        });
        let mut out = stage_map(rx, stage_args(&cancel, 2), map_fn).unwrap();
        tx.send(stored(0, vec![3.0, 4.0])).await.unwrap();
        tx.send(stored(1, vec![1.0])).await.unwrap();
        drop(tx);

        let only = out.recv().await.unwrap();
        assert!(out.recv().await.is_none());
        assert_eq!(only.id, 0);
        assert!((only.score - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn filter_applies_predicate_in_order() {
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(8);
        let keep: KeepFn = Arc::new(|s| s < 2.0);
        let mut out = stage_filter(rx, stage_args(&cancel, 1), keep).unwrap();
        for (id, s) in [(0u64, 5.0), (1, 1.0), (2, 0.5), (3, 3.0)] {
            tx.send(Hit::new(id, s)).await.unwrap();
        }
        drop(tx);
        let a = out.recv().await.unwrap();
        let b = out.recv().await.unwrap();
        assert!(out.recv().await.is_none());
        assert_eq!((a.id, b.id), (1, 2), "single worker preserves input order");
    }

    #[tokio::test]
    async fn merge_flushes_periodically_and_on_close() {
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(16);
        let mut out = stage_merge(rx, stage_args(&cancel, 1), 2, true, 3).unwrap();
        for (id, s) in [(0u64, 5.0), (1, 1.0), (2, 3.0), (3, 0.5)] {
            tx.send(Hit::new(id, s)).await.unwrap();
        }
        drop(tx);

        // First flush after three receives, second (final) on close.
        let first = out.recv().await.unwrap();
        assert_eq!(first.to_ids(), vec![1, 2]);
        let second = out.recv().await.unwrap();
        assert_eq!(second.to_ids(), vec![3]);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn merge_buffers_fold_to_global_top_k() {
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(64);
        let mut out = stage_merge(rx, stage_args(&cancel, 3), 2, true, 4).unwrap();
        for i in 0..30u64 {
            tx.send(Hit::new(i, ((i * 13) % 30) as f64)).await.unwrap();
        }
        drop(tx);

        let mut final_buf = RankedBuffer::new(2);
        while let Some(buf) = out.recv().await {
            for hit in buf.trim() {
                final_buf.insert(hit, true);
            }
        }
        let scores: Vec<f64> = final_buf.trim().iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn stage_construction_rejects_bad_args() {
        let cancel = CancelSignal::new();
        let (_tx, rx) = mpsc::channel::<StoredEntry>(1);
        assert!(stage_map(rx, stage_args(&cancel, 0), first_coord()).is_none());

        let (_tx, rx) = mpsc::channel::<Hit>(1);
        let mut args = stage_args(&cancel, 1);
        args.base.ttl = Duration::ZERO;
        assert!(stage_filter(rx, args, keep_all()).is_none());

        let (_tx, rx) = mpsc::channel::<Hit>(1);
        assert!(stage_merge(rx, stage_args(&cancel, 1), 0, true, 4).is_none());
        let (_tx, rx) = mpsc::channel::<Hit>(1);
        assert!(stage_merge(rx, stage_args(&cancel, 1), 2, true, 0).is_none());
    }

    fn pipeline_args(cancel: &CancelSignal) -> PipelineArgs {
        PipelineArgs {
            stage: stage_args(cancel, 2),
            map_fn: first_coord(),
            keep_fn: keep_all(),
            k: 2,
            ascending: true,
            flush_every: 4,
        }
    }

    #[tokio::test]
    async fn pipeline_end_to_end_with_scanners() {
        let cancel = CancelSignal::new();
        let pipeline = Arc::new(Pipeline::build(pipeline_args(&cancel)).unwrap());

        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        assert!(pipeline.add_scanner(rx_a));
        assert!(pipeline.add_scanner(rx_b));

        for i in 0..5u64 {
            tx_a.send(stored(i, vec![i as f64])).await.unwrap();
            tx_b.send(stored(10 + i, vec![(10 + i) as f64])).await.unwrap();
        }
        drop(tx_a);
        drop(tx_b);

        let closer = Arc::clone(&pipeline);
        tokio::spawn(async move {
            closer.wait_then_close().await;
        });

        let mut final_buf = RankedBuffer::new(2);
        pipeline
            .consume(|buf| {
                for hit in buf.trim() {
                    final_buf.insert(hit, true);
                }
                true
            })
            .await;
        assert_eq!(final_buf.to_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn wait_then_close_is_idempotent() {
        let cancel = CancelSignal::new();
        let pipeline = Pipeline::build(pipeline_args(&cancel)).unwrap();
        assert!(pipeline.wait_then_close().await);
        assert!(!pipeline.wait_then_close().await, "repeat must be a no-op");
        assert!(
            !pipeline.add_scanner(mpsc::channel(1).1),
            "sealed pipeline refuses scanners"
        );
    }

    #[tokio::test]
    async fn consume_stops_when_receiver_declines() {
        let cancel = CancelSignal::new();
        let mut args = pipeline_args(&cancel);
        args.flush_every = 1;
        let pipeline = Arc::new(Pipeline::build(args).unwrap());

        let (tx, rx) = mpsc::channel(8);
        assert!(pipeline.add_scanner(rx));
        for i in 0..8u64 {
            tx.send(stored(i, vec![i as f64])).await.unwrap();
        }
        drop(tx);
        let closer = Arc::clone(&pipeline);
        tokio::spawn(async move {
            closer.wait_then_close().await;
        });

        let mut seen = 0;
        pipeline
            .consume(|_| {
                seen += 1;
                false
            })
            .await;
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn cancel_unblocks_consume() {
        let cancel = CancelSignal::new();
        let pipeline = Pipeline::build(pipeline_args(&cancel)).unwrap();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        // No scanners and no close: only the cancel can end this.
        tokio::time::timeout(Duration::from_millis(500), pipeline.consume(|_| true))
            .await
            .expect("cancel must unblock the consumer");
    }
}
