//! Query assembly: turn a request specification into pipeline stages and
//! consume the merge output with accept-based early stop.
//!
//! Stage TTLs are derived as `request ttl − elapsed since creation`, so the
//! deadline a caller set at enqueue time propagates through every stage. The
//! output channel receives the final ranked buffer exactly once and is then
//! closed; a close without emission means the request was dropped before it
//! ran.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::errors::EngineError;
use crate::metrics::{metrics, Counter};
use crate::observability::QueryId;
use crate::pipeline::{KeepFn, MapFn, Pipeline, PipelineArgs, StageArgs, WorkerArgs};
use crate::ranked::RankedBuffer;
use crate::signal::CancelSignal;
use crate::spaces::Namespace;
use crate::types::{EnqueueResult, RequestSpec, ResultSender};
use crate::vector::{Metric, Vector};

/// Pipeline sizing shared by every query, taken from the engine config.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub scan_workers: usize,
    pub stage_workers: usize,
    pub stage_buffer: usize,
    pub merge_flush_every: usize,
}

impl PipelineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            scan_workers: cfg.scan_workers,
            stage_workers: cfg.stage_workers,
            stage_buffer: cfg.stage_buffer,
            merge_flush_every: cfg.merge_flush_every,
        }
    }
}

/// A request after assembly: creation timestamp, distance-ready query
/// vector, output channel, and cancel handle.
#[derive(Debug)]
pub struct AssembledRequest {
    pub spec: RequestSpec,
    pub created: Instant,
    pub query: Arc<Vector>,
    pub out_tx: ResultSender,
    pub cancel: CancelSignal,
    pub query_id: QueryId,
}

/// Validate the spec and produce the request plus the caller-side result.
pub fn assemble(spec: RequestSpec) -> Result<(AssembledRequest, EnqueueResult), EngineError> {
    spec.validate()?;
    let cancel = CancelSignal::new();
    let (out_tx, results) = mpsc::channel(1);
    let query_id = QueryId::new();
    let query = Arc::new(Vector::new(spec.query.clone()));
    let req = AssembledRequest {
        spec,
        created: Instant::now(),
        query,
        out_tx,
        cancel: cancel.clone(),
        query_id: query_id.clone(),
    };
    Ok((req, EnqueueResult {
        results,
        cancel,
        query_id,
    }))
}

/// Distance map for the chosen metric; incomparable candidates are dropped.
pub fn map_fn_for(metric: Metric, query: Arc<Vector>) -> MapFn {
    Arc::new(move |candidate: &Vector| metric.eval(&query, candidate))
}

/// Reject predicate. Strict inequality: ascending keeps `score < reject`,
/// descending keeps `score > reject`.
pub fn keep_fn_for(ascending: bool, reject: Option<f64>) -> KeepFn {
    match reject {
        None => Arc::new(|_| true),
        Some(threshold) => {
            if ascending {
                Arc::new(move |score| score < threshold)
            } else {
                Arc::new(move |score| score > threshold)
            }
        }
    }
}

/// Early-stop check, applied only once the worst of the top K is filled.
/// Ascending stops at `worst <= accept`, descending at `worst >= accept`.
fn accept_satisfied(ascending: bool, accept: Option<f64>, worst: f64) -> bool {
    match accept {
        None => false,
        Some(threshold) => {
            if ascending {
                worst <= threshold
            } else {
                worst >= threshold
            }
        }
    }
}

/// Run one assembled request against a namespace. Consumes the request; on
/// every exit path the output channel ends up closed, with exactly one
/// buffer emitted unless the request never started.
pub async fn execute(req: AssembledRequest, ns: Arc<Namespace>, opts: &PipelineOptions) {
    let AssembledRequest {
        spec,
        created,
        query,
        out_tx,
        cancel,
        query_id,
    } = req;

    let remaining = spec.ttl().saturating_sub(created.elapsed());
    if remaining.is_zero() || cancel.is_cancelled() {
        // Dropped before it ran; close without emission.
        return;
    }

    let base = WorkerArgs {
        buffer: opts.stage_buffer,
        cancel: cancel.clone(),
        ttl: remaining,
        on_exit: None,
    };
    let stage = StageArgs {
        workers: opts.stage_workers,
        base: base.clone(),
    };
    let pargs = PipelineArgs {
        stage,
        map_fn: map_fn_for(spec.metric, Arc::clone(&query)),
        keep_fn: keep_fn_for(spec.ascending, spec.reject),
        k: spec.k,
        ascending: spec.ascending,
        flush_every: opts.merge_flush_every,
    };
    let Some(pipeline) = Pipeline::build(pargs) else {
        cancel.cancel();
        debug!(query_id = %query_id, "pipeline assembly failed");
        return;
    };
    let pipeline = Arc::new(pipeline);

    let scan_args = StageArgs {
        workers: opts.scan_workers,
        base,
    };
    let Some(mut fan) = ns.scan(spec.extent, scan_args) else {
        cancel.cancel();
        debug!(query_id = %query_id, "scan fan-out refused");
        return;
    };

    {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(child) = fan.recv().await {
                if cancel.is_cancelled() || !pipeline.add_scanner(child) {
                    break;
                }
            }
            pipeline.wait_then_close().await;
        });
    }

    let mut final_buf = RankedBuffer::new(spec.k);
    let mut early_stop = false;
    let ascending = spec.ascending;
    let accept = spec.accept;
    pipeline
        .consume(|buf| {
            for hit in buf.trim() {
                if final_buf.is_full()
                    && accept_satisfied(ascending, accept, final_buf.worst().score)
                {
                    early_stop = true;
                    return false;
                }
                final_buf.insert(hit, ascending);
            }
            true
        })
        .await;

    if early_stop {
        cancel.cancel();
        metrics().incr(Counter::QueriesEarlyStop);
    }

    debug!(
        query_id = %query_id,
        results = final_buf.len(),
        early_stop,
        "query finished"
    );
    let _ = out_tx.try_send(final_buf);
}
