use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::observability::QueryId;
use crate::ranked::RankedBuffer;
use crate::signal::CancelSignal;
use crate::vector::Metric;

pub type ResultSender = mpsc::Sender<RankedBuffer>;
pub type ResultReceiver = mpsc::Receiver<RankedBuffer>;

/// Caller-supplied query specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub namespace: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub query: Vec<f64>,
    pub metric: Metric,
    /// Lower-is-better when true. Euclidean callers usually leave this on;
    /// cosine callers wanting most-similar-first turn it off.
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    pub k: usize,
    /// Fraction of each partition visited, in (0, 1].
    #[serde(default = "default_extent")]
    pub extent: f64,
    /// Early-stop threshold: once K results are held and the worst of them
    /// reaches this score, the query stops. `None` disables early stop.
    #[serde(default)]
    pub accept: Option<f64>,
    /// Per-item rejection threshold; candidates on the wrong side are
    /// filtered out. `None` keeps everything.
    #[serde(default)]
    pub reject: Option<f64>,
    pub ttl_ms: u64,
    /// Record this query in the quality monitor.
    #[serde(default)]
    pub monitor: bool,
}

fn default_priority() -> u32 {
    1
}
fn default_ascending() -> bool {
    true
}
fn default_extent() -> f64 {
    1.0
}

impl RequestSpec {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.namespace.is_empty() {
            return Err(EngineError::invalid_spec("namespace", "must not be empty"));
        }
        if self.priority == 0 {
            return Err(EngineError::invalid_spec("priority", "must be positive"));
        }
        if self.query.is_empty() {
            return Err(EngineError::invalid_spec("query", "must not be empty"));
        }
        if self.k == 0 {
            return Err(EngineError::invalid_spec("k", "must be positive"));
        }
        if !(self.extent > 0.0 && self.extent <= 1.0) {
            return Err(EngineError::invalid_spec("extent", "must be in (0, 1]"));
        }
        if self.ttl_ms == 0 {
            return Err(EngineError::invalid_spec("ttl_ms", "must be positive"));
        }
        Ok(())
    }
}

/// What the caller gets back from a successful enqueue: a channel yielding
/// exactly one ranked buffer then closing, and the cancel handle to call
/// when done or when the caller's own deadline fires.
#[derive(Debug)]
pub struct EnqueueResult {
    pub results: ResultReceiver,
    pub cancel: CancelSignal,
    pub query_id: QueryId,
}
