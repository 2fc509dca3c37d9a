//! Load generator: seeds namespaces with random vectors and fires a query
//! stream at the engine, reporting latency and quality snapshots.
//!
//! Knobs via environment:
//! - LOAD_NAMESPACES (default 4)
//! - LOAD_ROWS per namespace (default 5000)
//! - LOAD_DIM (default 32)
//! - LOAD_QUERIES (default 200)

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use knn_engine::config::Config;
use knn_engine::handle::Handle;
use knn_engine::metrics::{metrics, Counter, Gauge};
use knn_engine::space::Entry;
use knn_engine::types::RequestSpec;
use knn_engine::vector::{Metric, Vector};

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn random_values(dim: usize) -> Vec<f64> {
    (0..dim).map(|_| fastrand::f64() * 100.0).collect()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let namespaces = env_usize("LOAD_NAMESPACES", 4);
    let rows = env_usize("LOAD_ROWS", 5_000);
    let dim = env_usize("LOAD_DIM", 32);
    let queries = env_usize("LOAD_QUERIES", 200);

    let cfg = Config::load();
    let handle = Handle::new(cfg)?;

    let seed_started = Instant::now();
    for n in 0..namespaces {
        let name = format!("load-{}", n);
        for _ in 0..rows {
            if !handle
                .add_data(&name, Entry::new(Vector::new(random_values(dim))), None)
                .await
            {
                anyhow::bail!("insert refused in {}", name);
            }
        }
    }
    info!(
        namespaces,
        rows,
        dim,
        elapsed_ms = seed_started.elapsed().as_millis() as u64,
        "seeding finished"
    );

    let query_started = Instant::now();
    let mut tasks = Vec::new();
    for q in 0..queries {
        let handle = Arc::clone(&handle);
        let name = format!("load-{}", q % namespaces);
        tasks.push(tokio::spawn(async move {
            let spec = RequestSpec {
                namespace: name,
                priority: 1,
                query: random_values(dim),
                metric: Metric::Euclidean,
                ascending: true,
                k: 10,
                extent: 0.5,
                accept: None,
                reject: None,
                ttl_ms: 500,
                monitor: true,
            };
            match handle.knn(spec).await {
                Ok(mut res) => {
                    let got = res.results.recv().await.map(|b| b.len()).unwrap_or(0);
                    res.cancel.cancel();
                    Some(got)
                }
                Err(e) => {
                    warn!(error = %e, "query refused");
                    None
                }
            }
        }));
    }

    let mut completed = 0usize;
    let mut refused = 0usize;
    let mut results_total = 0usize;
    for task in tasks {
        match task.await {
            Ok(Some(got)) => {
                completed += 1;
                results_total += got;
            }
            Ok(None) => refused += 1,
            Err(e) => warn!(error = %e, "query task panicked"),
        }
    }
    info!(
        completed,
        refused,
        avg_results = results_total as f64 / completed.max(1) as f64,
        elapsed_ms = query_started.elapsed().as_millis() as u64,
        "query load finished"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let snap = handle.monitor_snapshot(Duration::from_secs(300));
    info!(
        samples = snap.samples,
        avg_latency_ms = snap.avg_latency_ms,
        avg_score = snap.avg_score,
        avg_satisfaction = snap.avg_satisfaction,
        "monitor snapshot"
    );
    if let Some(wait) = handle.queue_latency() {
        info!(avg_queue_wait_ms = wait.as_millis() as u64, "queue wait average");
    }
    info!(
        admitted = metrics().counter(Counter::QueriesAdmitted),
        early_stopped = metrics().counter(Counter::QueriesEarlyStop),
        rejected_latency = metrics().counter(Counter::QueriesRejectedLatency),
        scan_peak = metrics().gauge(Gauge::ScanOpenChildrenPeak),
        "engine counters"
    );

    handle.shutdown();
    Ok(())
}
