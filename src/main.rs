//! Application entry: stands the engine up, seeds demo data, and runs a few
//! queries so operators can smoke-test a build.

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use knn_engine::config::Config;
use knn_engine::handle::Handle;
use knn_engine::space::Entry;
use knn_engine::types::RequestSpec;
use knn_engine::vector::{Metric, Vector};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cfg = Config::load();
    info!("Loaded config: {:?}", cfg);
    let handle = Handle::new(cfg)?;

    let dim = 8;
    let rows = 1_000;
    for _ in 0..rows {
        let values: Vec<f64> = (0..dim).map(|_| fastrand::f64() * 10.0).collect();
        let ok = handle.add_data("demo", Entry::new(Vector::new(values)), None).await;
        if !ok {
            anyhow::bail!("demo namespace refused an insert");
        }
    }
    info!(
        rows,
        dim = handle.namespace_dim("demo").await.unwrap_or(0),
        "demo namespace seeded"
    );

    let query: Vec<f64> = (0..dim).map(|_| fastrand::f64() * 10.0).collect();
    for (metric, ascending) in [(Metric::Euclidean, true), (Metric::Cosine, false)] {
        let spec = RequestSpec {
            namespace: "demo".to_string(),
            priority: 1,
            query: query.clone(),
            metric,
            ascending,
            k: 5,
            extent: 1.0,
            accept: None,
            reject: None,
            ttl_ms: 1_000,
            monitor: true,
        };
        let mut res = handle.knn(spec).await?;
        match res.results.recv().await {
            Some(buf) => {
                for hit in buf.trim() {
                    info!(metric = metric.label(), id = hit.id, score = hit.score, "hit");
                }
            }
            None => info!(metric = metric.label(), "query cancelled or timed out"),
        }
        res.cancel.cancel();
    }

    // Give the monitor listeners a moment to record, then report.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = handle.monitor_snapshot(Duration::from_secs(60));
    info!(
        samples = snap.samples,
        avg_latency_ms = snap.avg_latency_ms,
        avg_satisfaction = snap.avg_satisfaction,
        "monitor snapshot"
    );
    if let Some(wait) = handle.queue_latency() {
        info!(avg_queue_wait_ms = wait.as_millis() as u64, "queue latency");
    }

    handle.shutdown();
    Ok(())
}
