use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use knn_engine::request::{self, PipelineOptions};
use knn_engine::space::Entry;
use knn_engine::spaces::Namespace;
use knn_engine::types::RequestSpec;
use knn_engine::vector::{Metric, Vector};

fn opts() -> PipelineOptions {
    PipelineOptions {
        scan_workers: 8,
        stage_workers: 4,
        stage_buffer: 64,
        merge_flush_every: 16,
    }
}

fn spec(ascending: bool, k: usize) -> RequestSpec {
    RequestSpec {
        namespace: "pool".to_string(),
        priority: 1,
        query: vec![0.0],
        metric: Metric::Euclidean,
        ascending,
        k,
        extent: 1.0,
        accept: None,
        reject: None,
        ttl_ms: 5_000,
        monitor: false,
    }
}

/// 1000 candidates with scores 0..999 inserted shuffled; the pipeline must
/// be deterministic regardless of arrival order.
async fn shuffled_namespace() -> Arc<Namespace> {
    let ns = Arc::new(Namespace::new(
        "pool",
        128,
        16,
        Duration::from_millis(10),
        8,
    ));
    let mut values: Vec<u64> = (0..1_000).collect();
    fastrand::seed(7);
    fastrand::shuffle(&mut values);
    for (i, v) in values.iter().enumerate() {
        assert!(
            ns.insert(
                i as u64,
                Arc::new(Entry::new(Vector::new(vec![*v as f64]))),
                None
            )
            .await
        );
    }
    ns
}

#[tokio::test]
async fn merge_is_deterministic_ascending() {
    let ns = shuffled_namespace().await;
    let (req, mut res) = request::assemble(spec(true, 2)).unwrap();
    request::execute(req, ns, &opts()).await;

    let buf = timeout(Duration::from_secs(5), res.results.recv())
        .await
        .expect("result in time")
        .expect("one buffer");
    let scores: Vec<f64> = buf.trim().iter().map(|h| h.score).collect();
    assert_eq!(scores, vec![0.0, 1.0]);
}

#[tokio::test]
async fn merge_is_deterministic_descending() {
    let ns = shuffled_namespace().await;
    let (req, mut res) = request::assemble(spec(false, 2)).unwrap();
    request::execute(req, ns, &opts()).await;

    let buf = timeout(Duration::from_secs(5), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let scores: Vec<f64> = buf.trim().iter().map(|h| h.score).collect();
    assert_eq!(scores, vec![999.0, 998.0]);
}

#[tokio::test]
async fn k1_exhaustive_extent_is_argmin() {
    let ns = shuffled_namespace().await;
    let (req, mut res) = request::assemble(spec(true, 1)).unwrap();
    request::execute(req, ns, &opts()).await;

    let buf = timeout(Duration::from_secs(5), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let hits = buf.trim();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].score, 0.0);
}

#[tokio::test]
async fn cancel_before_execute_closes_without_emission() {
    let ns = shuffled_namespace().await;
    let (req, mut res) = request::assemble(spec(true, 2)).unwrap();
    res.cancel.cancel();
    request::execute(req, ns, &opts()).await;
    assert!(
        timeout(Duration::from_secs(1), res.results.recv())
            .await
            .expect("channel must close")
            .is_none()
    );
}

#[tokio::test]
async fn partial_extent_still_returns_sorted_results() {
    let ns = shuffled_namespace().await;
    let mut s = spec(true, 5);
    s.extent = 0.25;
    let (req, mut res) = request::assemble(s).unwrap();
    request::execute(req, ns, &opts()).await;

    let buf = timeout(Duration::from_secs(5), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let hits = buf.trim();
    assert_eq!(hits.len(), 5);
    for pair in hits.windows(2) {
        assert!(pair[0].score <= pair[1].score);
    }
}
