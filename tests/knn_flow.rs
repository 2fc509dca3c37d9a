use std::time::{Duration, Instant};

use tokio::time::timeout;

use knn_engine::config::Config;
use knn_engine::handle::Handle;
use knn_engine::space::Entry;
use knn_engine::types::RequestSpec;
use knn_engine::vector::{Metric, Vector};

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.maintenance_interval_ms = 100;
    cfg.tracker_min_step_ms = 10;
    cfg
}

fn spec(namespace: &str, query: Vec<f64>, metric: Metric, ascending: bool, k: usize) -> RequestSpec {
    RequestSpec {
        namespace: namespace.to_string(),
        priority: 1,
        query,
        metric,
        ascending,
        k,
        extent: 1.0,
        accept: None,
        reject: None,
        ttl_ms: 1_000,
        monitor: false,
    }
}

async fn seed(handle: &Handle, namespace: &str, rows: &[Vec<f64>]) {
    for row in rows {
        assert!(
            handle
                .add_data(namespace, Entry::new(Vector::new(row.clone())), None)
                .await
        );
    }
}

#[tokio::test]
async fn euclidean_k1_finds_the_closest() {
    let handle = Handle::new(test_config()).unwrap();
    seed(&handle, "pool", &[vec![1.0, 5.0, 4.0], vec![0.0, 3.0, 5.0]]).await;

    let mut res = handle
        .knn(spec("pool", vec![0.0, 1.0, 2.0], Metric::Euclidean, true, 1))
        .await
        .unwrap();
    let buf = timeout(Duration::from_secs(2), res.results.recv())
        .await
        .expect("within ttl")
        .expect("one buffer");
    let hits = buf.trim();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);
    assert!((hits[0].score - 3.6056).abs() < 1e-3);
    assert!(hits[0].filled);
    res.cancel.cancel();
}

#[tokio::test]
async fn cosine_k1_ascending_prefers_lower_similarity() {
    let handle = Handle::new(test_config()).unwrap();
    seed(&handle, "pool", &[vec![1.0, 5.0, 4.0], vec![0.0, 3.0, 5.0]]).await;

    // Ascending means "lower similarity first" for cosine.
    let mut res = handle
        .knn(spec("pool", vec![0.0, 1.0, 2.0], Metric::Cosine, true, 1))
        .await
        .unwrap();
    let buf = timeout(Duration::from_secs(2), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let hits = buf.trim();
    assert_eq!(hits[0].id, 0);
    assert!((hits[0].score - 0.8971).abs() < 1e-3);
    res.cancel.cancel();
}

#[tokio::test]
async fn cosine_parallel_vectors_rank_first_descending() {
    let handle = Handle::new(test_config()).unwrap();
    seed(&handle, "pool", &[vec![1.0, 1.0, 1.0], vec![1.0, 5.0, 4.0]]).await;

    let mut res = handle
        .knn(spec("pool", vec![2.0, 2.0, 2.0], Metric::Cosine, false, 1))
        .await
        .unwrap();
    let buf = timeout(Duration::from_secs(2), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let hits = buf.trim();
    assert_eq!(hits[0].id, 0);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    res.cancel.cancel();
}

#[tokio::test]
async fn reject_keeps_only_candidates_below_threshold() {
    let handle = Handle::new(test_config()).unwrap();
    // Distances to the origin along one axis: 5, 3, 1, 9.
    seed(
        &handle,
        "pool",
        &[vec![5.0, 0.0], vec![3.0, 0.0], vec![1.0, 0.0], vec![9.0, 0.0]],
    )
    .await;

    let mut s = spec("pool", vec![0.0, 0.0], Metric::Euclidean, true, 4);
    s.reject = Some(2.0);
    let mut res = handle.knn(s).await.unwrap();
    let buf = timeout(Duration::from_secs(2), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    let hits = buf.trim();
    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 1.0).abs() < 1e-9);
    res.cancel.cancel();
}

#[tokio::test]
async fn monitored_query_feeds_the_quality_window() {
    let handle = Handle::new(test_config()).unwrap();
    seed(&handle, "pool", &[vec![1.0, 0.0], vec![2.0, 0.0]]).await;

    let mut s = spec("pool", vec![0.0, 0.0], Metric::Euclidean, true, 2);
    s.monitor = true;
    let mut res = handle.knn(s).await.unwrap();
    let buf = timeout(Duration::from_secs(2), res.results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf.len(), 2);
    res.cancel.cancel();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = handle.monitor_snapshot(Duration::from_secs(60));
    assert_eq!(snap.samples, 1);
    assert!((snap.avg_satisfaction - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn short_ttl_closes_within_a_jitter_bound() {
    let mut cfg = test_config();
    cfg.partition_capacity = 4_096;
    cfg.max_partitions = 32;
    let handle = Handle::new(cfg).unwrap();

    // A pool large enough that the full scan cannot finish inside the ttl.
    for i in 0..60_000u64 {
        let v = vec![
            (i % 97) as f64,
            (i % 89) as f64,
            (i % 83) as f64,
            (i % 79) as f64,
        ];
        assert!(handle.add_data("big", Entry::new(Vector::new(v)), None).await);
    }

    let mut s = spec("big", vec![0.0, 0.0, 0.0, 0.0], Metric::Euclidean, true, 8);
    s.ttl_ms = 50;
    let started = Instant::now();
    let mut res = handle.knn(s).await.unwrap();

    // Drain to the close, whenever it comes.
    let mut last = None;
    loop {
        match timeout(Duration::from_secs(3), res.results.recv()).await {
            Ok(Some(buf)) => last = Some(buf),
            Ok(None) => break,
            Err(_) => panic!("result channel did not close"),
        }
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(1_000),
        "channel must close near the ttl, took {:?}",
        elapsed
    );

    // Whatever came back satisfies the ranked-buffer invariant.
    if let Some(buf) = last {
        let hits = buf.trim();
        for pair in hits.windows(2) {
            assert!(pair[0].score <= pair[1].score);
        }
    }
    res.cancel.cancel();
}

#[tokio::test]
async fn query_handles_are_independent() {
    let handle = Handle::new(test_config()).unwrap();
    seed(&handle, "a", &[vec![1.0], vec![2.0]]).await;
    seed(&handle, "b", &[vec![1.0, 1.0]]).await;

    assert_eq!(handle.namespaces().await, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(handle.namespace_dim("a").await, Some(1));
    assert_eq!(handle.namespace_dim("b").await, Some(2));

    let mut ra = handle.knn(spec("a", vec![0.0], Metric::Euclidean, true, 1)).await.unwrap();
    let mut rb = handle
        .knn(spec("b", vec![0.0, 0.0], Metric::Euclidean, true, 1))
        .await
        .unwrap();
    let ba = timeout(Duration::from_secs(2), ra.results.recv()).await.unwrap().unwrap();
    let bb = timeout(Duration::from_secs(2), rb.results.recv()).await.unwrap().unwrap();
    assert_eq!(ba.trim()[0].id, 0);
    assert_eq!(bb.trim().len(), 1);
    ra.cancel.cancel();
    rb.cancel.cancel();
}
