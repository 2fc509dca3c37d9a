use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use knn_engine::pipeline::{StageArgs, WorkerArgs};
use knn_engine::signal::CancelSignal;
use knn_engine::space::{Entry, StoredEntry};
use knn_engine::spaces::Namespace;
use knn_engine::vector::Vector;

/// 100 partitions of 3 entries each. Partition capacity 3 forces a new
/// partition every third insert.
async fn wide_namespace() -> Arc<Namespace> {
    let ns = Arc::new(Namespace::new(
        "wide",
        3,
        100,
        Duration::from_millis(10),
        8,
    ));
    for i in 0..300u64 {
        assert!(
            ns.insert(i, Arc::new(Entry::new(Vector::new(vec![i as f64]))), None)
                .await
        );
    }
    assert_eq!(ns.partition_count().await, 100);
    ns
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_never_exceeds_the_worker_cap() {
    let ns = wide_namespace().await;
    let cancel = CancelSignal::new();
    let args = StageArgs {
        workers: 10,
        base: WorkerArgs {
            // Capacity 1 so a 3-entry scan stays alive until drained.
            buffer: 1,
            cancel: cancel.clone(),
            ttl: Duration::from_secs(10),
            on_exit: None,
        },
    };
    let mut fan = ns.scan(1.0, args).unwrap();

    // Collect child channels without draining them: each open child keeps
    // its worker slot, so the producer must stall at the cap.
    let mut held: Vec<mpsc::Receiver<StoredEntry>> = Vec::new();
    loop {
        match timeout(Duration::from_millis(300), fan.recv()).await {
            Ok(Some(child)) => held.push(child),
            Ok(None) => panic!("fan-out ended before the cap was reached"),
            Err(_) => break,
        }
    }
    assert_eq!(
        held.len(),
        10,
        "exactly the cap's worth of scans may be open at once"
    );

    // Draining releases slots; the remaining partitions then stream through.
    let mut total_entries = 0usize;
    let mut total_channels = held.len();
    for mut child in held.drain(..) {
        while let Some(_item) = child.recv().await {
            total_entries += 1;
        }
    }
    loop {
        match timeout(Duration::from_secs(2), fan.recv()).await {
            Ok(Some(mut child)) => {
                total_channels += 1;
                while let Some(_item) = child.recv().await {
                    total_entries += 1;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("fan-out stalled after slots were released"),
        }
    }
    assert_eq!(total_channels, 100);
    assert_eq!(total_entries, 300, "extent 1.0 visits every entry exactly once");
}

#[tokio::test]
async fn cancelled_fan_out_stops_opening_scans() {
    let ns = wide_namespace().await;
    let cancel = CancelSignal::new();
    let args = StageArgs {
        workers: 4,
        base: WorkerArgs {
            buffer: 1,
            cancel: cancel.clone(),
            ttl: Duration::from_secs(10),
            on_exit: None,
        },
    };
    let mut fan = ns.scan(1.0, args).unwrap();
    let first = timeout(Duration::from_secs(1), fan.recv())
        .await
        .expect("first child arrives")
        .expect("stream open");
    drop(first);
    cancel.cancel();

    // The stream must terminate promptly once the cancel fires.
    let ended = timeout(Duration::from_secs(2), async {
        while let Some(child) = fan.recv().await {
            drop(child);
        }
    })
    .await;
    assert!(ended.is_ok(), "fan-out must close after cancel");
}
