//! Time-bucketed sliding windows for latency and result quality.
//!
//! A `BucketChain` is a capped, newest-first chain of timestamped buckets.
//! Registering a sample updates the head in place until `min_step` has
//! elapsed since the head was created, at which point a new head is
//! prepended and the tail trimmed so the chain never exceeds `max_n`.
//! Readers walk the chain from the head while buckets fall inside the
//! requested period.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug)]
struct Bucket<P> {
    created: Instant,
    payload: P,
}

/// Capped newest-first bucket chain. Not synchronized; wrap in a lock.
#[derive(Debug)]
pub struct BucketChain<P> {
    min_step: Duration,
    max_n: usize,
    buckets: VecDeque<Bucket<P>>,
}

impl<P: Default> BucketChain<P> {
    pub fn new(min_step: Duration, max_n: usize) -> Self {
        // A zero cap would drop every sample on the floor.
        Self {
            min_step,
            max_n: max_n.max(1),
            buckets: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Apply `update` to the head bucket, rolling the chain first when the
    /// head is older than `min_step`.
    pub fn register<F: FnOnce(&mut P)>(&mut self, update: F) {
        let now = Instant::now();
        let roll = match self.buckets.front() {
            None => true,
            Some(head) => now.duration_since(head.created) >= self.min_step,
        };
        if roll {
            self.buckets.push_front(Bucket {
                created: now,
                payload: P::default(),
            });
            while self.buckets.len() > self.max_n {
                self.buckets.pop_back();
            }
        }
        if let Some(head) = self.buckets.front_mut() {
            update(&mut head.payload);
        }
    }

    /// Fold the payloads of every bucket created within `period`.
    pub fn fold<T, F: FnMut(T, &P) -> T>(&self, period: Duration, init: T, mut f: F) -> T {
        let now = Instant::now();
        let mut acc = init;
        for bucket in &self.buckets {
            if now.duration_since(bucket.created) > period {
                break;
            }
            acc = f(acc, &bucket.payload);
        }
        acc
    }
}

/// Payload accumulating wait/latency samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyBucket {
    pub total: Duration,
    pub samples: u64,
}

/// Sliding latency window shared across tasks.
#[derive(Debug)]
pub struct LatencyTracker {
    chain: RwLock<BucketChain<LatencyBucket>>,
}

impl LatencyTracker {
    pub fn new(min_step: Duration, max_n: usize) -> Self {
        Self {
            chain: RwLock::new(BucketChain::new(min_step, max_n)),
        }
    }

    pub fn register(&self, sample: Duration) {
        self.chain.write().register(|b| {
            b.total += sample;
            b.samples += 1;
        });
    }

    /// Mean sample over `period`. `None` when the window holds no samples.
    pub fn average(&self, period: Duration) -> Option<Duration> {
        let (total, samples) = self.chain.read().fold(
            period,
            (Duration::ZERO, 0u64),
            |(t, n), b| (t + b.total, n + b.samples),
        );
        if samples == 0 {
            None
        } else {
            Some(total / samples as u32)
        }
    }

    /// Raw buckets inside `period`, newest first.
    pub fn collect(&self, period: Duration) -> Vec<LatencyBucket> {
        self.chain
            .read()
            .fold(period, Vec::new(), |mut acc, b| {
                acc.push(*b);
                acc
            })
    }
}

/// One monitored query outcome.
#[derive(Debug, Clone, Copy)]
pub struct QualityRecord {
    pub latency: Duration,
    pub mean_score: f64,
    /// `|result| / K`.
    pub satisfaction: f64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QualityBucket {
    pub latency_total: Duration,
    pub score_total: f64,
    pub satisfaction_total: f64,
    pub samples: u64,
}

/// Rolling window of monitored query quality.
#[derive(Debug)]
pub struct QualityTracker {
    chain: RwLock<BucketChain<QualityBucket>>,
}

/// Aggregated monitor view over a period.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySnapshot {
    pub taken_at: DateTime<Utc>,
    pub period_ms: u64,
    pub samples: u64,
    pub avg_latency_ms: f64,
    pub avg_score: f64,
    pub avg_satisfaction: f64,
}

impl QualityTracker {
    pub fn new(min_step: Duration, max_n: usize) -> Self {
        Self {
            chain: RwLock::new(BucketChain::new(min_step, max_n)),
        }
    }

    pub fn register(&self, rec: QualityRecord) {
        self.chain.write().register(|b| {
            b.latency_total += rec.latency;
            b.score_total += rec.mean_score;
            b.satisfaction_total += rec.satisfaction;
            b.samples += 1;
        });
    }

    pub fn snapshot(&self, period: Duration) -> QualitySnapshot {
        let folded = self.chain.read().fold(
            period,
            QualityBucket::default(),
            |mut acc, b| {
                acc.latency_total += b.latency_total;
                acc.score_total += b.score_total;
                acc.satisfaction_total += b.satisfaction_total;
                acc.samples += b.samples;
                acc
            },
        );
        let n = folded.samples;
        let div = if n == 0 { 1.0 } else { n as f64 };
        QualitySnapshot {
            taken_at: Utc::now(),
            period_ms: period.as_millis() as u64,
            samples: n,
            avg_latency_ms: folded.latency_total.as_secs_f64() * 1_000.0 / div,
            avg_score: folded.score_total / div,
            avg_satisfaction: folded.satisfaction_total / div,
        }
    }

    /// Raw buckets inside `period`, newest first.
    pub fn collect(&self, period: Duration) -> Vec<QualityBucket> {
        self.chain
            .read()
            .fold(period, Vec::new(), |mut acc, b| {
                acc.push(*b);
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn head_updates_in_place_within_min_step() {
        let mut chain: BucketChain<LatencyBucket> =
            BucketChain::new(Duration::from_secs(60), 8);
        chain.register(|b| b.samples += 1);
        chain.register(|b| b.samples += 1);
        assert_eq!(chain.len(), 1);
        let total = chain.fold(Duration::from_secs(60), 0u64, |n, b| n + b.samples);
        assert_eq!(total, 2);
    }

    #[test]
    fn head_rolls_after_min_step_and_tail_trims() {
        let mut chain: BucketChain<LatencyBucket> =
            BucketChain::new(Duration::from_millis(5), 2);
        chain.register(|b| b.samples += 1);
        sleep(Duration::from_millis(8));
        chain.register(|b| b.samples += 1);
        sleep(Duration::from_millis(8));
        chain.register(|b| b.samples += 1);
        assert_eq!(chain.len(), 2, "tail must be trimmed to max_n");
    }

    #[test]
    fn fold_respects_period() {
        let mut chain: BucketChain<LatencyBucket> =
            BucketChain::new(Duration::from_millis(5), 8);
        chain.register(|b| b.samples += 1);
        sleep(Duration::from_millis(30));
        chain.register(|b| b.samples += 1);
        let recent = chain.fold(Duration::from_millis(10), 0u64, |n, b| n + b.samples);
        assert_eq!(recent, 1, "the old bucket falls outside the period");
    }

    #[test]
    fn latency_average_guards_empty_window() {
        let tracker = LatencyTracker::new(Duration::from_millis(10), 4);
        assert!(tracker.average(Duration::from_secs(1)).is_none());
        tracker.register(Duration::from_millis(20));
        tracker.register(Duration::from_millis(40));
        let avg = tracker.average(Duration::from_secs(1)).unwrap();
        assert_eq!(avg, Duration::from_millis(30));
    }

    #[test]
    fn quality_snapshot_averages() {
        let tracker = QualityTracker::new(Duration::from_millis(10), 4);
        let empty = tracker.snapshot(Duration::from_secs(1));
        assert_eq!(empty.samples, 0);
        assert_eq!(empty.avg_score, 0.0);

        tracker.register(QualityRecord {
            latency: Duration::from_millis(10),
            mean_score: 2.0,
            satisfaction: 1.0,
        });
        tracker.register(QualityRecord {
            latency: Duration::from_millis(30),
            mean_score: 4.0,
            satisfaction: 0.5,
        });
        let snap = tracker.snapshot(Duration::from_secs(1));
        assert_eq!(snap.samples, 2);
        assert!((snap.avg_score - 3.0).abs() < 1e-9);
        assert!((snap.avg_satisfaction - 0.75).abs() < 1e-9);
        assert!((snap.avg_latency_ms - 20.0).abs() < 1.0);
    }

    #[test]
    fn zero_max_n_is_normalized() {
        let mut chain: BucketChain<LatencyBucket> = BucketChain::new(Duration::from_secs(1), 0);
        chain.register(|b| b.samples += 1);
        assert_eq!(chain.len(), 1);
    }
}
