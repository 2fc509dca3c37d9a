//! Engine telemetry: typed counters and gauges.
//!
//! The instrumentation surface is a closed set of variants rather than
//! free-form names, so call sites cannot drift and a snapshot always
//! enumerates everything the engine emits. Each variant carries the label
//! operators see, the same way error categories carry theirs. Latency
//! distributions are deliberately absent here: duration stats live in the
//! sliding windows of `tracker` (queue wait, per-namespace query time,
//! monitor quality).

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Monotonic event counts emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Entries admitted through `Handle::add_data`.
    EntriesInserted,
    /// Entries refused: retired, wrong dimension, or capacity.
    EntriesRejected,
    /// Successful partition-level inserts.
    PartitionInserts,
    /// Retired entries compacted out of partitions.
    PartitionCleaned,
    /// Partitions dropped by maintenance after emptying.
    PartitionsRemoved,
    /// Entries emitted by partition scans.
    ScanEmitted,
    /// Queries past validation and admission.
    QueriesAdmitted,
    /// Queries refused because the moving averages exceeded their TTL.
    QueriesRejectedLatency,
    /// Queries refused on a full queue channel.
    QueriesRejectedFull,
    /// Queries dropped after their queue wait exceeded their TTL.
    QueriesDroppedWait,
    /// Queries stopped early once `accept` was satisfied.
    QueriesEarlyStop,
    /// Queries whose outcome the quality monitor recorded.
    QueriesMonitored,
}

impl Counter {
    pub const COUNT: usize = 12;
    pub const ALL: [Counter; Self::COUNT] = [
        Counter::EntriesInserted,
        Counter::EntriesRejected,
        Counter::PartitionInserts,
        Counter::PartitionCleaned,
        Counter::PartitionsRemoved,
        Counter::ScanEmitted,
        Counter::QueriesAdmitted,
        Counter::QueriesRejectedLatency,
        Counter::QueriesRejectedFull,
        Counter::QueriesDroppedWait,
        Counter::QueriesEarlyStop,
        Counter::QueriesMonitored,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Counter::EntriesInserted => "entries_inserted_total",
            Counter::EntriesRejected => "entries_rejected_total",
            Counter::PartitionInserts => "partition_inserts_total",
            Counter::PartitionCleaned => "partition_cleaned_total",
            Counter::PartitionsRemoved => "partitions_removed_total",
            Counter::ScanEmitted => "scan_emitted_total",
            Counter::QueriesAdmitted => "queries_admitted_total",
            Counter::QueriesRejectedLatency => "queries_rejected_latency_total",
            Counter::QueriesRejectedFull => "queries_rejected_full_total",
            Counter::QueriesDroppedWait => "queries_dropped_wait_total",
            Counter::QueriesEarlyStop => "queries_early_stop_total",
            Counter::QueriesMonitored => "queries_monitored_total",
        }
    }
}

/// Point-in-time readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gauge {
    NamespaceCount,
    /// Workers currently executing queries.
    QueueLiveWorkers,
    /// High-water mark of concurrently open partition scans.
    ScanOpenChildrenPeak,
}

impl Gauge {
    pub const COUNT: usize = 3;
    pub const ALL: [Gauge; Self::COUNT] = [
        Gauge::NamespaceCount,
        Gauge::QueueLiveWorkers,
        Gauge::ScanOpenChildrenPeak,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Gauge::NamespaceCount => "namespace_count",
            Gauge::QueueLiveWorkers => "queue_live_workers",
            Gauge::ScanOpenChildrenPeak => "scan_open_children_peak",
        }
    }
}

/// One atomic cell per variant. No locks, no allocation after startup.
#[derive(Debug)]
pub struct EngineMetrics {
    counters: [AtomicU64; Counter::COUNT],
    gauges: [AtomicU64; Gauge::COUNT],
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            gauges: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add_to(counter, 1);
    }

    pub fn add_to(&self, counter: Counter, value: u64) {
        self.counters[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn set_gauge(&self, gauge: Gauge, value: u64) {
        self.gauges[gauge as usize].store(value, Ordering::Relaxed);
    }

    /// Raise the gauge to `value` if it is higher than the current reading.
    /// Used for high-water marks like peak concurrent scans.
    pub fn raise_gauge(&self, gauge: Gauge, value: u64) {
        self.gauges[gauge as usize].fetch_max(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, gauge: Gauge) -> u64 {
        self.gauges[gauge as usize].load(Ordering::Relaxed)
    }

    /// Every counter and gauge with its label, in declaration order.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: Counter::ALL
                .iter()
                .map(|c| (c.label(), self.counter(*c)))
                .collect(),
            gauges: Gauge::ALL
                .iter()
                .map(|g| (g.label(), self.gauge(*g)))
                .collect(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(&'static str, u64)>,
    pub gauges: Vec<(&'static str, u64)>,
}

static ENGINE_METRICS: Lazy<EngineMetrics> = Lazy::new(EngineMetrics::new);

/// Get the process-wide metrics registry.
pub fn metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}
