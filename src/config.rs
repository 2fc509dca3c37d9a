use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Store shape
    #[serde(default = "default_partition_capacity")]
    pub partition_capacity: usize,
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    // Latency / quality windows
    #[serde(default = "default_tracker_min_step_ms")]
    pub tracker_min_step_ms: u64,
    #[serde(default = "default_tracker_max_buckets")]
    pub tracker_max_buckets: usize,
    /// Standard lookback period for admission checks and info reads.
    #[serde(default = "default_tracker_period_ms")]
    pub tracker_period_ms: u64,

    // Queue
    #[serde(default = "default_queue_buffer")]
    pub queue_buffer: usize,
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    // Pipeline shape
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
    #[serde(default = "default_stage_workers")]
    pub stage_workers: usize,
    #[serde(default = "default_stage_buffer")]
    pub stage_buffer: usize,
    #[serde(default = "default_merge_flush_every")]
    pub merge_flush_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_capacity: default_partition_capacity(),
            max_partitions: default_max_partitions(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            tracker_min_step_ms: default_tracker_min_step_ms(),
            tracker_max_buckets: default_tracker_max_buckets(),
            tracker_period_ms: default_tracker_period_ms(),
            queue_buffer: default_queue_buffer(),
            max_concurrent_queries: default_max_concurrent_queries(),
            scan_workers: default_scan_workers(),
            stage_workers: default_stage_workers(),
            stage_buffer: default_stage_buffer(),
            merge_flush_every: default_merge_flush_every(),
        }
    }
}

fn default_partition_capacity() -> usize {
    4_096
}
fn default_max_partitions() -> usize {
    64
}
fn default_maintenance_interval_ms() -> u64 {
    500
}
fn default_tracker_min_step_ms() -> u64 {
    1_000
}
fn default_tracker_max_buckets() -> usize {
    120
}
fn default_tracker_period_ms() -> u64 {
    60_000
}
fn default_queue_buffer() -> usize {
    256
}
fn default_max_concurrent_queries() -> usize {
    8
}
fn default_scan_workers() -> usize {
    10
}
fn default_stage_workers() -> usize {
    4
}
fn default_stage_buffer() -> usize {
    64
}
fn default_merge_flush_every() -> usize {
    32
}

impl Config {
    /// Load configuration from "config.toml" if present, otherwise return
    /// defaults. ENV override with highest priority:
    /// - KNN_MAX_CONCURRENT=<n>
    pub fn load() -> Self {
        let mut cfg = match fs::read_to_string("config.toml") {
            Ok(s) => toml::from_str::<Config>(&s).unwrap_or_default(),
            Err(_) => Config::default(),
        };

        if let Ok(v) = std::env::var("KNN_MAX_CONCURRENT") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.max_concurrent_queries = n;
                }
            }
        }

        cfg
    }

    /// Validate configuration consistency and constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.partition_capacity == 0 {
            return Err("partition_capacity must be greater than 0".to_string());
        }

        if self.max_partitions == 0 {
            return Err("max_partitions must be greater than 0".to_string());
        }

        if self.maintenance_interval_ms == 0 {
            return Err("maintenance_interval_ms must be greater than 0".to_string());
        }

        if self.tracker_min_step_ms == 0 {
            return Err("tracker_min_step_ms must be greater than 0".to_string());
        }

        if self.tracker_max_buckets == 0 {
            return Err("tracker_max_buckets must be greater than 0".to_string());
        }

        if self.tracker_period_ms == 0 {
            return Err("tracker_period_ms must be greater than 0".to_string());
        }

        if self.max_concurrent_queries == 0 {
            return Err("max_concurrent_queries must be greater than 0".to_string());
        }

        if self.scan_workers == 0 {
            return Err("scan_workers must be greater than 0".to_string());
        }

        if self.stage_workers == 0 {
            return Err("stage_workers must be greater than 0".to_string());
        }

        if self.merge_flush_every == 0 {
            return Err("merge_flush_every must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn tracker_min_step(&self) -> Duration {
        Duration::from_millis(self.tracker_min_step_ms)
    }

    pub fn tracker_period(&self) -> Duration {
        Duration::from_millis(self.tracker_period_ms)
    }
}
