//! External contract of the engine.
//!
//! A `Handle` owns the namespaces, the request queue, and the root stop
//! signal. It has no persistent state: teardown is a single stop broadcast
//! that reaches the queue consumer, in-flight workers, and every namespace
//! maintenance loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::EngineError;
use crate::metrics::{metrics, Counter, Gauge};
use crate::queue::{QueueOptions, RequestQueue};
use crate::request;
use crate::space::Entry;
use crate::spaces::Namespace;
use crate::tracker::QualitySnapshot;
use crate::types::{EnqueueResult, RequestSpec};

pub struct Handle {
    cfg: Config,
    stop: crate::signal::CancelSignal,
    queue: Arc<RequestQueue>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    next_id: AtomicU64,
}

impl Handle {
    /// Validate the configuration, start the queue consumer and the
    /// shutdown watcher.
    pub fn new(cfg: Config) -> Result<Arc<Self>, EngineError> {
        cfg.validate().map_err(EngineError::config)?;
        let stop = crate::signal::CancelSignal::new();
        let queue = RequestQueue::start(QueueOptions::from_config(&cfg), stop.clone());

        let watcher = stop.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            info!("engine stop signal observed; refusing new work");
        });

        info!(
            max_partitions = cfg.max_partitions,
            partition_capacity = cfg.partition_capacity,
            max_concurrent = cfg.max_concurrent_queries,
            "engine handle started"
        );
        Ok(Arc::new(Self {
            cfg,
            stop,
            queue,
            namespaces: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }))
    }

    /// Register a vector entry under a namespace, creating the namespace
    /// lazily. The opaque payload is accepted and held by reference next to
    /// the entry; reads never expose it. Returns false after shutdown, for
    /// retired entries, and when namespace admission fails.
    pub async fn add_data(
        &self,
        namespace: &str,
        entry: Entry,
        payload: Option<serde_json::Value>,
    ) -> bool {
        if self.stop.is_cancelled() || namespace.is_empty() {
            return false;
        }
        if entry.current().is_none() {
            metrics().incr(Counter::EntriesRejected);
            return false;
        }
        let ns = self.namespace_or_create(namespace).await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ok = ns.insert(id, Arc::new(entry), payload).await;
        if ok {
            metrics().incr(Counter::EntriesInserted);
        } else {
            metrics().incr(Counter::EntriesRejected);
        }
        ok
    }

    /// Validate the spec, check stop and admission, and enqueue. The result
    /// carries the output channel (exactly one ranked buffer, then closed)
    /// and the cancel handle the caller must fire when done.
    pub async fn knn(&self, spec: RequestSpec) -> Result<EnqueueResult, EngineError> {
        spec.validate()?;
        if self.stop.is_cancelled() {
            return Err(EngineError::Stopped);
        }
        let ns = {
            let namespaces = self.namespaces.read().await;
            namespaces
                .get(&spec.namespace)
                .cloned()
                .ok_or_else(|| EngineError::unknown_namespace(&spec.namespace))?
        };
        self.queue.admit(&ns, spec.ttl())?;
        let (req, result) = request::assemble(spec)?;
        debug!(query_id = %result.query_id, "query admitted");
        self.queue.enqueue(req, ns).await?;
        metrics().incr(Counter::QueriesAdmitted);
        Ok(result)
    }

    /// Fire the root stop signal. Idempotent.
    pub fn shutdown(&self) {
        if self.stop.cancel() {
            info!("engine shutdown requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    // --- info surface ---

    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.read().await.contains_key(name)
    }

    pub async fn namespace_dim(&self, name: &str) -> Option<usize> {
        let ns = self.namespaces.read().await.get(name).cloned()?;
        Some(ns.dim())
    }

    pub async fn namespace_len(&self, name: &str) -> Option<usize> {
        let ns = self.namespaces.read().await.get(name).cloned()?;
        Some(ns.len().await)
    }

    pub async fn namespace_capacity(&self, name: &str) -> Option<usize> {
        let ns = self.namespaces.read().await.get(name).cloned()?;
        Some(ns.capacity().await)
    }

    /// Average queue wait over the standard tracker period.
    pub fn queue_latency(&self) -> Option<Duration> {
        self.queue.queue_latency(self.cfg.tracker_period())
    }

    /// Average query execution time for one namespace over the standard
    /// tracker period.
    pub async fn query_latency(&self, name: &str) -> Option<Duration> {
        let ns = self.namespaces.read().await.get(name).cloned()?;
        ns.query_latency.average(self.cfg.tracker_period())
    }

    pub fn monitor_snapshot(&self, period: Duration) -> QualitySnapshot {
        self.queue.monitor_snapshot(period)
    }

    /// Drop every entry and partition of a namespace. The namespace itself
    /// stays registered and its maintenance loop keeps running.
    pub async fn clear_namespace(&self, name: &str) -> bool {
        let ns = {
            let namespaces = self.namespaces.read().await;
            match namespaces.get(name) {
                Some(ns) => Arc::clone(ns),
                None => return false,
            }
        };
        let dropped = ns.clear().await;
        info!(namespace = name, dropped, "namespace cleared");
        true
    }

    async fn namespace_or_create(&self, name: &str) -> Arc<Namespace> {
        {
            let namespaces = self.namespaces.read().await;
            if let Some(ns) = namespaces.get(name) {
                return Arc::clone(ns);
            }
        }
        let mut namespaces = self.namespaces.write().await;
        if let Some(ns) = namespaces.get(name) {
            return Arc::clone(ns);
        }
        let ns = Arc::new(Namespace::new(
            name,
            self.cfg.partition_capacity,
            self.cfg.max_partitions,
            self.cfg.tracker_min_step(),
            self.cfg.tracker_max_buckets,
        ));
        Arc::clone(&ns).spawn_maintenance(self.cfg.maintenance_interval(), self.stop.clone());
        namespaces.insert(name.to_string(), Arc::clone(&ns));
        metrics().set_gauge(Gauge::NamespaceCount, namespaces.len() as u64);
        info!(namespace = name, "namespace created");
        ns
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
