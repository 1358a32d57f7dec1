// Numan Thabit 2025
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};

use crate::node::Node;
use crate::pool::WorkerPool;

static METRICS_ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

#[derive(Clone)]
pub struct MeshMetrics {
    registry: Registry,
    relays: IntCounterVec,
    chain_latency: HistogramVec,
    notifications: IntCounterVec,
    session_validations: IntCounterVec,
    relay_cache_entries: IntGauge,
    node_height: IntGaugeVec,
    pool_workers: IntGaugeVec,
    pool_tasks: IntGaugeVec,
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("mesh_relay".into()), None)
            .expect("failed to create registry");

        let relays = IntCounterVec::new(
            opts!("relays_total", "Client relays by chain and outcome"),
            &["chain", "outcome"],
        )
        .expect("failed to build relay counter");

        let chain_latency = HistogramVec::new(
            HistogramOpts::new(
                "chain_call_seconds",
                "Latency of upstream blockchain calls per chain",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["chain"],
        )
        .expect("failed to build chain latency histogram");

        let notifications = IntCounterVec::new(
            opts!(
                "notifications_total",
                "Relay notifications by node and terminal outcome"
            ),
            &["node", "outcome"],
        )
        .expect("failed to build notification counter");

        let session_validations = IntCounterVec::new(
            opts!(
                "session_validations_total",
                "Session fetches against servicers by node and outcome"
            ),
            &["node", "outcome"],
        )
        .expect("failed to build session validation counter");

        let relay_cache_entries = IntGauge::new(
            "relay_cache_entries",
            "Relays awaiting a terminal notification outcome",
        )
        .expect("failed to build relay cache gauge");

        let node_height = IntGaugeVec::new(
            opts!("node_height", "Last known block height per node"),
            &["node"],
        )
        .expect("failed to build node height gauge");

        let pool_workers = IntGaugeVec::new(
            opts!("pool_workers", "Worker pool occupancy per node"),
            &["node", "pool", "state"],
        )
        .expect("failed to build pool worker gauge");

        let pool_tasks = IntGaugeVec::new(
            opts!("pool_tasks", "Worker pool task counters per node"),
            &["node", "pool", "state"],
        )
        .expect("failed to build pool task gauge");

        registry
            .register(Box::new(relays.clone()))
            .expect("register relays");
        registry
            .register(Box::new(chain_latency.clone()))
            .expect("register chain_latency");
        registry
            .register(Box::new(notifications.clone()))
            .expect("register notifications");
        registry
            .register(Box::new(session_validations.clone()))
            .expect("register session_validations");
        registry
            .register(Box::new(relay_cache_entries.clone()))
            .expect("register relay_cache_entries");
        registry
            .register(Box::new(node_height.clone()))
            .expect("register node_height");
        registry
            .register(Box::new(pool_workers.clone()))
            .expect("register pool_workers");
        registry
            .register(Box::new(pool_tasks.clone()))
            .expect("register pool_tasks");

        Self {
            registry,
            relays,
            chain_latency,
            notifications,
            session_validations,
            relay_cache_entries,
            node_height,
            pool_workers,
            pool_tasks,
        }
    }

    pub fn record_relay(&self, chain: &str, outcome: &str, latency: Option<Duration>) {
        self.relays.with_label_values(&[chain, outcome]).inc();
        if let Some(latency) = latency {
            self.chain_latency
                .with_label_values(&[chain])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn record_notification(&self, node: &str, outcome: &str) {
        self.notifications.with_label_values(&[node, outcome]).inc();
    }

    pub fn record_session_validation(&self, node: &str, outcome: &str) {
        self.session_validations
            .with_label_values(&[node, outcome])
            .inc();
    }

    pub fn set_relay_cache_entries(&self, entries: usize) {
        self.relay_cache_entries.set(entries as i64);
    }

    pub fn observe_node(&self, node: &Node) {
        self.node_height
            .with_label_values(&[node.name()])
            .set(node.height() as i64);
        self.observe_pool(node.name(), "relays", node.pool());
        self.observe_pool(node.name(), "metrics", node.metrics_pool());
    }

    fn observe_pool(&self, node: &str, pool: &str, handle: &WorkerPool) {
        let counters = handle.counters();
        for (state, value) in [
            ("running", counters.running),
            ("idle", counters.idle),
            ("waiting", counters.waiting),
        ] {
            self.pool_workers
                .with_label_values(&[node, pool, state])
                .set(value as i64);
        }
        for (state, value) in [
            ("submitted", counters.submitted),
            ("successful", counters.successful),
            ("failed", counters.failed),
            ("completed", counters.completed),
        ] {
            self.pool_tasks
                .with_label_values(&[node, pool, state])
                .set(value as i64);
        }
    }

    /// Drop per-node series once a node is removed.
    pub fn forget_node(&self, node: &str) {
        let _ = self.node_height.remove_label_values(&[node]);
        for pool in ["relays", "metrics"] {
            for state in ["running", "idle", "waiting"] {
                let _ = self.pool_workers.remove_label_values(&[node, pool, state]);
            }
            for state in ["submitted", "successful", "failed", "completed"] {
                let _ = self.pool_tasks.remove_label_values(&[node, pool, state]);
            }
        }
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::with_capacity(8192);
        METRICS_ENCODER
            .encode(&metric_families, &mut buffer)
            .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
        Ok(String::from_utf8(buffer)?)
    }
}
