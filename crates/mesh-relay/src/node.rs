// Numan Thabit 2025
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkersConfig;
use crate::error::RelayError;
use crate::pool::{PoolCounters, WorkerPool};
use crate::protocol::NodeStatus;
use crate::relay::session_height;

#[derive(Debug, Default)]
struct ServicerList {
    addresses: Vec<String>,
    need_resize: bool,
}

/// An upstream servicer process reachable at one URL.
pub struct Node {
    name: String,
    url: String,
    status: RwLock<Option<NodeStatus>>,
    blocks_per_session: AtomicU64,
    servicers: Mutex<ServicerList>,
    pool: WorkerPool,
    metrics_pool: WorkerPool,
    cron: CancellationToken,
    probed: AtomicBool,
}

impl Node {
    /// Creates the node's pools; must run inside a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        addresses: Vec<String>,
        workers: &WorkersConfig,
    ) -> Self {
        let name = name.into();
        let count = addresses.len();
        let pool = WorkerPool::new(
            format!("{name}/relays"),
            workers.servicer.pool_config(count),
        );
        let metrics_pool = WorkerPool::new(
            format!("{name}/metrics"),
            workers.metrics.pool_config(count),
        );
        Self {
            url: url.into(),
            status: RwLock::new(None),
            blocks_per_session: AtomicU64::new(0),
            servicers: Mutex::new(ServicerList {
                addresses,
                need_resize: false,
            }),
            pool,
            metrics_pool,
            cron: CancellationToken::new(),
            probed: AtomicBool::new(false),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> Option<NodeStatus> {
        *self.status.read()
    }

    pub fn set_status(&self, status: NodeStatus) {
        let mut current = self.status.write();
        let previous = current.replace(status);
        let changed = previous
            .map(|p| p.is_starting != status.is_starting || p.is_catching_up != status.is_catching_up)
            .unwrap_or(true);
        if changed {
            info!(
                node = %self.name,
                height = status.height,
                starting = status.is_starting,
                catching_up = status.is_catching_up,
                "node status changed"
            );
        }
    }

    /// Forget the last status so relays are refused until the next check.
    pub fn mark_degraded(&self) {
        if self.status.write().take().is_some() {
            warn!(node = %self.name, "node degraded");
        }
    }

    pub fn height(&self) -> u64 {
        self.status.read().map(|s| s.height).unwrap_or(0)
    }

    /// Raise the cached height if `height` is newer. Returns whether it moved.
    pub fn observe_height(&self, height: u64) -> bool {
        let mut status = self.status.write();
        match status.as_mut() {
            Some(current) if height > current.height => {
                current.height = height;
                true
            }
            _ => false,
        }
    }

    pub fn blocks_per_session(&self) -> u64 {
        self.blocks_per_session.load(Ordering::Acquire)
    }

    pub fn set_blocks_per_session(&self, blocks: u64) {
        if blocks > 0 {
            self.blocks_per_session.store(blocks, Ordering::Release);
        }
    }

    /// Start height of the node's current session.
    pub fn session_height(&self) -> u64 {
        session_height(self.height(), self.blocks_per_session())
    }

    pub fn ensure_healthy(&self) -> Result<(), RelayError> {
        let reason = match self.status() {
            None => "status unknown",
            Some(s) if s.is_starting => "node is starting",
            Some(s) if s.is_catching_up => "node is catching up",
            Some(_) => return Ok(()),
        };
        Err(RelayError::NodeUnhealthy {
            node: self.name.clone(),
            reason: reason.to_string(),
        })
    }

    pub fn servicer_addresses(&self) -> Vec<String> {
        self.servicers.lock().addresses.clone()
    }

    pub fn servicer_count(&self) -> usize {
        self.servicers.lock().addresses.len()
    }

    /// Replace the hosted servicer list; flags a resize when the count moves.
    pub fn set_servicers(&self, addresses: Vec<String>) {
        let mut list = self.servicers.lock();
        if list.addresses.len() != addresses.len() {
            list.need_resize = true;
        }
        list.addresses = addresses;
    }

    /// Resize the pools if the servicer count changed since the last call.
    pub fn apply_resize(&self, workers: &WorkersConfig) -> bool {
        let count = {
            let mut list = self.servicers.lock();
            if !list.need_resize {
                return false;
            }
            list.need_resize = false;
            list.addresses.len()
        };
        self.pool.resize(workers.servicer.pool_config(count));
        self.metrics_pool.resize(workers.metrics.pool_config(count));
        info!(node = %self.name, servicers = count, "resized node worker pools");
        true
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn metrics_pool(&self) -> &WorkerPool {
        &self.metrics_pool
    }

    pub fn pool_counters(&self) -> PoolCounters {
        self.pool.counters()
    }

    /// Cancelled when the node is removed or the process stops.
    pub fn cron(&self) -> &CancellationToken {
        &self.cron
    }

    pub fn mark_probed(&self) -> bool {
        !self.probed.swap(true, Ordering::AcqRel)
    }

    pub fn is_probed(&self) -> bool {
        self.probed.load(Ordering::Acquire)
    }

    /// Stop the health cron, then drain both pools.
    pub async fn stop(&self) {
        self.cron.cancel();
        self.pool.stop_and_wait().await;
        self.metrics_pool.stop_and_wait().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addresses: &[&str]) -> Node {
        Node::new(
            "n1",
            "http://n1",
            addresses.iter().map(|a| a.to_string()).collect(),
            &WorkersConfig::default(),
        )
    }

    #[tokio::test]
    async fn health_follows_status() {
        let node = node(&["a"]);
        assert!(matches!(
            node.ensure_healthy(),
            Err(RelayError::NodeUnhealthy { .. })
        ));
        node.set_status(NodeStatus {
            height: 10,
            is_starting: false,
            is_catching_up: true,
        });
        let err = node.ensure_healthy().unwrap_err();
        assert!(err.to_string().contains("catching up"));
        node.set_status(NodeStatus {
            height: 10,
            ..NodeStatus::default()
        });
        node.ensure_healthy().unwrap();
    }

    #[tokio::test]
    async fn observed_height_only_moves_forward() {
        let node = node(&["a"]);
        assert!(!node.observe_height(5));
        node.set_status(NodeStatus {
            height: 10,
            ..NodeStatus::default()
        });
        assert!(node.observe_height(12));
        assert!(!node.observe_height(11));
        assert_eq!(node.height(), 12);
        node.set_blocks_per_session(4);
        assert_eq!(node.session_height(), 9);
    }

    #[tokio::test]
    async fn resize_only_after_count_change() {
        let node = node(&["a", "b"]);
        let workers = WorkersConfig::default();
        assert!(!node.apply_resize(&workers));
        node.set_servicers(vec!["b".into(), "a".into()]);
        assert!(!node.apply_resize(&workers));
        node.set_servicers(vec!["a".into()]);
        assert!(node.apply_resize(&workers));
        assert_eq!(
            node.pool().config().max_workers,
            workers.servicer.max_workers
        );
        assert!(!node.apply_resize(&workers));
    }

    #[tokio::test]
    async fn stop_cancels_cron_and_pools() {
        let node = node(&["a"]);
        assert!(node.mark_probed());
        assert!(!node.mark_probed());
        node.stop().await;
        assert!(node.cron().is_cancelled());
        assert!(node.pool().is_stopped());
        assert!(node.metrics_pool().is_stopped());
    }
}
