// Numan Thabit 2025
//! Process-wide state built once at start and torn down in reverse.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthToken;
use crate::chains::ChainRegistry;
use crate::clients::Clients;
use crate::codes::CodeSets;
use crate::config::MeshConfig;
use crate::crypto::address_from_public_hex;
use crate::health;
use crate::keystore::{load_key_file, Registry, ReloadDiff};
use crate::metrics::MeshMetrics;
use crate::node::Node;
use crate::notify;
use crate::relay::Relay;
use crate::relay_cache::{spawn_compaction, CacheError, RelayCache};

/// Counts from a startup scan of the relay cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resubmitted: usize,
    pub dropped: usize,
    pub undecodable: usize,
}

pub struct Runtime {
    config: MeshConfig,
    clients: Clients,
    registry: Registry,
    chains: ChainRegistry,
    cache: Arc<RelayCache>,
    metrics: MeshMetrics,
    codes: CodeSets,
    auth_token: AuthToken,
    servicer_token: AuthToken,
    /// Cancelled to stop accepting HTTP requests.
    shutdown: CancellationToken,
    /// Cancelled to stop tickers and crons.
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reload: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Runtime {
    /// Load keys, chains and tokens, open the relay cache and probe every
    /// node. Any failure here is fatal to the process.
    pub async fn start(config: MeshConfig, metrics: MeshMetrics) -> Result<Arc<Self>> {
        let specs = load_key_file(&config.keys_path()).context("failed to load servicer keys")?;
        let chains = ChainRegistry::load(config.chains_path())?;
        let auth_token = AuthToken::load_or_generate(&config.auth_token_path())?;
        let servicer_token = AuthToken::read(&config.servicer_auth_token_path())?;
        let clients = Clients::new(&config.clients, &config.user_agent)?;

        let registry = Registry::new();
        let diff = registry.reconcile(specs, &config.workers);
        info!(
            nodes = diff.added_nodes.len(),
            servicers = diff.added_servicers.len(),
            chains = chains.len(),
            "keystore loaded"
        );

        let nodes = registry.nodes();
        if let Err(err) = health::probe_nodes(&clients.servicer, &nodes).await {
            for node in &nodes {
                node.stop().await;
            }
            return Err(err.context("first-time connectivity probe failed"));
        }

        let cache = match RelayCache::open(
            config.relay_cache_path(),
            config.relay_cache.background_sync_interval,
        ) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                for node in &nodes {
                    node.stop().await;
                }
                return Err(anyhow::Error::new(err).context("failed to open relay cache"));
            }
        };

        let rt = Arc::new(Self {
            codes: config.code_sets(),
            config,
            clients,
            registry,
            chains,
            cache,
            metrics,
            auth_token,
            servicer_token,
            shutdown: CancellationToken::new(),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            reload: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        for node in &nodes {
            rt.start_node_cron(node.clone());
        }
        let report = rt.recover();
        info!(
            resubmitted = report.resubmitted,
            dropped = report.dropped,
            undecodable = report.undecodable,
            "relay cache scanned"
        );
        rt.spawn_background();
        Ok(rt)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    pub fn cache(&self) -> &Arc<RelayCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    pub fn codes(&self) -> &CodeSets {
        &self.codes
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }

    pub fn servicer_token(&self) -> &AuthToken {
        &self.servicer_token
    }

    pub fn background_token(&self) -> CancellationToken {
        self.background.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drop a relay from the cache once its notification is final.
    pub fn forget_relay(&self, key: &str) {
        match self.cache.delete(key) {
            Ok(_) => {}
            Err(CacheError::Closed) => debug!(relay = %key, "relay cache closed; keeping relay"),
            Err(err) => warn!(relay = %key, error = %err, "failed to delete relay"),
        }
    }

    /// Drop `relay` once its notification is final, unless a later relay
    /// with the same request hash has replaced it.
    pub fn release_relay(&self, relay: &Relay) {
        let key = relay.cache_key();
        match self.cache.delete_relay(relay) {
            Ok(true) => {}
            Ok(false) => debug!(relay = %key, "cached relay replaced or already gone; keeping entry"),
            Err(CacheError::Closed) => debug!(relay = %key, "relay cache closed; keeping relay"),
            Err(err) => warn!(relay = %key, error = %err, "failed to delete relay"),
        }
    }

    /// Re-submit notifications for everything left in the relay cache.
    /// Relays whose servicer is gone, or that no longer decode, are deleted.
    pub fn recover(self: &Arc<Self>) -> RecoveryReport {
        self.sweep(|_| true)
    }

    /// Like `recover`, restricted to relays signed by one of `addresses`.
    /// Run after a reload stops pools that held their notifications.
    pub fn recover_servicers(self: &Arc<Self>, addresses: &HashSet<String>) -> RecoveryReport {
        self.sweep(|relay| {
            address_from_public_hex(&relay.proof.servicer_pub_key)
                .map(|address| addresses.contains(&address))
                .unwrap_or(false)
        })
    }

    fn sweep(self: &Arc<Self>, wanted: impl Fn(&Relay) -> bool) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut doomed = Vec::new();
        for entry in self.cache.iter() {
            let (key, relay) = match entry {
                Ok(entry) => entry,
                Err(CacheError::Decode { key, source }) => {
                    warn!(relay = %key, error = %source, "undecodable relay in cache; deleting");
                    report.undecodable += 1;
                    doomed.push(key);
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "relay cache scan aborted");
                    break;
                }
            };
            if !wanted(&relay) {
                continue;
            }
            let Some(servicer) = self
                .registry
                .servicer_by_public_key(&relay.proof.servicer_pub_key)
            else {
                info!(relay = %key, "servicer no longer loaded; dropping cached relay");
                report.dropped += 1;
                doomed.push(key);
                continue;
            };
            let node = servicer.node();
            match notify::submit(self, &node, relay) {
                Ok(()) => report.resubmitted += 1,
                Err(err) => {
                    warn!(relay = %key, node = %node.name(), error = %err, "could not resubmit relay; it stays cached")
                }
            }
        }
        for key in doomed {
            self.forget_relay(&key);
        }
        self.metrics.set_relay_cache_entries(self.cache.len());
        report
    }

    /// Re-read the key file and the chain file.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        let keys = self.reload_keys().await;
        let chains = self.reload_chains();
        keys?;
        chains?;
        Ok(())
    }

    /// Diff the key file against the registry and apply it. Removed nodes
    /// are stopped; added nodes are probed and get a health cron. A probe
    /// failure after startup is only logged. Stopping a node drops its queued
    /// notifications, so cached relays of the servicers it hosted are swept:
    /// moved servicers are re-notified through their new node, removed ones
    /// are deleted unsent.
    pub async fn reload_keys(self: &Arc<Self>) -> Result<ReloadDiff> {
        if self.closed.load(Ordering::Acquire) {
            bail!("runtime is shutting down");
        }
        let _guard = self.reload.lock().await;
        let specs = load_key_file(&self.config.keys_path())
            .context("failed to reload servicer keys")?;
        let diff = self.registry.reconcile(specs, &self.config.workers);
        if diff.is_empty() {
            debug!("key file unchanged");
            return Ok(diff);
        }

        for node in &diff.removed_nodes {
            node.stop().await;
            self.metrics.forget_node(node.name());
        }
        if !diff.added_nodes.is_empty() {
            if let Err(err) = health::probe_nodes(&self.clients.servicer, &diff.added_nodes).await {
                warn!(error = %format!("{err:#}"), "connectivity probe failed for reloaded nodes");
            }
            for node in &diff.added_nodes {
                self.start_node_cron(node.clone());
            }
        }

        let mut orphaned: HashSet<String> = diff.removed_servicers.iter().cloned().collect();
        for node in &diff.removed_nodes {
            orphaned.extend(node.servicer_addresses());
        }
        if !orphaned.is_empty() {
            let report = self.recover_servicers(&orphaned);
            info!(
                resubmitted = report.resubmitted,
                dropped = report.dropped,
                undecodable = report.undecodable,
                "relay cache swept after reload"
            );
        }
        info!(
            added_nodes = diff.added_nodes.len(),
            removed_nodes = diff.removed_nodes.len(),
            added_servicers = diff.added_servicers.len(),
            removed_servicers = diff.removed_servicers.len(),
            moved_servicers = diff.moved_servicers.len(),
            resized_nodes = diff.resized_nodes.len(),
            "keystore reloaded"
        );
        Ok(diff)
    }

    pub fn reload_chains(&self) -> Result<usize> {
        let count = self.chains.reload()?;
        debug!(chains = count, "hosted chains reloaded");
        Ok(count)
    }

    fn start_node_cron(self: &Arc<Self>, node: Arc<Node>) {
        let handle = health::spawn_node_cron(self.clone(), node, self.config.intervals.node_check);
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn spawn_background(self: &Arc<Self>) {
        let intervals = &self.config.intervals;
        self.track(spawn_compaction(
            self.cache.clone(),
            self.config.relay_cache.background_compaction_interval,
            self.background.clone(),
        ));
        self.track(health::spawn_session_cleanup(
            self.clone(),
            intervals.session_cache_clean_up,
        ));

        let rt = self.clone();
        self.track(self.spawn_ticker(intervals.keys_hot_reload, move || {
            let rt = rt.clone();
            async move {
                if let Err(err) = rt.reload_keys().await {
                    warn!(error = %format!("{err:#}"), "periodic key reload failed");
                }
            }
        }));
        let rt = self.clone();
        self.track(self.spawn_ticker(intervals.chains_hot_reload, move || {
            let rt = rt.clone();
            async move {
                if let Err(err) = rt.reload_chains() {
                    warn!(error = %format!("{err:#}"), "periodic chain reload failed");
                }
            }
        }));
    }

    /// Run `job` every `every` until background work is cancelled.
    fn spawn_ticker<F, Fut>(&self, every: std::time::Duration, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let cancel = self.background.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                job().await;
            }
        })
    }

    /// Stop accepting requests; `close` finishes the teardown.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutdown requested");
            self.shutdown.cancel();
        }
    }

    /// Close the relay cache, stop every node pool and cron, then stop
    /// background work. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.begin_shutdown();
        if let Err(err) = self.cache.close() {
            error!(error = %err, "failed to close relay cache");
        }
        for node in self.registry.nodes() {
            node.stop().await;
        }
        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "background task ended abnormally");
                }
            }
        }
        info!("runtime closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
