// Numan Thabit 2025
//! Servicer key files and the registry of loaded servicers and nodes.
//!
//! Every change to the registry goes through [`Registry::reconcile`], which
//! diffs the desired layout against the loaded one under a single lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::config::WorkersConfig;
use crate::crypto::{address_from_public_hex, KeyError, ServicerKey};
use crate::node::Node;
use crate::servicer::Servicer;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} matches neither the node schema nor the legacy schema")]
    Schema(PathBuf),
    #[error("key {index} of node {node} is invalid: {source}")]
    Key {
        node: String,
        index: usize,
        #[source]
        source: KeyError,
    },
    #[error("node url {0:?} is invalid")]
    Url(String),
    #[error("servicer {0} is listed more than once")]
    Duplicate(String),
    #[error("key file {0} lists no servicers")]
    Empty(PathBuf),
}

/// Current schema: one entry per node.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeEntry {
    #[serde(default)]
    name: Option<String>,
    url: String,
    keys: Vec<String>,
}

/// Legacy schema: one entry per key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyEntry {
    priv_key: String,
    servicer_url: String,
}

/// Desired layout of one node as read from the key file.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub url: String,
    pub keys: Vec<ServicerKey>,
}

pub fn load_key_file(path: &Path) -> Result<Vec<NodeSpec>, KeystoreError> {
    let raw = fs::read(path).map_err(|source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_key_file(&raw, path)
}

pub fn parse_key_file(raw: &[u8], path: &Path) -> Result<Vec<NodeSpec>, KeystoreError> {
    let raw_nodes: Vec<(Option<String>, String, Vec<String>)> =
        if let Ok(entries) = serde_json::from_slice::<Vec<NodeEntry>>(raw) {
            entries
                .into_iter()
                .map(|e| (e.name, e.url, e.keys))
                .collect()
        } else if let Ok(entries) = serde_json::from_slice::<Vec<LegacyEntry>>(raw) {
            let mut grouped: Vec<(Option<String>, String, Vec<String>)> = Vec::new();
            for entry in entries {
                match grouped.iter_mut().find(|(_, url, _)| *url == entry.servicer_url) {
                    Some((_, _, keys)) => keys.push(entry.priv_key),
                    None => grouped.push((None, entry.servicer_url, vec![entry.priv_key])),
                }
            }
            grouped
        } else {
            return Err(KeystoreError::Schema(path.to_path_buf()));
        };

    // Entries naming the same url are merged, first name wins.
    let mut specs: Vec<NodeSpec> = Vec::new();
    let mut seen = HashSet::new();
    for (name, url, keys) in raw_nodes {
        let url = normalize_url(&url)?;
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(&url));
        let mut parsed = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            let key = ServicerKey::from_hex(key).map_err(|source| KeystoreError::Key {
                node: name.clone(),
                index,
                source,
            })?;
            if !seen.insert(key.address().to_string()) {
                return Err(KeystoreError::Duplicate(key.address().to_string()));
            }
            parsed.push(key);
        }
        match specs.iter_mut().find(|s| s.url == url) {
            Some(spec) => spec.keys.extend(parsed),
            None => specs.push(NodeSpec {
                name,
                url,
                keys: parsed,
            }),
        }
    }
    specs.retain(|s| !s.keys.is_empty());
    if specs.is_empty() {
        return Err(KeystoreError::Empty(path.to_path_buf()));
    }
    Ok(specs)
}

fn normalize_url(raw: &str) -> Result<String, KeystoreError> {
    let parsed = Url::parse(raw.trim()).map_err(|_| KeystoreError::Url(raw.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(KeystoreError::Url(raw.to_string()));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn default_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| url.to_string())
}

/// What a reconcile pass changed.
#[derive(Debug, Default)]
pub struct ReloadDiff {
    pub added_nodes: Vec<Arc<Node>>,
    pub removed_nodes: Vec<Arc<Node>>,
    pub added_servicers: Vec<String>,
    pub removed_servicers: Vec<String>,
    pub moved_servicers: Vec<String>,
    pub resized_nodes: Vec<String>,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.added_servicers.is_empty()
            && self.removed_servicers.is_empty()
            && self.moved_servicers.is_empty()
            && self.resized_nodes.is_empty()
    }
}

/// Loaded servicers keyed by address and nodes keyed by url.
#[derive(Default)]
pub struct Registry {
    servicers: DashMap<String, Arc<Servicer>>,
    nodes: DashMap<String, Arc<Node>>,
    reconcile: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servicer(&self, address: &str) -> Option<Arc<Servicer>> {
        self.servicers.get(address).map(|s| s.value().clone())
    }

    pub fn servicer_by_public_key(&self, public_key: &str) -> Option<Arc<Servicer>> {
        let address = address_from_public_hex(public_key).ok()?;
        self.servicer(&address)
    }

    pub fn node(&self, url: &str) -> Option<Arc<Node>> {
        self.nodes.get(url).map(|n| n.value().clone())
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.url().cmp(b.url()));
        nodes
    }

    pub fn servicers(&self) -> Vec<Arc<Servicer>> {
        self.servicers.iter().map(|s| s.value().clone()).collect()
    }

    pub fn servicer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.servicers.iter().map(|s| s.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn servicer_count(&self) -> usize {
        self.servicers.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Bring the registry in line with `desired`. Nodes are created and
    /// resized here; stopping removed nodes and probing added ones is left
    /// to the caller.
    pub fn reconcile(&self, desired: Vec<NodeSpec>, workers: &WorkersConfig) -> ReloadDiff {
        let _guard = self.reconcile.lock();
        let mut diff = ReloadDiff::default();

        let mut wanted: BTreeMap<String, (ServicerKey, String)> = BTreeMap::new();
        let mut layout: HashMap<String, (String, Vec<String>)> = HashMap::new();
        for spec in desired {
            let addresses: Vec<String> = spec.keys.iter().map(|k| k.address().to_string()).collect();
            for key in spec.keys {
                wanted.insert(key.address().to_string(), (key, spec.url.clone()));
            }
            layout.insert(spec.url, (spec.name, addresses));
        }

        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !layout.contains_key(n.key()))
            .map(|n| n.key().clone())
            .collect();
        for url in stale {
            if let Some((_, node)) = self.nodes.remove(&url) {
                info!(node = %node.name(), url = %url, "node removed");
                diff.removed_nodes.push(node);
            }
        }

        for (url, (name, addresses)) in &layout {
            match self.node(url) {
                Some(node) => {
                    if node.name() != name {
                        warn!(node = %node.name(), requested = %name, "node rename ignored for existing url");
                    }
                    node.set_servicers(addresses.clone());
                    if node.apply_resize(workers) {
                        diff.resized_nodes.push(url.clone());
                    }
                }
                None => {
                    let node = Arc::new(Node::new(name.clone(), url.clone(), addresses.clone(), workers));
                    info!(node = %name, url = %url, servicers = addresses.len(), "node added");
                    self.nodes.insert(url.clone(), node.clone());
                    diff.added_nodes.push(node);
                }
            }
        }

        for (address, (key, url)) in wanted.iter() {
            let Some(node) = self.node(url) else {
                continue;
            };
            match self.servicer(address) {
                Some(servicer) => {
                    if servicer.node().url() != url {
                        info!(servicer = %address, from = %servicer.node().url(), to = %url, "servicer moved");
                        servicer.attach(node);
                        diff.moved_servicers.push(address.clone());
                    }
                }
                None => {
                    self.servicers
                        .insert(address.clone(), Arc::new(Servicer::new(key.clone(), node)));
                    diff.added_servicers.push(address.clone());
                }
            }
        }

        let gone: Vec<String> = self
            .servicers
            .iter()
            .filter(|s| !wanted.contains_key(s.key()))
            .map(|s| s.key().clone())
            .collect();
        for address in gone {
            self.servicers.remove(&address);
            info!(servicer = %address, "servicer removed");
            diff.removed_servicers.push(address);
        }

        diff
    }
}
