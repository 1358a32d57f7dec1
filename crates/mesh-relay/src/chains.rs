// Numan Thabit 2025
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::relay::is_chain_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A non-native blockchain endpoint relays can be executed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedChain {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

type ChainMap = HashMap<String, HostedChain>;

/// Hosted chains indexed by id. Readers never block; writers serialize on
/// a single lock and swap the whole map.
pub struct ChainRegistry {
    path: PathBuf,
    chains: ArcSwap<ChainMap>,
    writer: Mutex<()>,
}

impl ChainRegistry {
    /// Load from `path`. A missing file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let chains = if path.exists() {
            read_chains(&path)?
        } else {
            warn!(path = %path.display(), "hosted chains file not found; starting with no chains");
            Vec::new()
        };
        info!(chains = chains.len(), "loaded hosted chains");
        Ok(Self {
            path,
            chains: ArcSwap::from_pointee(index(chains)?),
            writer: Mutex::new(()),
        })
    }

    pub fn from_chains(path: impl Into<PathBuf>, chains: Vec<HostedChain>) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            chains: ArcSwap::from_pointee(index(chains)?),
            writer: Mutex::new(()),
        })
    }

    pub fn get(&self, id: &str) -> Option<HostedChain> {
        self.chains.load().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.chains.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.load().is_empty()
    }

    /// Chains sorted by id.
    pub fn list(&self) -> Vec<HostedChain> {
        let mut chains: Vec<HostedChain> = self.chains.load().values().cloned().collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        chains
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|c| c.id).collect()
    }

    /// Re-read the chains file. A parse failure keeps the current map.
    pub fn reload(&self) -> Result<usize> {
        let _guard = self.writer.lock();
        let chains = read_chains(&self.path)?;
        let map = index(chains)?;
        let count = map.len();
        if *self.chains.load_full() != map {
            info!(chains = count, "hosted chains changed");
        }
        self.chains.store(Arc::new(map));
        Ok(count)
    }

    /// Validate, persist, then swap in `chains`.
    pub fn replace(&self, chains: Vec<HostedChain>) -> Result<usize> {
        let _guard = self.writer.lock();
        let map = index(chains)?;
        let mut sorted: Vec<&HostedChain> = map.values().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        write_chains(&self.path, &sorted)?;
        let count = map.len();
        self.chains.store(Arc::new(map));
        info!(chains = count, path = %self.path.display(), "hosted chains replaced");
        Ok(count)
    }
}

fn read_chains(path: &Path) -> Result<Vec<HostedChain>> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read chains file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse chains file {}", path.display()))
}

fn write_chains(path: &Path, chains: &[&HostedChain]) -> Result<()> {
    let data = serde_json::to_vec_pretty(chains).context("failed to encode chains")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn index(chains: Vec<HostedChain>) -> Result<ChainMap> {
    let mut map = HashMap::with_capacity(chains.len());
    for chain in chains {
        if !is_chain_id(&chain.id) {
            bail!("hosted chain id {:?} is not a 4 character hex id", chain.id);
        }
        Url::parse(&chain.url)
            .with_context(|| format!("hosted chain {} has an invalid url", chain.id))?;
        if map.insert(chain.id.clone(), chain).is_some() {
            bail!("hosted chain ids must be unique");
        }
    }
    Ok(map)
}
