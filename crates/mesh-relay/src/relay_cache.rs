// Numan Thabit 2025
//! Durable store of relays whose notification has not reached a terminal
//! outcome. Keyed by the relay's request hash.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::relay::Relay;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("relay cache storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("relay cache entry {key} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("relay could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("relay cache is closed")]
    Closed,
}

pub struct RelayCache {
    db: sled::Db,
    path: PathBuf,
    closed: AtomicBool,
}

impl RelayCache {
    /// Open or create the store. Writes reach disk every `sync_interval`.
    pub fn open(path: impl AsRef<Path>, sync_interval: Duration) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let flush_ms = sync_interval.as_millis().max(1) as u64;
        let db = sled::Config::new()
            .path(&path)
            .flush_every_ms(Some(flush_ms))
            .open()?;
        info!(path = %path.display(), entries = db.len(), "opened relay cache");
        Ok(Self {
            db,
            path,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn put(&self, relay: &Relay) -> Result<String, CacheError> {
        self.ensure_open()?;
        let key = relay.cache_key();
        let value = serde_json::to_vec(relay).map_err(CacheError::Encode)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Result<Option<Relay>, CacheError> {
        self.ensure_open()?;
        match self.db.get(key.as_bytes())? {
            Some(value) => decode(key, &value).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.db.remove(key.as_bytes())?.is_some())
    }

    /// Remove the entry for `relay` only while it still holds this exact
    /// relay. Relays sharing a request hash overwrite each other, and the
    /// later one must stay durable when the earlier one is acknowledged.
    pub fn delete_relay(&self, relay: &Relay) -> Result<bool, CacheError> {
        self.ensure_open()?;
        let key = relay.cache_key();
        let current = serde_json::to_vec(relay).map_err(CacheError::Encode)?;
        let swapped = self
            .db
            .compare_and_swap(key.as_bytes(), Some(current), None::<&[u8]>)?;
        Ok(swapped.is_ok())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Every stored entry in key order. Undecodable entries surface as
    /// errors carrying their key so they can be dropped.
    pub fn iter(&self) -> impl Iterator<Item = Result<(String, Relay), CacheError>> + '_ {
        self.db.iter().map(|item| {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let relay = decode(&key, &value)?;
            Ok((key, relay))
        })
    }

    pub fn flush(&self) -> Result<usize, CacheError> {
        Ok(self.db.flush()?)
    }

    /// Flush and refuse further access.
    pub fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.db.flush()?;
        info!(path = %self.path.display(), bytes = flushed, "closed relay cache");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn decode(key: &str, value: &[u8]) -> Result<Relay, CacheError> {
    serde_json::from_slice(value).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}

/// Periodic flush plus on-disk size report. sled compacts its log as it
/// writes; this pass bounds how long dirty pages stay in memory.
pub fn spawn_compaction(
    cache: std::sync::Arc<RelayCache>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cache.is_closed() {
                break;
            }
            match cache.flush() {
                Ok(bytes) => debug!(bytes, entries = cache.len(), "relay cache flushed"),
                Err(err) => warn!(error = %err, "relay cache flush failed"),
            }
            if let Ok(size) = cache.db.size_on_disk() {
                debug!(size, "relay cache size on disk");
            }
        }
    })
}
