// Numan Thabit 2025
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::crypto::ServicerKey;
use crate::error::RelayError;
use crate::node::Node;
use crate::relay::{response_hash, RelayProof};
use crate::session::SessionCache;

/// A staked identity whose key this process holds.
///
/// The node back-reference is swapped in place when a reload moves the
/// servicer, so its session cache survives the move.
pub struct Servicer {
    key: ServicerKey,
    node: ArcSwap<Node>,
    sessions: SessionCache,
}

impl Servicer {
    pub fn new(key: ServicerKey, node: Arc<Node>) -> Self {
        Self {
            key,
            node: ArcSwap::new(node),
            sessions: SessionCache::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.key.address()
    }

    pub fn public_key(&self) -> &str {
        self.key.public_key_hex()
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.load_full()
    }

    pub fn attach(&self, node: Arc<Node>) {
        self.node.store(node);
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Hex signature over the response hash for `proof` and `response`.
    pub fn sign_response(&self, proof: &RelayProof, response: &str) -> Result<String, RelayError> {
        let digest = response_hash(proof, response).map_err(|err| RelayError::Signing(err.to_string()))?;
        self.key
            .sign_hex(&digest)
            .map_err(|err| RelayError::Signing(err.to_string()))
    }
}

impl std::fmt::Debug for Servicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servicer")
            .field("address", &self.address())
            .field("node", &self.node.load().url())
            .finish()
    }
}
