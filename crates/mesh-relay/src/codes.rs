// Numan Thabit 2025
//! Numeric result codes reported by servicer nodes.
//!
//! The dispatcher treats codes as opaque; it only needs set membership to
//! decide whether a notification is retried, and whether the session it
//! belongs to can still be trusted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Codespace used by the servicer's relay protocol.
pub const SERVICER_CODESPACE: &str = "pocketcore";
/// Codespace for errors raised by the dispatcher itself.
pub const MESH_CODESPACE: &str = "mesh";

pub const CODE_APP_NOT_FOUND: u32 = 45;
pub const CODE_INVALID_BLOCK_HEIGHT: u32 = 60;
pub const CODE_OVER_SERVICE: u32 = 71;
pub const CODE_REQUEST_HASH: u32 = 74;
pub const CODE_OUT_OF_SYNC_REQUEST: u32 = 75;
pub const CODE_EVIDENCE_SEALED: u32 = 90;

/// Servicer still booting; the notification can be replayed later.
pub const CODE_NODE_STARTING: u32 = 1001;
/// Servicer is catching up with the chain.
pub const CODE_NODE_CATCHING_UP: u32 = 1002;
/// Servicer has not loaded the addressed key yet.
pub const CODE_SERVICER_NOT_LOADED: u32 = 1003;

pub const DEFAULT_SESSION_INVALIDATING: [u32; 6] = [
    CODE_REQUEST_HASH,
    CODE_APP_NOT_FOUND,
    CODE_EVIDENCE_SEALED,
    CODE_OVER_SERVICE,
    CODE_OUT_OF_SYNC_REQUEST,
    CODE_INVALID_BLOCK_HEIGHT,
];

pub const DEFAULT_RETRYABLE: [u32; 3] = [
    CODE_NODE_STARTING,
    CODE_NODE_CATCHING_UP,
    CODE_SERVICER_NOT_LOADED,
];

// Codes emitted in the mesh codespace for client-facing errors.
pub const MESH_MALFORMED_RELAY: u32 = 1;
pub const MESH_UNKNOWN_SERVICER: u32 = 2;
pub const MESH_NODE_UNHEALTHY: u32 = 3;
pub const MESH_SESSION_PENDING: u32 = 4;
pub const MESH_CHAIN_NOT_HOSTED: u32 = 5;
pub const MESH_CHAIN_CALL_FAILURE: u32 = 6;
pub const MESH_SIGNING_FAILURE: u32 = 7;
pub const MESH_OUT_OF_SYNC: u32 = 8;
pub const MESH_SESSION_EXHAUSTED: u32 = 9;
pub const MESH_INTERNAL: u32 = 10;

/// Membership tests for the two code families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSets {
    retryable: HashSet<u32>,
    session_invalidating: HashSet<u32>,
}

impl Default for CodeSets {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE, DEFAULT_SESSION_INVALIDATING)
    }
}

impl CodeSets {
    pub fn new<R, I>(retryable: R, session_invalidating: I) -> Self
    where
        R: IntoIterator<Item = u32>,
        I: IntoIterator<Item = u32>,
    {
        Self {
            retryable: retryable.into_iter().collect(),
            session_invalidating: session_invalidating.into_iter().collect(),
        }
    }

    pub fn is_retryable(&self, code: u32) -> bool {
        self.retryable.contains(&code)
    }

    pub fn invalidates_session(&self, code: u32) -> bool {
        self.session_invalidating.contains(&code)
    }
}
