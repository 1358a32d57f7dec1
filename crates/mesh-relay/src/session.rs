// Numan Thabit 2025
//! Per-servicer session cache.
//!
//! A session entry is created unvalidated by the first relay that names it
//! and flipped to validated by a background fetch against the servicer.
//! Relays arriving meanwhile wait on the entry's change channel, unless the
//! node is exactly one session behind, in which case they are served
//! optimistically and the entry is validated once the node catches up.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clients::HttpClient;
use crate::error::ServicerError;
use crate::protocol::{Dispatch, SessionRequest, SessionResponse, SESSION_PATH};
use crate::relay::{session_height, Relay, SessionHeader};

/// Relay budget of a session that has not been validated yet.
pub const UNBOUNDED_RELAYS: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub validated: bool,
    pub is_valid: bool,
    pub error: Option<ServicerError>,
    pub remaining_relays: u64,
    pub dispatch: Option<Dispatch>,
    /// Set when the validation fetch could not reach the servicer.
    pub fetch_error: Option<String>,
}

impl SessionState {
    fn pending() -> Self {
        Self {
            validated: false,
            is_valid: true,
            error: None,
            remaining_relays: UNBOUNDED_RELAYS,
            dispatch: None,
            fetch_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.validated && self.is_valid && self.remaining_relays == 0
    }

    /// Validated entries and abandoned fetches both end a wait.
    fn is_settled(&self) -> bool {
        self.validated || self.fetch_error.is_some()
    }
}

/// Session state for one (application, chain, height) as seen by one servicer.
#[derive(Debug)]
pub struct NodeSession {
    header: SessionHeader,
    state: Mutex<SessionState>,
    version: watch::Sender<u64>,
}

impl NodeSession {
    pub fn pending(header: SessionHeader) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            header,
            state: Mutex::new(SessionState::pending()),
            version,
        }
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn session_height(&self) -> u64 {
        self.header.session_height
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_validated(&self) -> bool {
        self.state.lock().validated
    }

    fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        apply(&mut self.state.lock());
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Record the servicer's answer to a session fetch.
    pub fn apply_response(&self, response: SessionResponse) {
        self.update(|state| {
            state.validated = true;
            state.fetch_error = None;
            if response.success {
                state.is_valid = true;
                state.error = None;
                state.remaining_relays = response.remaining_relays;
                state.dispatch = response.dispatch;
            } else {
                state.is_valid = false;
                state.error = response.error;
                state.dispatch = response.dispatch;
            }
        });
    }

    pub fn invalidate(&self, error: ServicerError) {
        self.update(|state| {
            state.validated = true;
            state.is_valid = false;
            state.error = Some(error);
        });
    }

    /// Wake waiters with a fetch failure; the entry should be dropped after.
    pub fn abandon(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(|state| state.fetch_error = Some(reason));
    }

    /// Count one acknowledged relay. Returns the remaining budget.
    pub fn record_relay(&self) -> u64 {
        let mut state = self.state.lock();
        if state.remaining_relays != UNBOUNDED_RELAYS {
            state.remaining_relays = state.remaining_relays.saturating_sub(1);
        }
        state.remaining_relays
    }

    /// Wait until the entry is validated or abandoned, at most `limit`.
    pub async fn wait_settled(&self, limit: Duration) -> SessionState {
        let mut changes = self.version.subscribe();
        let wait = async {
            loop {
                {
                    let state = self.state.lock();
                    if state.is_settled() {
                        return state.clone();
                    }
                }
                if changes.changed().await.is_err() {
                    return self.snapshot();
                }
            }
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(state) => state,
            Err(_) => self.snapshot(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionCache {
    entries: DashMap<String, Arc<NodeSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<NodeSession>> {
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }

    /// Returns the entry and whether this call created it.
    pub fn get_or_insert(&self, header: &SessionHeader) -> (Arc<NodeSession>, bool) {
        match self.entries.entry(header.fingerprint()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Arc::new(NodeSession::pending(header.clone()));
                entry.insert(session.clone());
                (session, true)
            }
        }
    }

    /// Remove `fingerprint` only if it still maps to `session`.
    pub fn remove_entry(&self, fingerprint: &str, session: &Arc<NodeSession>) -> bool {
        self.entries
            .remove_if(fingerprint, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop sessions more than `keep_sessions` sessions behind the node.
    pub fn evict_stale(&self, node_height: u64, blocks_per_session: u64, keep_sessions: u64) -> usize {
        if blocks_per_session == 0 || node_height == 0 {
            return 0;
        }
        let current = session_height(node_height, blocks_per_session);
        let floor = current.saturating_sub(keep_sessions.saturating_mul(blocks_per_session));
        let before = self.entries.len();
        self.entries.retain(|_, session| session.session_height() >= floor);
        before.saturating_sub(self.entries.len())
    }
}

/// Where a relay's session sits relative to the node's current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookahead {
    /// At or behind the node's session; the servicer decides.
    Current,
    /// Exactly one session ahead; may be served optimistically.
    NextSession,
    OutOfSync,
    /// Further ahead than any honest client could be.
    Suspicious,
}

pub fn classify_lookahead(
    relay_session_height: u64,
    node_height: u64,
    blocks_per_session: u64,
    max_sessions_ahead: u64,
) -> Lookahead {
    if blocks_per_session == 0 || node_height == 0 {
        return Lookahead::Current;
    }
    let node_session = session_height(node_height, blocks_per_session);
    if relay_session_height <= node_session {
        return Lookahead::Current;
    }
    let horizon = node_session
        .saturating_add(blocks_per_session.saturating_mul(max_sessions_ahead));
    if relay_session_height > horizon {
        Lookahead::Suspicious
    } else if relay_session_height == node_session + blocks_per_session {
        Lookahead::NextSession
    } else {
        Lookahead::OutOfSync
    }
}

/// True when a relay for an unvalidated session may be served before the
/// servicer confirms it.
pub fn should_assume(relay_session_height: u64, node_height: u64, blocks_per_session: u64) -> bool {
    classify_lookahead(relay_session_height, node_height, blocks_per_session, u64::MAX)
        == Lookahead::NextSession
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("session fetch failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("session fetch returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Ask the node for the authoritative session view. Structured servicer
/// errors come back as `Ok` with `success == false`.
pub async fn fetch(
    client: &HttpClient,
    node_url: &str,
    auth_token: &str,
    relay: &Relay,
) -> Result<SessionResponse, FetchError> {
    let request = SessionRequest {
        session_header: relay.session_header(),
        meta: relay.meta,
        servicer_pub_key: relay.proof.servicer_pub_key.clone(),
        blockchain: relay.proof.blockchain.clone(),
        session_block_height: relay.proof.session_block_height,
    };
    let url = format!("{node_url}{SESSION_PATH}");
    let response = client
        .send(
            client
                .post(&url)
                .query(&[("authtoken", auth_token)])
                .json(&request),
        )
        .await?;
    match serde_json::from_slice::<SessionResponse>(&response.body) {
        Ok(parsed) if parsed.success || parsed.error.is_some() => Ok(parsed),
        _ => Err(FetchError::Status {
            status: response.status.as_u16(),
            body: response.text(),
        }),
    }
}
