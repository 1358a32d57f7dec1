// Numan Thabit 2025
//! Client relay pipeline: validate, execute against the hosted chain, sign,
//! persist, then queue the servicer notification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::chains::HostedChain;
use crate::codes::SERVICER_CODESPACE;
use crate::error::{ClientErrorBody, RelayError, ServicerError};
use crate::node::Node;
use crate::notify;
use crate::protocol::Dispatch;
use crate::relay::{is_session_start, Payload, Relay, RelayResponse};
use crate::runtime::Runtime;
use crate::servicer::Servicer;
use crate::session::{self, classify_lookahead, Lookahead, NodeSession};

/// A refused relay plus whatever session view the servicer gave us.
#[derive(Debug)]
pub struct Rejection {
    pub error: RelayError,
    pub dispatch: Option<Dispatch>,
}

impl Rejection {
    pub fn to_body(&self) -> ClientErrorBody {
        self.error.to_body(self.dispatch.clone())
    }
}

impl From<RelayError> for Rejection {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            dispatch: None,
        }
    }
}

/// Body of `/v1/client/sim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimRelay {
    pub relay_network_id: String,
    pub payload: Payload,
}

pub async fn handle_relay(rt: &Arc<Runtime>, relay: Relay) -> Result<RelayResponse, Rejection> {
    let chain_id = relay.proof.blockchain.clone();
    let result = serve(rt, relay).await;
    if let Err(rejection) = &result {
        rt.metrics()
            .record_relay(&chain_id, rejection.error.kind().as_str(), None);
    }
    result
}

async fn serve(rt: &Arc<Runtime>, relay: Relay) -> Result<RelayResponse, Rejection> {
    let started = Instant::now();
    relay.validate_shape()?;

    let servicer = rt
        .registry()
        .servicer_by_public_key(&relay.proof.servicer_pub_key)
        .ok_or_else(|| RelayError::UnknownServicer(relay.proof.servicer_pub_key.clone()))?;
    let node = servicer.node();
    node.ensure_healthy()?;
    let bps = node.blocks_per_session();
    if bps > 0 && !is_session_start(relay.proof.session_block_height, bps) {
        return Err(RelayError::malformed(format!(
            "session height {} is not a session start",
            relay.proof.session_block_height
        ))
        .into());
    }

    let dispatch = admit(rt, &servicer, &node, &relay).await?;
    let reject = |error: RelayError| Rejection {
        error,
        dispatch: dispatch.clone(),
    };

    let chain = rt
        .chains()
        .get(&relay.proof.blockchain)
        .ok_or_else(|| reject(RelayError::ChainNotHosted(relay.proof.blockchain.clone())))?;
    let body = execute(rt, &chain, &relay.payload).await.map_err(reject)?;
    let latency = started.elapsed();
    let body = if rt.config().json_sort_relay_responses {
        sort_json(body)
    } else {
        body
    };

    let signature = servicer.sign_response(&relay.proof, &body).map_err(reject)?;
    let response = RelayResponse {
        signature,
        response: body,
        proof: Some(relay.proof.clone()),
    };

    let key = rt
        .cache()
        .put(&relay)
        .map_err(|err| reject(RelayError::internal(format!("failed to persist relay: {err}"))))?;
    let chain_id = relay.proof.blockchain.clone();
    if let Err(err) = notify::submit(rt, &node, relay) {
        warn!(relay = %key, node = %node.name(), error = %err, "notification not queued; relay stays cached");
    }
    record_success(rt, &node, chain_id, latency);
    debug!(relay = %key, servicer = %servicer.address(), "relay served");
    Ok(response)
}

/// Counted off the request path; falls back to inline when the pool is full.
fn record_success(rt: &Runtime, node: &Node, chain: String, latency: Duration) {
    let metrics = rt.metrics().clone();
    let inline = metrics.clone();
    let label = chain.clone();
    let queued = node
        .metrics_pool()
        .submit(async move { metrics.record_relay(&label, "success", Some(latency)) });
    if queued.is_err() {
        inline.record_relay(&chain, "success", Some(latency));
    }
}

/// Resolve the relay's session, fetching it from the servicer on first use.
async fn admit(
    rt: &Arc<Runtime>,
    servicer: &Arc<Servicer>,
    node: &Arc<Node>,
    relay: &Relay,
) -> Result<Option<Dispatch>, Rejection> {
    let header = relay.session_header();
    let sessions = servicer.sessions();

    let existing = sessions.get(&header.fingerprint());
    if let Some(session) = &existing {
        let state = session.snapshot();
        if state.validated {
            return settled(&state);
        }
    }

    let lookahead = classify_lookahead(
        relay.proof.session_block_height,
        node.height(),
        node.blocks_per_session(),
        rt.config().optimistic_max_sessions_ahead,
    );
    match lookahead {
        Lookahead::OutOfSync | Lookahead::Suspicious => {
            let suspicious = lookahead == Lookahead::Suspicious;
            if suspicious {
                warn!(
                    servicer = %servicer.address(),
                    relay_height = relay.proof.session_block_height,
                    node_height = node.height(),
                    "relay session is implausibly far ahead"
                );
            }
            return Err(RelayError::OutOfSync {
                relay_height: relay.proof.session_block_height,
                node_height: node.height(),
                suspicious,
            }
            .into());
        }
        Lookahead::Current | Lookahead::NextSession => {}
    }

    let (session, created) = match existing {
        Some(session) => (session, false),
        None => sessions.get_or_insert(&header),
    };
    if created {
        schedule_validation(rt, servicer.clone(), node.clone(), relay.clone(), session.clone());
    }

    if lookahead == Lookahead::NextSession && !session.is_validated() {
        debug!(servicer = %servicer.address(), height = relay.proof.session_block_height, "serving relay on optimistic session");
        return Ok(None);
    }

    let state = session
        .wait_settled(rt.clients().servicer.timeout())
        .await;
    if let Some(reason) = state.fetch_error {
        return Err(RelayError::NodeUnhealthy {
            node: node.name().to_string(),
            reason,
        }
        .into());
    }
    if !state.validated {
        return Err(RelayError::SessionPending {
            servicer: servicer.address().to_string(),
        }
        .into());
    }
    settled(&state)
}

fn settled(state: &session::SessionState) -> Result<Option<Dispatch>, Rejection> {
    if !state.is_valid {
        let error = state.error.clone().unwrap_or_else(|| ServicerError {
            code: 0,
            codespace: SERVICER_CODESPACE.to_string(),
            message: "session rejected by servicer".to_string(),
        });
        return Err(Rejection {
            error: RelayError::SessionInvalid(error),
            dispatch: state.dispatch.clone(),
        });
    }
    if state.remaining_relays == 0 {
        return Err(Rejection {
            error: RelayError::SessionExhausted,
            dispatch: state.dispatch.clone(),
        });
    }
    Ok(state.dispatch.clone())
}

fn schedule_validation(
    rt: &Arc<Runtime>,
    servicer: Arc<Servicer>,
    node: Arc<Node>,
    relay: Relay,
    session: Arc<NodeSession>,
) {
    let deadline = tokio::time::Instant::now() + rt.config().intervals.session_cache_clean_up;
    submit_validation(rt.clone(), servicer, node, relay, session, deadline);
}

fn submit_validation(
    rt: Arc<Runtime>,
    servicer: Arc<Servicer>,
    node: Arc<Node>,
    relay: Relay,
    session: Arc<NodeSession>,
    deadline: tokio::time::Instant,
) {
    let pool = node.pool().clone();
    let fallback = (servicer.clone(), session.clone());
    let submitted = pool.submit(validate(rt, servicer, node, relay, session, deadline));
    if let Err(err) = submitted {
        let (servicer, session) = fallback;
        session.abandon(err.to_string());
        servicer
            .sessions()
            .remove_entry(&session.header().fingerprint(), &session);
    }
}

/// Fetch the session from the servicer. Sessions ahead of the node wait
/// for it to catch up first.
async fn validate(
    rt: Arc<Runtime>,
    servicer: Arc<Servicer>,
    node: Arc<Node>,
    relay: Relay,
    session: Arc<NodeSession>,
    deadline: tokio::time::Instant,
) {
    let fingerprint = session.header().fingerprint();
    let ahead = node.blocks_per_session() > 0
        && relay.proof.session_block_height > node.session_height();
    if ahead {
        if tokio::time::Instant::now() >= deadline {
            session.abandon("node never reached the session height");
            servicer.sessions().remove_entry(&fingerprint, &session);
            rt.metrics().record_session_validation(node.name(), "expired");
            return;
        }
        let delay = rt.config().intervals.notify_requeue_delay;
        let cancel = node.pool().cancellation();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            submit_validation(rt, servicer, node, relay, session, deadline);
        });
        return;
    }

    let token = rt.servicer_token().value.clone();
    match session::fetch(&rt.clients().servicer, node.url(), &token, &relay).await {
        Ok(response) => {
            if let Some(dispatch) = &response.dispatch {
                node.observe_height(dispatch.block_height);
            }
            let outcome = if response.success { "valid" } else { "invalid" };
            debug!(servicer = %servicer.address(), session = %fingerprint, outcome, "session validated");
            rt.metrics().record_session_validation(node.name(), outcome);
            session.apply_response(response);
        }
        Err(err) => {
            warn!(servicer = %servicer.address(), node = %node.name(), error = %err, "session fetch failed");
            rt.metrics().record_session_validation(node.name(), "failed");
            session.abandon(err.to_string());
            servicer.sessions().remove_entry(&fingerprint, &session);
        }
    }
}

/// Run `payload` against `chain`. Responses with status 500 and above
/// count as failures; anything else is handed back to the client.
pub async fn execute(rt: &Runtime, chain: &HostedChain, payload: &Payload) -> Result<String, RelayError> {
    let url = chain_url(&chain.url, &payload.path);
    let method = if payload.method.is_empty() {
        Method::POST
    } else {
        Method::from_bytes(payload.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RelayError::malformed(format!("unsupported method {:?}", payload.method)))?
    };
    let client = &rt.clients().chain;
    let mut request = client.request(method, &url);
    if !payload.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        request = request.header(CONTENT_TYPE, "application/json");
    }
    for (name, value) in &payload.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(auth) = &chain.basic_auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    if !payload.data.is_empty() {
        request = request.body(payload.data.clone());
    }

    let response = client
        .send(request)
        .await
        .map_err(|err| RelayError::ChainCallFailure {
            status: err.status().map(|s| s.as_u16()),
            message: format!("chain {} call failed: {err}", chain.id),
        })?;
    if response.status.is_server_error() {
        return Err(RelayError::ChainCallFailure {
            status: Some(response.status.as_u16()),
            message: format!("chain {} answered status {}", chain.id, response.status),
        });
    }
    Ok(response.text())
}

/// Execute a payload without a relay proof, for reachability checks.
pub async fn simulate(rt: &Runtime, sim: SimRelay) -> Result<String, RelayError> {
    if sim.payload.is_empty() {
        return Err(RelayError::malformed("relay payload is empty"));
    }
    let chain = rt
        .chains()
        .get(&sim.relay_network_id)
        .ok_or_else(|| RelayError::ChainNotHosted(sim.relay_network_id.clone()))?;
    execute(rt, &chain, &sim.payload).await
}

fn chain_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Re-serialize JSON with object keys sorted; other bodies pass through.
fn sort_json(body: String) -> String {
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => serde_json::to_string(&sorted(value)).unwrap_or(body),
        Err(_) => body,
    }
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
