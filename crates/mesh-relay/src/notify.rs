// Numan Thabit 2025
//! Relay acknowledgement sent to the servicer after the client has its
//! response. The relay is already durable; it leaves the relay cache only
//! on a terminal outcome.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::codes::CodeSets;
use crate::node::Node;
use crate::pool::PoolError;
use crate::protocol::{NotifyResponse, RELAY_PATH, SERVICER_HEADER};
use crate::relay::Relay;
use crate::retry::{Attempt, Decision, Outcome, RetryPolicy};
use crate::runtime::Runtime;
use crate::session::NodeSession;

/// Queue a notification for `relay` on `node`'s pool.
pub fn submit(rt: &Arc<Runtime>, node: &Node, relay: Relay) -> Result<(), PoolError> {
    let rt = rt.clone();
    node.pool().submit(async move { run(rt, relay).await })
}

/// Decide whether a notification attempt is final.
pub fn classify(attempt: &Attempt, codes: &CodeSets) -> (Decision, Option<NotifyResponse>) {
    let response = match attempt {
        Err(err) if err.is_builder() => return (Decision::Fatal, None),
        Err(_) => return (Decision::Retry, None),
        Ok(response) => response,
    };
    if response.status.as_u16() > StatusCode::BAD_REQUEST.as_u16() {
        return (Decision::Retry, None);
    }
    match serde_json::from_slice::<NotifyResponse>(&response.body) {
        Err(_) => (Decision::Retry, None),
        Ok(parsed) => {
            let retry = parsed
                .error
                .as_ref()
                .map(|e| codes.is_retryable(e.code))
                .unwrap_or(false);
            let decision = if retry { Decision::Retry } else { Decision::Stop };
            (decision, Some(parsed))
        }
    }
}

async fn run(rt: Arc<Runtime>, relay: Relay) {
    let key = relay.cache_key();
    let Some(servicer) = rt.registry().servicer_by_public_key(&relay.proof.servicer_pub_key) else {
        info!(relay = %key, "servicer no longer loaded; dropping relay");
        rt.release_relay(&relay);
        return;
    };
    let node = servicer.node();
    let fingerprint = relay.session_header().fingerprint();
    let session = servicer.sessions().get(&fingerprint);

    if let Some(session) = &session {
        let state = session.snapshot();
        if state.validated && !state.is_valid {
            debug!(relay = %key, "session invalid; dropping relay");
            rt.metrics().record_notification(node.name(), "session_invalid");
            rt.release_relay(&relay);
            return;
        }
        if !state.validated {
            requeue(rt.clone(), node, relay);
            return;
        }
    }

    let url = format!("{}{}", node.url(), RELAY_PATH);
    let client = rt.clients().notify.clone();
    let token = rt.servicer_token().value.clone();
    let address = servicer.address().to_string();
    let codes = rt.codes().clone();
    let policy = RetryPolicy::from(&rt.config().retry);
    let cancel = node.pool().cancellation();

    let mut last: Option<NotifyResponse> = None;
    let outcome = policy
        .run(
            &client,
            &cancel,
            || {
                client
                    .post(&url)
                    .query(&[
                        ("authtoken", token.as_str()),
                        ("chain", relay.proof.blockchain.as_str()),
                        ("app", relay.proof.aat.app_pub_key.as_str()),
                    ])
                    .header(SERVICER_HEADER, address.as_str())
                    .json(&relay)
            },
            |attempt| {
                let (decision, parsed) = classify(attempt, &codes);
                if let Some(dispatch) = parsed.as_ref().and_then(|p| p.dispatch.as_ref()) {
                    node.observe_height(dispatch.block_height);
                }
                last = parsed;
                decision
            },
        )
        .await;

    let label = match outcome {
        Outcome::Cancelled => {
            debug!(relay = %key, "notification cancelled; relay stays cached");
            rt.metrics().record_notification(node.name(), "cancelled");
            return;
        }
        Outcome::Stopped(_) => settle(&rt, &key, session.as_deref(), last),
        Outcome::Exhausted(attempt) => {
            warn!(
                relay = %key,
                node = %node.name(),
                error = %describe(&attempt),
                "notification retries exhausted; dropping relay"
            );
            "exhausted"
        }
        Outcome::Fatal(attempt) => {
            warn!(relay = %key, error = %describe(&attempt), "notification failed");
            "failed"
        }
    };
    rt.metrics().record_notification(node.name(), label);
    rt.release_relay(&relay);
}

/// Apply a terminal servicer answer to the session and return the metric label.
fn settle(
    rt: &Runtime,
    key: &str,
    session: Option<&NodeSession>,
    response: Option<NotifyResponse>,
) -> &'static str {
    let Some(response) = response else {
        return "failed";
    };
    match response.error {
        None if response.success => {
            if let Some(session) = session {
                if session.record_relay() == 0 {
                    info!(session = %session.header().fingerprint(), "session relay budget exhausted");
                }
            }
            "delivered"
        }
        Some(error) if rt.codes().invalidates_session(error.code) => {
            info!(relay = %key, code = error.code, message = %error.message, "servicer invalidated session");
            if let Some(session) = session {
                session.invalidate(error);
            }
            "invalidated"
        }
        Some(error) => {
            debug!(relay = %key, code = error.code, message = %error.message, "servicer rejected relay");
            "rejected"
        }
        None => "rejected",
    }
}

fn describe(attempt: &Attempt) -> String {
    match attempt {
        Ok(response) => format!("status {}: {}", response.status, response.text()),
        Err(err) => err.to_string(),
    }
}

/// Put the task back once the session may have been validated.
fn requeue(rt: Arc<Runtime>, node: Arc<Node>, relay: Relay) {
    let delay = rt.config().intervals.notify_requeue_delay;
    let cancel = node.pool().cancellation();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let key = relay.cache_key();
        if let Err(err) = submit(&rt, &node, relay) {
            debug!(relay = %key, error = %err, "could not requeue notification; relay stays cached");
        }
    });
}
