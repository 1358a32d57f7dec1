// Numan Thabit 2025
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clients::HttpClient;
use crate::node::Node;
use crate::protocol::{CheckRequest, CheckResponse, CHECK_PATH, PROBE_PATHS};
use crate::runtime::Runtime;

/// Hit the three private endpoints with `?verify=true`.
pub async fn probe_node(client: &HttpClient, node: &Node) -> Result<()> {
    let probes = PROBE_PATHS.iter().map(|path| async move {
        let url = format!("{}{}", node.url(), path);
        let response = client
            .send(client.post(&url).query(&[("verify", "true")]))
            .await
            .with_context(|| format!("{url} is unreachable"))?;
        if !response.is_success() {
            bail!("{url} answered status {}", response.status);
        }
        Ok(())
    });
    for result in join_all(probes).await {
        result.with_context(|| format!("connectivity probe for node {} failed", node.name()))?;
    }
    Ok(())
}

/// Probe every node concurrently. Any failure is returned.
pub async fn probe_nodes(client: &HttpClient, nodes: &[Arc<Node>]) -> Result<()> {
    let results = join_all(nodes.iter().map(|node| async move {
        let result = probe_node(client, node).await;
        if result.is_ok() {
            node.mark_probed();
            info!(node = %node.name(), url = %node.url(), "node reachable");
        }
        result
    }))
    .await;
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err().map(|e| format!("{e:#}")))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(failures.join("; ")))
    }
}

/// One `check` round trip. Updates the node's status and session length.
pub async fn check_node(rt: &Runtime, node: &Node) -> Result<CheckResponse> {
    let url = format!("{}{}", node.url(), CHECK_PATH);
    let request = CheckRequest {
        servicers: node.servicer_addresses(),
        chains: rt.chains().ids(),
    };
    let client = &rt.clients().servicer;
    let response = client
        .send(
            client
                .post(&url)
                .query(&[("authtoken", rt.servicer_token().value.as_str())])
                .json(&request),
        )
        .await
        .with_context(|| format!("check against {} failed", node.name()))?;
    let parsed: CheckResponse = serde_json::from_slice(&response.body).with_context(|| {
        format!(
            "check against {} returned status {} with an unreadable body",
            node.name(),
            response.status
        )
    })?;
    if let Some(err) = &parsed.error {
        bail!("check against {} rejected: {err}", node.name());
    }

    if let Some(status) = parsed.status {
        node.set_status(status);
    }
    node.set_blocks_per_session(parsed.blocks_per_session);
    if !parsed.wrong_servicers.is_empty() {
        warn!(node = %node.name(), servicers = ?parsed.wrong_servicers, "servicer does not recognise these addresses");
    }
    if !parsed.wrong_chains.is_empty() {
        warn!(node = %node.name(), chains = ?parsed.wrong_chains, "servicer does not host these chains");
    }
    Ok(parsed)
}

/// Periodic `check` for one node; stops when the node's cron is cancelled.
pub fn spawn_node_cron(rt: Arc<Runtime>, node: Arc<Node>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = node.cron().clone();
        let mut ticker = interval_at(Instant::now(), every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match check_node(&rt, &node).await {
                Ok(_) => debug!(node = %node.name(), height = node.height(), "node check"),
                Err(err) => {
                    warn!(node = %node.name(), error = %format!("{err:#}"), "node check failed; marking degraded");
                    node.mark_degraded();
                }
            }
            rt.metrics().observe_node(&node);
        }
        debug!(node = %node.name(), "node cron stopped");
    })
}

/// Evict sessions that fell behind their node.
pub fn spawn_session_cleanup(rt: Arc<Runtime>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = rt.background_token();
        let keep = rt.config().session_cache_keep_sessions;
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut evicted = 0;
            for servicer in rt.registry().servicers() {
                let node = servicer.node();
                evicted += servicer.sessions().evict_stale(
                    node.height(),
                    node.blocks_per_session(),
                    keep,
                );
            }
            if evicted > 0 {
                info!(evicted, "evicted stale sessions");
            }
            rt.metrics().set_relay_cache_entries(rt.cache().len());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, WorkersConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(
            "servicer",
            &ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            },
            "tester",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn probe_passes_when_all_endpoints_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("verify", "true"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;
        let node = Arc::new(Node::new("n1", server.uri(), vec!["a".into()], &WorkersConfig::default()));
        probe_nodes(&client(), &[node.clone()]).await.unwrap();
        assert!(node.is_probed());
    }

    #[tokio::test]
    async fn probe_fails_when_one_endpoint_is_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/private/mesh/relay"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/private/mesh/session"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let node = Arc::new(Node::new("n1", server.uri(), vec!["a".into()], &WorkersConfig::default()));
        let err = probe_nodes(&client(), &[node.clone()]).await.unwrap_err();
        assert!(err.to_string().contains("/v1/private/mesh/check"));
        assert!(!node.is_probed());
    }
}
