// Numan Thabit 2025
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mesh_relay::{
    config::MeshConfig,
    crypto::ServicerKey,
    health,
    metrics::MeshMetrics,
    relay::{request_hash, Aat, Payload, Relay, RelayMeta, RelayProof},
    runtime::Runtime,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const APP_PUB_KEY: &str = "a6b1e52b3d5c1b6ad08eb9b6c0c1ef3ae1d1b6a2d3f4e5c6b7a8d9e0f1a2b3c4";
pub const CLIENT_PUB_KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";
pub const BLOCKS_PER_SESSION: u64 = 4;
/// Node height used by the mocked `check`; also a session start.
pub const NODE_HEIGHT: u64 = 101;

pub fn seed(n: u8) -> String {
    hex::encode([n; 32])
}

pub fn key(n: u8) -> ServicerKey {
    ServicerKey::from_hex(&seed(n)).expect("valid seed")
}

/// Write `servicers.json` in the node schema.
pub fn write_keys(dir: &Path, nodes: &[(String, Vec<u8>)]) -> Result<()> {
    let entries: Vec<_> = nodes
        .iter()
        .map(|(url, keys)| {
            json!({
                "url": url,
                "keys": keys.iter().map(|n| seed(*n)).collect::<Vec<_>>(),
            })
        })
        .collect();
    std::fs::write(dir.join("servicers.json"), serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}

pub fn write_chains(dir: &Path, chains: &[(&str, String)]) -> Result<()> {
    let entries: Vec<_> = chains
        .iter()
        .map(|(id, url)| json!({ "id": id, "url": url }))
        .collect();
    std::fs::write(dir.join("chains.json"), serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}

pub fn write_servicer_token(dir: &Path) -> Result<()> {
    std::fs::write(
        dir.join("servicer-auth-token.json"),
        r#"{"value":"servicer-secret","issued":"2025-01-01T00:00:00Z"}"#,
    )?;
    Ok(())
}

pub fn config(dir: &Path) -> MeshConfig {
    let mut config = MeshConfig {
        data_dir: dir.to_path_buf(),
        ..MeshConfig::default()
    };
    config.retry.max_times = 3;
    config.retry.wait_min = Duration::from_millis(5);
    config.retry.wait_max = Duration::from_millis(50);
    config.intervals.notify_requeue_delay = Duration::from_millis(20);
    config.clients.servicer.timeout = Duration::from_secs(2);
    config.clients.notify.timeout = Duration::from_secs(2);
    config.clients.chain.timeout = Duration::from_secs(2);
    config
}

/// Answer the three connectivity probes and the periodic check.
pub async fn mount_servicer_basics(node: &MockServer) {
    Mock::given(method("POST"))
        .and(query_param("verify", "true"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .mount(node)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "status": { "Height": NODE_HEIGHT, "IsStarting": false, "IsCatchingUp": false },
            "blocks_per_session": BLOCKS_PER_SESSION,
            "wrong_servicers": [],
            "wrong_chains": [],
        })))
        .mount(node)
        .await;
}

pub async fn mount_session(node: &MockServer, body: serde_json::Value, times: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(node)
        .await;
}

pub fn valid_session(remaining: u64) -> serde_json::Value {
    json!({
        "success": true,
        "dispatch": { "block_height": NODE_HEIGHT },
        "remaining_relays": remaining,
    })
}

pub fn relay(servicer: &ServicerKey, chain: &str, session_height: u64, data: &str) -> Relay {
    let payload = Payload {
        data: data.to_string(),
        method: "POST".to_string(),
        ..Payload::default()
    };
    let meta = RelayMeta {
        block_height: session_height,
    };
    let request_hash = request_hash(&payload, &meta);
    Relay {
        payload,
        meta,
        proof: RelayProof {
            entropy: 42,
            session_block_height: session_height,
            servicer_pub_key: servicer.public_key_hex().to_string(),
            blockchain: chain.to_string(),
            aat: Aat {
                version: "0.0.1".to_string(),
                app_pub_key: APP_PUB_KEY.to_string(),
                client_pub_key: CLIENT_PUB_KEY.to_string(),
                signature: "00".repeat(64),
            },
            signature: "11".repeat(64),
            request_hash,
        },
    }
}

/// Data directory with tokens in place and a started runtime whose nodes
/// have completed one health check.
pub struct Harness {
    pub dir: TempDir,
    pub rt: Arc<Runtime>,
}

impl Harness {
    pub async fn start(nodes: &[(String, Vec<u8>)], chains: &[(&str, String)]) -> Result<Self> {
        Self::start_with(nodes, chains, |_| {}).await
    }

    pub async fn start_with(
        nodes: &[(String, Vec<u8>)],
        chains: &[(&str, String)],
        tweak: impl FnOnce(&mut MeshConfig),
    ) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        write_keys(dir.path(), nodes)?;
        write_chains(dir.path(), chains)?;
        write_servicer_token(dir.path())?;
        let mut config = config(dir.path());
        tweak(&mut config);
        let rt = Runtime::start(config, MeshMetrics::new()).await?;
        for node in rt.registry().nodes() {
            health::check_node(&rt, &node).await?;
        }
        Ok(Self { dir, rt })
    }

    pub async fn close(self) {
        self.rt.close().await;
    }
}

/// Notifications `node` has received so far.
pub async fn notifications(node: &MockServer) -> usize {
    node.received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/v1/private/mesh/relay")
        .filter(|r| !r.url.query().is_some_and(|q| q.contains("verify=true")))
        .count()
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
