// Numan Thabit 2025
mod common;

use std::time::Duration;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use mesh_relay::{
    codes,
    crypto::verify_hex,
    dispatcher,
    error::{ClientErrorBody, ErrorKind, RelayError},
    http,
    relay::response_hash,
};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_is_served_signed_and_acknowledged() -> Result<()> {
    let node = MockServer::start().await;
    let chain = MockServer::start().await;
    mount_servicer_basics(&node).await;
    mount_session(&node, valid_session(50), 1).await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("bar"))
        .expect(1)
        .mount(&chain)
        .await;

    let servicer = key(1);
    let relay = relay(&servicer, "0001", NODE_HEIGHT, r#"{"method":"eth_blockNumber"}"#);
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/relay"))
        .and(query_param("chain", "0001"))
        .and(query_param("app", APP_PUB_KEY))
        .and(query_param("authtoken", "servicer-secret"))
        .and(header("X-Servicer", servicer.address()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "dispatch": { "block_height": NODE_HEIGHT },
        })))
        .expect(1)
        .mount(&node)
        .await;

    let harness = Harness::start(&[(node.uri(), vec![1])], &[("0001", chain.uri())]).await?;
    let rt = harness.rt.clone();

    let response = http::router(rt.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/client/relay")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&relay)?))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
    assert_eq!(body["response"], "bar");
    let signature = body["signature"].as_str().unwrap_or_default();
    assert!(verify_hex(
        servicer.public_key_hex(),
        &response_hash(&relay.proof, "bar")?,
        signature
    )?);

    let key = relay.cache_key();
    assert!(
        eventually(Duration::from_secs(5), || !rt.cache().contains(&key).unwrap_or(true)).await,
        "relay should leave the cache once acknowledged"
    );
    let session = rt
        .registry()
        .servicer(servicer.address())
        .and_then(|s| s.sessions().get(&relay.session_header().fingerprint()))
        .expect("session cached");
    assert_eq!(session.snapshot().remaining_relays, 49);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_servicer_is_refused_before_any_chain_call() -> Result<()> {
    let node = MockServer::start().await;
    let chain = MockServer::start().await;
    mount_servicer_basics(&node).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("bar"))
        .expect(0)
        .mount(&chain)
        .await;

    let harness = Harness::start(&[(node.uri(), vec![1])], &[("0001", chain.uri())]).await?;
    let stranger = key(9);
    let rejection = dispatcher::handle_relay(&harness.rt, relay(&stranger, "0001", NODE_HEIGHT, "x"))
        .await
        .expect_err("servicer is not loaded");
    let body = rejection.to_body();
    assert_eq!(body.error.kind, ErrorKind::UnknownServicer);
    assert!(!body.signature);
    assert!(harness.rt.cache().is_empty());

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhosted_chain_is_refused_and_not_stored() -> Result<()> {
    let node = MockServer::start().await;
    let chain = MockServer::start().await;
    mount_servicer_basics(&node).await;
    mount_session(&node, valid_session(50), 1).await;

    let harness = Harness::start(&[(node.uri(), vec![1])], &[("0001", chain.uri())]).await?;
    let rejection = dispatcher::handle_relay(&harness.rt, relay(&key(1), "0002", NODE_HEIGHT, "x"))
        .await
        .expect_err("chain is not hosted");
    assert!(matches!(rejection.error, RelayError::ChainNotHosted(ref id) if id == "0002"));
    assert!(rejection.dispatch.is_some());
    assert!(harness.rt.cache().is_empty());

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_session_short_circuits_later_relays() -> Result<()> {
    let node = MockServer::start().await;
    let chain = MockServer::start().await;
    mount_servicer_basics(&node).await;
    mount_session(
        &node,
        json!({
            "success": false,
            "error": {
                "code": codes::CODE_EVIDENCE_SEALED,
                "codespace": codes::SERVICER_CODESPACE,
                "message": "evidence sealed",
            },
        }),
        1,
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("bar"))
        .expect(0)
        .mount(&chain)
        .await;

    let harness = Harness::start(&[(node.uri(), vec![1])], &[("0001", chain.uri())]).await?;
    for data in ["first", "second"] {
        let rejection = dispatcher::handle_relay(&harness.rt, relay(&key(1), "0001", NODE_HEIGHT, data))
            .await
            .expect_err("session is invalid");
        let body: ClientErrorBody = rejection.to_body();
        assert_eq!(body.error.kind, ErrorKind::SessionInvalid);
        assert_eq!(body.error.code, codes::CODE_EVIDENCE_SEALED);
        assert_eq!(body.error.codespace, codes::SERVICER_CODESPACE);
    }
    assert!(harness.rt.cache().is_empty());

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_body_gets_structured_400() -> Result<()> {
    let node = MockServer::start().await;
    mount_servicer_basics(&node).await;
    let harness = Harness::start(&[(node.uri(), vec![1])], &[]).await?;

    let response = http::router(harness.rt.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/client/relay")
                .body(Body::from("{not json"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ClientErrorBody = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
    assert_eq!(body.error.kind, ErrorKind::MalformedRelay);
    assert_eq!(body.error.codespace, codes::MESH_CODESPACE);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_endpoints_require_the_dispatcher_token() -> Result<()> {
    let node = MockServer::start().await;
    mount_servicer_basics(&node).await;
    let harness = Harness::start(&[(node.uri(), vec![1, 2])], &[("0001", "http://eth.local".to_string())]).await?;
    let router = http::router(harness.rt.clone());

    let denied = router
        .clone()
        .oneshot(Request::builder().uri("/v1/private/mesh/health").body(Body::empty())?)
        .await?;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let token = harness.rt.auth_token().value.clone();
    let health = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/private/mesh/health")
                .header("Authorization", &token)
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(health.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&to_bytes(health.into_body(), usize::MAX).await?)?;
    assert_eq!(body["servicers_count"], 2);
    assert_eq!(body["full_nodes_count"], 1);

    let update = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/private/mesh/updatechains")
                .header("Authorization", &token)
                .body(Body::from(r#"[{"id":"0002","url":"http://btc.local"}]"#))?,
        )
        .await?;
    assert_eq!(update.status(), StatusCode::OK);
    assert!(harness.rt.chains().get("0001").is_none());
    assert!(harness.rt.chains().get("0002").is_some());
    let persisted = std::fs::read_to_string(harness.dir.path().join("chains.json"))?;
    assert!(persisted.contains("0002"));

    let sim = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/client/sim")
                .body(Body::from("{}"))?,
        )
        .await?;
    assert_eq!(sim.status(), StatusCode::NOT_FOUND);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_request_body_is_cut_off_by_read_timeout() -> Result<()> {
    let node = MockServer::start().await;
    mount_servicer_basics(&node).await;
    let harness = Harness::start_with(&[(node.uri(), vec![1])], &[], |config| {
        config.server.read_timeout = Duration::from_millis(100);
    })
    .await?;

    let stalled = futures::stream::pending::<Result<bytes::Bytes, std::io::Error>>();
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        http::router(harness.rt.clone()).oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/client/relay")
                .body(Body::from_stream(stalled))?,
        ),
    )
    .await
    .expect("read timeout should end the request")?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.rt.cache().is_empty());

    harness.close().await;
    Ok(())
}
