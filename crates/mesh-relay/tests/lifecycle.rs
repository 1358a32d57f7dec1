// Numan Thabit 2025
mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mesh_relay::notify;
use mesh_relay::runtime::RecoveryReport;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_relays_are_resubmitted_or_dropped() -> Result<()> {
    let node = MockServer::start().await;
    mount_servicer_basics(&node).await;
    let servicer = key(1);
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/relay"))
        .and(header("X-Servicer", servicer.address()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&node)
        .await;

    let harness = Harness::start(&[(node.uri(), vec![1])], &[]).await?;
    let rt = harness.rt.clone();

    // Stored before the process died; one belongs to a key that is gone.
    let survivor = relay(&servicer, "0001", NODE_HEIGHT, "kept");
    let orphan = relay(&key(7), "0001", NODE_HEIGHT, "orphaned");
    rt.cache().put(&survivor)?;
    rt.cache().put(&orphan)?;

    let report = rt.recover();
    assert_eq!(
        report,
        RecoveryReport {
            resubmitted: 1,
            dropped: 1,
            undecodable: 0,
        }
    );
    assert!(!rt.cache().contains(&orphan.cache_key())?);
    assert!(
        eventually(Duration::from_secs(5), || rt.cache().is_empty()).await,
        "acknowledged relay should be deleted"
    );

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relays_survive_a_restart() -> Result<()> {
    let node = MockServer::start().await;
    mount_servicer_basics(&node).await;
    let servicer = key(1);
    let pending = relay(&servicer, "0001", NODE_HEIGHT, "in flight");

    {
        let harness = Harness::start(&[(node.uri(), vec![1])], &[]).await?;
        harness.rt.cache().put(&pending)?;
        let dir = harness.dir;
        harness.rt.close().await;
        drop(harness.rt);

        // Second life: the servicer now acknowledges.
        Mock::given(method("POST"))
            .and(path("/v1/private/mesh/relay"))
            .and(query_param("authtoken", "servicer-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&node)
            .await;
        let rt = mesh_relay::runtime::Runtime::start(
            config(dir.path()),
            mesh_relay::metrics::MeshMetrics::new(),
        )
        .await?;
        assert!(
            eventually(Duration::from_secs(5), || rt.cache().is_empty()).await,
            "replayed relay should be acknowledged and deleted"
        );
        rt.close().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_moves_servicer_without_losing_its_sessions() -> Result<()> {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_servicer_basics(&first).await;
    mount_servicer_basics(&second).await;

    let harness = Harness::start(&[(first.uri(), vec![1, 2])], &[]).await?;
    let rt = harness.rt.clone();
    let moving = key(2);
    let before = rt.registry().servicer(moving.address()).expect("loaded");
    before.sessions().get_or_insert(&relay(&moving, "0001", NODE_HEIGHT, "x").session_header());

    write_keys(
        harness.dir.path(),
        &[(first.uri(), vec![1]), (second.uri(), vec![2])],
    )?;
    let diff = rt.reload_keys().await?;

    assert_eq!(diff.moved_servicers, vec![moving.address().to_string()]);
    assert_eq!(diff.added_nodes.len(), 1);
    assert!(diff.removed_nodes.is_empty());
    assert_eq!(diff.resized_nodes, vec![first.uri()]);

    let after = rt.registry().servicer(moving.address()).expect("still loaded");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.node().url(), second.uri());
    assert_eq!(after.sessions().len(), 1);

    let added = rt.registry().node(&second.uri()).expect("second node registered");
    assert!(added.is_probed());
    let first_node = rt.registry().node(&first.uri()).expect("first node kept");
    assert_eq!(first_node.servicer_count(), 1);
    assert_eq!(
        first_node.pool().config().max_workers,
        rt.config().workers.servicer.max_workers
    );

    let probes = |requests: Vec<wiremock::Request>| {
        requests
            .iter()
            .filter(|r| r.url.query().is_some_and(|q| q.contains("verify=true")))
            .count()
    };
    assert_eq!(probes(first.received_requests().await.unwrap_or_default()), 3);
    assert_eq!(probes(second.received_requests().await.unwrap_or_default()), 3);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_removing_a_node_stops_it() -> Result<()> {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_servicer_basics(&first).await;
    mount_servicer_basics(&second).await;

    let harness = Harness::start(
        &[(first.uri(), vec![1]), (second.uri(), vec![2])],
        &[],
    )
    .await?;
    let rt = harness.rt.clone();
    let doomed = rt.registry().node(&second.uri()).expect("second node");

    write_keys(harness.dir.path(), &[(first.uri(), vec![1])])?;
    let diff = rt.reload_keys().await?;
    assert_eq!(diff.removed_nodes.len(), 1);
    assert_eq!(diff.removed_servicers, vec![key(2).address().to_string()]);
    assert!(doomed.pool().is_stopped());
    assert!(doomed.cron().is_cancelled());
    assert!(rt.registry().servicer(key(2).address()).is_none());

    harness.close().await;
    Ok(())
}

/// Relay endpoint that keeps a notification in flight long enough for a
/// reload to stop its pool.
async fn mount_slow_outage(node: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/relay"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(300)))
        .mount(node)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_drops_cached_relays_of_a_removed_node() -> Result<()> {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_servicer_basics(&first).await;
    mount_servicer_basics(&second).await;
    mount_slow_outage(&second).await;

    let harness = Harness::start(
        &[(first.uri(), vec![1]), (second.uri(), vec![2])],
        &[],
    )
    .await?;
    let rt = harness.rt.clone();
    let stranded = relay(&key(2), "0001", NODE_HEIGHT, "stranded");
    rt.cache().put(&stranded)?;
    let doomed = rt.registry().node(&second.uri()).expect("second node");
    notify::submit(&rt, &doomed, stranded.clone())?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    write_keys(harness.dir.path(), &[(first.uri(), vec![1])])?;
    let diff = rt.reload_keys().await?;
    assert_eq!(diff.removed_servicers, vec![key(2).address().to_string()]);
    assert!(!rt.cache().contains(&stranded.cache_key())?);
    assert_eq!(notifications(&first).await, 0);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_renotifies_relays_of_a_servicer_moved_off_a_removed_node() -> Result<()> {
    let old = MockServer::start().await;
    let new = MockServer::start().await;
    mount_servicer_basics(&old).await;
    mount_servicer_basics(&new).await;
    mount_slow_outage(&old).await;
    let moving = key(2);
    Mock::given(method("POST"))
        .and(path("/v1/private/mesh/relay"))
        .and(header("X-Servicer", moving.address()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&new)
        .await;

    let harness = Harness::start(&[(old.uri(), vec![2])], &[]).await?;
    let rt = harness.rt.clone();
    let pending = relay(&moving, "0001", NODE_HEIGHT, "pending");
    rt.cache().put(&pending)?;
    let leaving = rt.registry().node(&old.uri()).expect("old node");
    notify::submit(&rt, &leaving, pending.clone())?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    write_keys(harness.dir.path(), &[(new.uri(), vec![2])])?;
    let diff = rt.reload_keys().await?;
    assert_eq!(diff.moved_servicers, vec![moving.address().to_string()]);
    assert_eq!(diff.removed_nodes.len(), 1);
    assert!(
        eventually(Duration::from_secs(5), || rt.cache().is_empty()).await,
        "moved servicer's relay should be acknowledged by its new node"
    );
    assert_eq!(notifications(&new).await, 1);

    harness.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_fails_when_a_node_is_unreachable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_keys(dir.path(), &[("http://127.0.0.1:9".to_string(), vec![1])])?;
    write_servicer_token(dir.path())?;
    let mut config = config(dir.path());
    config.clients.servicer.timeout = Duration::from_millis(500);
    let result = mesh_relay::runtime::Runtime::start(config, mesh_relay::metrics::MeshMetrics::new()).await;
    let err = result.err().expect("probe must fail");
    assert!(format!("{err:#}").contains("connectivity probe"));
    Ok(())
}
