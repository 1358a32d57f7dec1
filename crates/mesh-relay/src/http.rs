// Numan Thabit 2025
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::{timeout::RequestBodyTimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::chains::HostedChain;
use crate::dispatcher::{self, SimRelay};
use crate::error::RelayError;
use crate::relay::Relay;
use crate::runtime::Runtime;

const TIMEOUT_MESSAGE: &str = "server timeout handling request";

#[derive(Debug, Serialize)]
struct HealthBody {
    version: &'static str,
    servicers_count: usize,
    full_nodes_count: usize,
}

pub fn router(rt: Arc<Runtime>) -> Router {
    let server = rt.config().server.clone();

    let private = Router::new()
        .route("/v1/private/mesh/health", get(health_handler))
        .route("/v1/private/mesh/chains", get(chains_handler))
        .route("/v1/private/mesh/servicer", get(servicers_handler))
        .route("/v1/private/mesh/updatechains", post(update_chains_handler))
        .route("/v1/private/mesh/stop", post(stop_handler))
        .route_layer(middleware::from_fn_with_state(rt.clone(), require_token));

    let mut public = Router::new()
        .route("/v1/client/relay", post(relay_handler))
        .route("/metrics", get(metrics_handler));
    if server.enable_simulate_relay {
        public = public.route("/v1/client/sim", post(sim_handler));
    }

    let router = public
        .merge(private)
        .layer(RequestBodyTimeoutLayer::new(server.read_timeout))
        .layer(middleware::from_fn_with_state(server.write_timeout, deadline))
        .with_state(rt);
    if server.http_trace {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

pub async fn serve(rt: Arc<Runtime>) -> Result<()> {
    let bind = rt.config().server.listen;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(bind = %bind, "HTTP server listening");
    let shutdown = rt.shutdown_token();
    axum::serve(listener, router(rt))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("terminating http server");
        })
        .await?;
    Ok(())
}

async fn deadline(State(limit): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, TIMEOUT_MESSAGE).into_response(),
    }
}

async fn require_token(State(rt): State<Arc<Runtime>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(token) if rt.auth_token().matches(token) => next.run(request).await,
        _ => {
            debug!(path = %request.uri().path(), "rejected private request");
            (StatusCode::UNAUTHORIZED, "invalid authorization token").into_response()
        }
    }
}

fn rejected(error: RelayError) -> Response {
    (StatusCode::BAD_REQUEST, Json(error.to_body(None))).into_response()
}

async fn relay_handler(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    let relay: Relay = match serde_json::from_slice(&body) {
        Ok(relay) => relay,
        Err(err) => return rejected(RelayError::malformed(format!("invalid relay body: {err}"))),
    };
    let limit = rt.config().server.client_rpc_timeout;
    match tokio::time::timeout(limit, dispatcher::handle_relay(&rt, relay)).await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(rejection)) => (StatusCode::BAD_REQUEST, Json(rejection.to_body())).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, TIMEOUT_MESSAGE).into_response(),
    }
}

async fn sim_handler(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    let sim: SimRelay = match serde_json::from_slice(&body) {
        Ok(sim) => sim,
        Err(err) => return rejected(RelayError::malformed(format!("invalid sim body: {err}"))),
    };
    match dispatcher::simulate(&rt, sim).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => rejected(err),
    }
}

async fn metrics_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    match rt.metrics().gather() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn health_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(HealthBody {
        version: env!("CARGO_PKG_VERSION"),
        servicers_count: rt.registry().servicer_count(),
        full_nodes_count: rt.registry().node_count(),
    })
}

async fn chains_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(rt.chains().list())
}

async fn servicers_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(rt.registry().servicer_addresses())
}

async fn update_chains_handler(State(rt): State<Arc<Runtime>>, body: Bytes) -> Response {
    let chains: Vec<HostedChain> = match serde_json::from_slice(&body) {
        Ok(chains) => chains,
        Err(err) => return (StatusCode::BAD_REQUEST, format!("invalid chain list: {err}")).into_response(),
    };
    match rt.chains().replace(chains) {
        Ok(count) => {
            info!(chains = count, "hosted chains replaced");
            (StatusCode::OK, Json(rt.chains().list())).into_response()
        }
        Err(err) => (StatusCode::BAD_REQUEST, format!("{err:#}")).into_response(),
    }
}

async fn stop_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    rt.begin_shutdown();
    (StatusCode::OK, "stopping")
}
