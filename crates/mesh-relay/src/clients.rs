// Numan Thabit 2025
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ClientConfig, ClientsConfig};

/// Response whose body has been read into memory so it can be inspected
/// more than once.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Materialized {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Caps concurrent requests per host. `reqwest` pools idle connections but
/// does not bound active ones.
#[derive(Debug)]
struct HostLimiter {
    per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl HostLimiter {
    fn new(per_host: usize) -> Self {
        Self {
            per_host,
            hosts: DashMap::new(),
        }
    }

    async fn acquire(&self, host: &str) -> Option<OwnedSemaphorePermit> {
        if self.per_host == 0 {
            return None;
        }
        let semaphore = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone();
        semaphore.acquire_owned().await.ok()
    }
}

/// Pooled HTTP client for one kind of upstream.
#[derive(Clone)]
pub struct HttpClient {
    kind: &'static str,
    inner: Client,
    limiter: Arc<HostLimiter>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(kind: &'static str, config: &ClientConfig, user_agent: &str) -> Result<Self> {
        let inner = Client::builder()
            .timeout(config.timeout)
            .user_agent(user_agent)
            .tcp_nodelay(true)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(config.idle_per_host())
            .build()
            .with_context(|| format!("failed to construct {kind} http client"))?;
        Ok(Self {
            kind,
            inner,
            limiter: Arc::new(HostLimiter::new(config.max_conns_per_host)),
            timeout: config.timeout,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.inner.request(method, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.inner.post(url)
    }

    /// Send the request and read the whole body while holding the host permit.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Materialized, reqwest::Error> {
        let request = builder.build()?;
        let host = request
            .url()
            .host_str()
            .map(|h| match request.url().port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
            .unwrap_or_default();
        let _permit = self.limiter.acquire(&host).await;
        let response = self.inner.execute(request).await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok(Materialized { status, body })
    }
}

/// The three clients used by the dispatcher.
#[derive(Clone)]
pub struct Clients {
    /// Non-native blockchain endpoints.
    pub chain: HttpClient,
    /// Servicer control calls: session fetch, check and probes.
    pub servicer: HttpClient,
    /// Relay notifications, driven through the retry loop.
    pub notify: HttpClient,
}

impl Clients {
    pub fn new(config: &ClientsConfig, user_agent: &str) -> Result<Self> {
        Ok(Self {
            chain: HttpClient::new("chain", &config.chain, user_agent)?,
            servicer: HttpClient::new("servicer", &config.servicer, user_agent)?,
            notify: HttpClient::new("notify", &config.notify, user_agent)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(max_conns_per_host: usize) -> ClientConfig {
        ClientConfig {
            max_conns_per_host,
            timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn send_materializes_body_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = HttpClient::new("chain", &config(0), "tester").unwrap();
        let response = client
            .send(client.post(&format!("{}/rpc", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text(), "busy");
        assert!(!response.is_success());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn host_limiter_bounds_concurrency() {
        let limiter = Arc::new(HostLimiter::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("node:8081").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(HostLimiter::new(0).acquire("any").await.is_none());
    }
}
