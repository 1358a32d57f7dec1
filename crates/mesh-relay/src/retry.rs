// Numan Thabit 2025
//! Retry driver for outbound calls whose outcome is judged by a caller
//! supplied classifier.

use std::time::Duration;

use reqwest::RequestBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clients::{HttpClient, Materialized};
use crate::config::RetryConfig;

pub type Attempt = Result<Materialized, reqwest::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Stop,
    Fatal,
}

#[derive(Debug)]
pub enum Outcome {
    /// The classifier accepted this attempt as final.
    Stopped(Attempt),
    /// Every allowed attempt asked for a retry; holds the last one.
    Exhausted(Attempt),
    Fatal(Attempt),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_times,
            wait_min: config.wait_min,
            wait_max: config.wait_max,
        }
    }
}

impl RetryPolicy {
    /// `wait_min * 2^attempt`, capped at `wait_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.wait_min
            .checked_mul(factor)
            .unwrap_or(self.wait_max)
            .min(self.wait_max)
    }

    /// Send `build()` until `classify` stops, the retry budget runs out, or
    /// `cancel` fires during a backoff. `classify` sees every attempt.
    pub async fn run<B, C>(
        &self,
        client: &HttpClient,
        cancel: &CancellationToken,
        build: B,
        mut classify: C,
    ) -> Outcome
    where
        B: Fn() -> RequestBuilder,
        C: FnMut(&Attempt) -> Decision,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let result = client.send(build()).await;
            match classify(&result) {
                Decision::Stop => return Outcome::Stopped(result),
                Decision::Fatal => return Outcome::Fatal(result),
                Decision::Retry if attempt >= self.max_retries => {
                    return Outcome::Exhausted(result)
                }
                Decision::Retry => {}
            }
            let wait = self.backoff(attempt);
            attempt += 1;
            debug!(client = client.kind(), attempt, wait = ?wait, "retrying request");
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
