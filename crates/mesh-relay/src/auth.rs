// Numan Thabit 2025
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tracing::info;

const TOKEN_LEN: usize = 32;

/// Shared secret stored as `{"value", "issued"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub issued: DateTime<Utc>,
}

impl AuthToken {
    pub fn generate() -> Self {
        let value = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self {
            value,
            issued: Utc::now(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read auth token {}", path.display()))?;
        let token: AuthToken = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse auth token {}", path.display()))?;
        if token.value.is_empty() {
            bail!("auth token {} is empty", path.display());
        }
        Ok(token)
    }

    /// Read `path`, or create it with a fresh token when missing.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::read(path);
        }
        let token = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&token)?;
        fs::write(path, data)
            .with_context(|| format!("failed to write auth token {}", path.display()))?;
        info!(path = %path.display(), "generated dispatcher auth token");
        Ok(token)
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.value.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
