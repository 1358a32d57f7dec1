// Numan Thabit 2025
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds, DurationSeconds};
use tracing::info;

use crate::codes::{CodeSets, DEFAULT_RETRYABLE, DEFAULT_SESSION_INVALIDATING};
use crate::pool::{PoolConfig, WorkerStrategy};

const DEFAULT_CONFIG_NAME: &str = "mesh.toml";
const DEFAULT_LISTEN: &str = "0.0.0.0:8081";

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Relay dispatcher colocated with one or more servicer nodes",
    rename_all = "kebab-case"
)]
pub struct CliArgs {
    /// Directory holding keys, chains, auth tokens and the relay cache.
    #[arg(long, value_name = "PATH", env = "MESH_DATADIR", default_value = ".")]
    pub datadir: PathBuf,

    /// TOML configuration file (defaults to `<datadir>/mesh.toml`).
    #[arg(long, value_name = "PATH", env = "MESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Socket address for the public and private HTTP endpoints.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Enable per-request HTTP tracing logs.
    #[arg(long, default_value_t = false)]
    pub http_trace: bool,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub listen: SocketAddr,
    /// Handler deadline for a single client relay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub client_rpc_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub write_timeout: Duration,
    pub http_trace: bool,
    pub enable_simulate_relay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 8081))
            }),
            client_rpc_timeout: Duration::from_millis(60_000),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            http_trace: false,
            enable_simulate_relay: false,
        }
    }
}

/// Pool sizing and deadline for one HTTP client kind.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_idle_conns: usize,
    /// 0 means unlimited.
    pub max_conns_per_host: usize,
    pub max_idle_conns_per_host: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

impl ClientConfig {
    /// Idle connections kept per host; reqwest has no process-wide cap, so
    /// `max_idle_conns` bounds the per-host figure.
    pub fn idle_per_host(&self) -> usize {
        self.max_idle_conns_per_host.min(self.max_idle_conns)
    }

    fn with_timeout(timeout: Duration) -> Self {
        Self {
            max_idle_conns: 1_000,
            max_conns_per_host: 0,
            max_idle_conns_per_host: 100,
            timeout,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::with_timeout(Duration::from_millis(60_000))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub chain: ClientConfig,
    pub servicer: ClientConfig,
    pub notify: ClientConfig,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            chain: ClientConfig::with_timeout(Duration::from_millis(60_000)),
            servicer: ClientConfig::with_timeout(Duration::from_millis(10_000)),
            notify: ClientConfig::with_timeout(Duration::from_millis(30_000)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_times: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub wait_min: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub wait_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_times: 10,
            wait_min: Duration::from_millis(5),
            wait_max: Duration::from_millis(180_000),
        }
    }
}

/// Per-servicer worker sizing; a node multiplies it by its servicer count.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub strategy: WorkerStrategy,
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_capacity: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            strategy: WorkerStrategy::Balanced,
            min_workers: 1,
            max_workers: 50,
            max_capacity: 50_000,
            idle_timeout: Duration::from_millis(10_000),
        }
    }
}

impl WorkerConfig {
    /// Pool sizing for a node hosting `servicers` keys.
    pub fn pool_config(&self, servicers: usize) -> PoolConfig {
        let servicers = servicers.max(1);
        PoolConfig {
            strategy: self.strategy,
            min_workers: self.min_workers,
            max_workers: self.max_workers.saturating_mul(servicers),
            max_capacity: self.max_capacity.saturating_mul(servicers),
            idle_timeout: self.idle_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub servicer: WorkerConfig,
    pub metrics: WorkerConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            servicer: WorkerConfig::default(),
            metrics: WorkerConfig {
                strategy: WorkerStrategy::Lazy,
                max_workers: 10,
                max_capacity: 10_000,
                ..WorkerConfig::default()
            },
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keys_hot_reload: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub chains_hot_reload: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub node_check: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub session_cache_clean_up: Duration,
    /// Delay before a notification for an unvalidated session re-enqueues.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub notify_requeue_delay: Duration,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            keys_hot_reload: Duration::from_secs(180),
            chains_hot_reload: Duration::from_secs(180),
            node_check: Duration::from_secs(60),
            session_cache_clean_up: Duration::from_secs(3_600),
            notify_requeue_delay: Duration::from_millis(250),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayCacheConfig {
    /// Directory name under the data dir.
    pub file: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub background_sync_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub background_compaction_interval: Duration,
}

impl Default for RelayCacheConfig {
    fn default() -> Self {
        Self {
            file: "relays".to_string(),
            background_sync_interval: Duration::from_millis(1_000),
            background_compaction_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub auth_token_file: String,
    pub servicer_auth_token_file: String,
    pub chains_name: String,
    pub servicer_private_key_file: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            auth_token_file: "auth-token".to_string(),
            servicer_auth_token_file: "servicer-auth-token".to_string(),
            chains_name: "chains.json".to_string(),
            servicer_private_key_file: "servicers.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    pub server: ServerConfig,
    pub clients: ClientsConfig,
    pub retry: RetryConfig,
    pub workers: WorkersConfig,
    pub intervals: IntervalsConfig,
    pub relay_cache: RelayCacheConfig,
    pub files: FilesConfig,
    pub user_agent: String,
    pub json_sort_relay_responses: bool,
    /// Sessions kept behind the node's current session before eviction.
    pub session_cache_keep_sessions: u64,
    /// Anything further ahead than this many sessions is treated as hostile.
    pub optimistic_max_sessions_ahead: u64,
    pub retryable_codes: Vec<u32>,
    pub session_invalidating_codes: Vec<u32>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            config_path: None,
            server: ServerConfig::default(),
            clients: ClientsConfig::default(),
            retry: RetryConfig::default(),
            workers: WorkersConfig::default(),
            intervals: IntervalsConfig::default(),
            relay_cache: RelayCacheConfig::default(),
            files: FilesConfig::default(),
            user_agent: format!("mesh-relay/{}", env!("CARGO_PKG_VERSION")),
            json_sort_relay_responses: false,
            session_cache_keep_sessions: 6,
            optimistic_max_sessions_ahead: 50,
            retryable_codes: DEFAULT_RETRYABLE.to_vec(),
            session_invalidating_codes: DEFAULT_SESSION_INVALIDATING.to_vec(),
        }
    }
}

impl MeshConfig {
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| cli.datadir.join(DEFAULT_CONFIG_NAME));
        let mut config = if path.exists() {
            let mut config = read_config(&path)?;
            config.config_path = Some(path);
            config
        } else if cli.config.is_some() {
            bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };
        config.data_dir = cli.datadir.clone();
        config.server.listen = pick(cli.listen, None, config.server.listen);
        config.server.http_trace = cli.http_trace || config.server.http_trace;
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, worker) in [
            ("servicer", &self.workers.servicer),
            ("metrics", &self.workers.metrics),
        ] {
            if worker.max_workers == 0 {
                bail!("workers.{name}.max_workers must be greater than 0");
            }
            if worker.max_capacity == 0 {
                bail!("workers.{name}.max_capacity must be greater than 0");
            }
            if worker.min_workers > worker.max_workers {
                bail!("workers.{name}.min_workers must not exceed max_workers");
            }
        }
        if self.retry.wait_min > self.retry.wait_max {
            bail!("retry.wait_min must not exceed retry.wait_max");
        }
        for (name, interval) in [
            ("keys_hot_reload", self.intervals.keys_hot_reload),
            ("chains_hot_reload", self.intervals.chains_hot_reload),
            ("node_check", self.intervals.node_check),
            ("session_cache_clean_up", self.intervals.session_cache_clean_up),
        ] {
            if interval.is_zero() {
                bail!("intervals.{name} must be greater than 0");
            }
        }
        if self.relay_cache.file.trim().is_empty() {
            bail!("relay_cache.file must not be empty");
        }
        if self.optimistic_max_sessions_ahead < 2 {
            bail!("optimistic_max_sessions_ahead must be at least 2");
        }
        Ok(())
    }

    fn log_summary(&self) {
        info!(
            data_dir = %self.data_dir.display(),
            config = ?self.config_path,
            listen = %self.server.listen,
            client_rpc_timeout = ?self.server.client_rpc_timeout,
            read_timeout = ?self.server.read_timeout,
            write_timeout = ?self.server.write_timeout,
            retry_max = self.retry.max_times,
            retry_wait_min = ?self.retry.wait_min,
            retry_wait_max = ?self.retry.wait_max,
            servicer_strategy = ?self.workers.servicer.strategy,
            servicer_max_workers = self.workers.servicer.max_workers,
            node_check = ?self.intervals.node_check,
            json_sort = self.json_sort_relay_responses,
            "mesh-relay configuration"
        );
    }

    pub fn code_sets(&self) -> CodeSets {
        CodeSets::new(
            self.retryable_codes.iter().copied(),
            self.session_invalidating_codes.iter().copied(),
        )
    }

    pub fn relay_cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.relay_cache.file)
    }

    pub fn chains_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.chains_name)
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(&self.files.servicer_private_key_file)
    }

    pub fn auth_token_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.json", self.files.auth_token_file))
    }

    pub fn servicer_auth_token_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.json", self.files.servicer_auth_token_file))
    }
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn read_config(path: &Path) -> Result<MeshConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: MeshConfig = toml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(cfg)
}
