//! Daemon configuration. Every field may be overridden by a
//! `PLUGIND_<FIELD>` environment variable layered on top of a TOML file,
//! with the environment always winning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path:?}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("parsing config file {path:?}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
    #[error("invalid value for {field}: {value:?}")]
    InvalidOverride { field: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the inbound HTTP surface binds to.
    pub bind_address: SocketAddr,
    /// Size of the tokio worker thread pool: a single pool of worker
    /// threads, sized at startup.
    pub worker_threads: usize,
    /// Inclusive range of ports the remote-runtime debug listener may bind.
    pub debug_port_range: (u16, u16),
    /// Default per-`(tenant, plugin)` persistence quota in bytes; `None`
    /// means unbounded, matching `PersistenceBucket`'s `maxSize < 0` rule.
    pub default_storage_quota_bytes: Option<u64>,
    pub node_ttl_secs: u64,
    pub master_lock_ttl_secs: u64,
    pub stale_node_age_secs: u64,
    /// Directory the local runtime extracts installed packages into.
    pub package_dir: PathBuf,
    /// Directory backing the installed-blob object store.
    pub installed_blob_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7890".parse().expect("valid default socket addr"),
            worker_threads: num_cpus(),
            debug_port_range: (17000, 17999),
            default_storage_quota_bytes: Some(64 * 1024 * 1024),
            node_ttl_secs: 60,
            master_lock_ttl_secs: 30,
            stale_node_age_secs: 120,
            package_dir: PathBuf::from("var/packages"),
            installed_blob_dir: PathBuf::from("var/blobs"),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl DaemonConfig {
    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node_ttl_secs)
    }

    pub fn master_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.master_lock_ttl_secs)
    }

    pub fn stale_node_age(&self) -> Duration {
        Duration::from_secs(self.stale_node_age_secs)
    }

    /// Loads defaults, overlays a TOML file if `path` exists, then overlays
    /// `PLUGIND_*` environment variables. Missing file is not an error —
    /// only a present-but-unreadable-or-malformed one is.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("PLUGIND_BIND_ADDRESS") {
            self.bind_address = v.parse().map_err(|_| ConfigError::InvalidOverride { field: "bind_address", value: v })?;
        }
        if let Ok(v) = std::env::var("PLUGIND_WORKER_THREADS") {
            self.worker_threads =
                v.parse().map_err(|_| ConfigError::InvalidOverride { field: "worker_threads", value: v })?;
        }
        if let Ok(v) = std::env::var("PLUGIND_DEFAULT_STORAGE_QUOTA_BYTES") {
            self.default_storage_quota_bytes = if v == "unbounded" {
                None
            } else {
                Some(v.parse().map_err(|_| ConfigError::InvalidOverride {
                    field: "default_storage_quota_bytes",
                    value: v,
                })?)
            };
        }
        if let Ok(v) = std::env::var("PLUGIND_DEBUG_PORT_RANGE") {
            let (low, high) = v
                .split_once('-')
                .and_then(|(low, high)| Some((low.parse::<u16>().ok()?, high.parse::<u16>().ok()?)))
                .filter(|(low, high)| low <= high)
                .ok_or_else(|| ConfigError::InvalidOverride { field: "debug_port_range", value: v.clone() })?;
            self.debug_port_range = (low, high);
        }
        if let Ok(v) = std::env::var("PLUGIND_PACKAGE_DIR") {
            self.package_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PLUGIND_INSTALLED_BLOB_DIR") {
            self.installed_blob_dir = PathBuf::from(v);
        }
        Ok(())
    }
}
