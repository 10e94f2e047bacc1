//! Service configuration.
//!
//! A small, enumerated configuration loaded from a YAML file with
//! `MANTLE_`-prefixed environment overrides for the common deployment knobs.
//! Durations are humantime strings (`10m`, `30d`).
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to access signing key at {path}")]
    SigningKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no signing key at {path} and generation is disabled")]
    SigningKeyMissing { path: PathBuf },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level service configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Apex URL the service is reachable under.
    pub main_url: String,
    pub workload_proxy: WorkloadProxyConfig,
    pub log_store: LogStoreConfig,
    pub siderolink: SideroLinkConfig,
    pub redirect_signing_key: RedirectKeyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            main_url: String::new(),
            workload_proxy: WorkloadProxyConfig::default(),
            log_store: LogStoreConfig::default(),
            siderolink: SideroLinkConfig::default(),
            redirect_signing_key: RedirectKeyConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadProxyConfig {
    pub enabled: bool,
    /// Subdomain carrying workload hosts, e.g. `proxy-us`.
    pub subdomain: String,
}

impl Default for WorkloadProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subdomain: "proxy".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LogStoreConfig {
    pub path: PathBuf,
    /// Total database byte budget; zero disables the bound.
    pub max_size: u64,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_older_than: Duration,
    pub max_lines_per_machine: u32,
    pub cleanup_probability: f64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("machine-logs.db"),
            max_size: 0,
            cleanup_interval: Duration::from_secs(10 * 60),
            cleanup_older_than: Duration::from_secs(30 * 24 * 60 * 60),
            max_lines_per_machine: 1000,
            cleanup_probability: 0.05,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SideroLinkConfig {
    pub events_port: u16,
    pub logs_port: u16,
}

impl Default for SideroLinkConfig {
    fn default() -> Self {
        Self {
            events_port: 8090,
            logs_port: 8092,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectKeyConfig {
    /// Key file location; empty means "hold the key in memory only".
    pub path: PathBuf,
    /// Create the key on first use when the file is absent.
    pub generate_if_missing: bool,
}

const SIGNING_KEY_LEN: usize = 64;

impl Config {
    /// Loads the configuration file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.with_env_overrides())
    }

    /// Applies `MANTLE_*` environment overrides on top of the file values.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("MANTLE_MAIN_URL") {
            self.main_url = value;
        }
        if let Ok(value) = std::env::var("MANTLE_WORKLOAD_PROXY_SUBDOMAIN") {
            self.workload_proxy.subdomain = value;
        }
        if let Ok(value) = std::env::var("MANTLE_LOG_STORE_PATH") {
            self.log_store.path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("MANTLE_SIDEROLINK_EVENTS_PORT") {
            if let Ok(port) = value.parse() {
                self.siderolink.events_port = port;
            }
        }
        if let Ok(value) = std::env::var("MANTLE_SIDEROLINK_LOGS_PORT") {
            if let Ok(port) = value.parse() {
                self.siderolink.logs_port = port;
            }
        }
        self
    }

    /// The redirect signing key: read from the configured path, generated
    /// (and persisted) when missing and generation is allowed, or generated
    /// in memory when no path is configured.
    pub fn redirect_signing_key(&self) -> Result<Vec<u8>> {
        let key_config = &self.redirect_signing_key;
        if key_config.path.as_os_str().is_empty() {
            return Ok(generate_key());
        }
        match std::fs::read(&key_config.path) {
            Ok(key) => Ok(key),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if !key_config.generate_if_missing {
                    return Err(Error::SigningKeyMissing {
                        path: key_config.path.clone(),
                    });
                }
                let key = generate_key();
                std::fs::write(&key_config.path, &key).map_err(|source| Error::SigningKey {
                    path: key_config.path.clone(),
                    source,
                })?;
                info!(path = %key_config.path.display(), "generated redirect signing key");
                Ok(key)
            }
            Err(source) => Err(Error::SigningKey {
                path: key_config.path.clone(),
                source,
            }),
        }
    }
}

fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; SIGNING_KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}
