//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kmapi_core::SslFlags;
use serde::Deserialize;

use crate::engine::{self, EngineSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}: invalid value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("loading server identity: {0}")]
    Identity(std::io::Error),
}

/// Client configuration. File: ~/.config/kmapi/config.toml or /etc/kmapi/config.toml.
/// Env overrides: KMAPI_CONNECT_TIMEOUT_MS, KMAPI_SSL_FLAGS, KMAPI_CA_FILE, KMAPI_CERT_FILE,
/// KMAPI_KEY_FILE, KMAPI_LOG_LEVEL, KMAPI_READ_BUFFER_SIZE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Engine default when a connect passes no timeout (default 30000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Extra TLS flags for every endpoint the client opens.
    #[serde(default)]
    pub ssl_flags: SslFlags,
    /// PEM bundle used instead of the system trust store.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Certificate chain and key for server-role handshakes.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Filter directive used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_read_buffer_size() -> usize {
    16 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ssl_flags: SslFlags::NONE,
            ca_file: None,
            cert_file: None,
            key_file: None,
            log_level: default_log_level(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Config {
    /// Engine settings, loading the server identity when both files are configured.
    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        let identity = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                Some(engine::load_identity(cert, key).map_err(ConfigError::Identity)?)
            }
            _ => None,
        };
        Ok(EngineSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_buffer_size: self.read_buffer_size.max(1),
            identity,
        })
    }

    /// Apply `KMAPI_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("KMAPI_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_num("KMAPI_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("KMAPI_SSL_FLAGS") {
            self.ssl_flags = SslFlags::from_bits(parse_num("KMAPI_SSL_FLAGS", &v)?);
        }
        if let Some(v) = lookup("KMAPI_CA_FILE") {
            self.ca_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KMAPI_CERT_FILE") {
            self.cert_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KMAPI_KEY_FILE") {
            self.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KMAPI_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("KMAPI_READ_BUFFER_SIZE") {
            self.read_buffer_size = parse_num("KMAPI_READ_BUFFER_SIZE", &v)?;
        }
        Ok(())
    }
}

/// Decimal, or hex with a `0x` prefix.
fn parse_num<T: TryFrom<u64>>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    let s = value.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse::<u64>().ok(),
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConfigError::Env {
            var,
            value: value.to_string(),
        })
}

/// Load config: defaults, then the config file, then env vars. An explicit `path` must
/// exist; otherwise the first existing file on the search path is used, if any.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let file = match path {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match file {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/kmapi/config.toml"));
    }
    out.push(PathBuf::from("/etc/kmapi/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(c)
}
