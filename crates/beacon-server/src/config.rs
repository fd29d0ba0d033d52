use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub server: ServerConfig,
    pub sink: SinkConfig,
    pub cors: CorsConfig,
    pub tls: Option<TlsConfig>,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8189,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink identifier, resolved once at startup ("console" or "file").
    pub kind: String,
    /// Backing file the read API queries.
    pub path: PathBuf,
    /// Bound on the writer queue.
    pub queue_capacity: usize,
    /// How long a write may wait for queue space before failing.
    pub enqueue_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: "console".to_string(),
            path: PathBuf::from("./data/traces.json"),
            queue_capacity: 256,
            enqueue_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact origins allowed to call the collector; empty means unrestricted.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Accepted for completeness; rustls only loads cleartext PEM keys, so a
    /// set passphrase is refused at startup rather than failing mid-handshake.
    pub passphrase_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 9187,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        if !path.exists() {
            println!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}
