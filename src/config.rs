use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::cli::Cli;

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_http_host(),
            port: default_http_port(),
            read_timeout: default_timeout_secs(),
            write_timeout: default_timeout_secs(),
            tls: None,
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_nats_servers() -> String {
    "127.0.0.1:4222".to_string()
}

fn default_reconnect_wait() -> u64 {
    10
}

fn default_max_reconnects() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_servers")]
    pub servers: String,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout: u64,
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait: u64,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: i64,
    pub user_credentials: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        NatsConfig {
            servers: default_nats_servers(),
            connect_timeout: default_timeout_secs(),
            reconnect_wait: default_reconnect_wait(),
            max_reconnects: default_max_reconnects(),
            user_credentials: None,
            tls: None,
        }
    }
}

fn default_cleanup_interval() -> u64 {
    600
}

fn default_max_entries() -> usize {
    100_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub dir: Option<String>,
    #[serde(default)]
    pub shard: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: None,
            shard: false,
            read_only: false,
            cleanup_interval: default_cleanup_interval(),
            max_entries: default_max_entries(),
        }
    }
}

/// The resolver's full configuration, assembled from an optional TOML file
/// and then overridden field-by-field by CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub operator_jwt_path: Option<String>,
    pub system_account_jwt_path: Option<String>,
    pub primary: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub replication_timeout: u64,
    #[serde(default)]
    pub max_replication_pack: i64,
    pub sign_request_subject: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub sign_request_timeout: u64,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            operator_jwt_path: None,
            system_account_jwt_path: None,
            primary: None,
            replication_timeout: default_timeout_secs(),
            max_replication_pack: 0,
            sign_request_subject: None,
            sign_request_timeout: default_timeout_secs(),
            http: HttpConfig::default(),
            nats: NatsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout)
    }

    pub fn sign_request_timeout(&self) -> Duration {
        Duration::from_secs(self.sign_request_timeout)
    }

    pub fn nats_reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.nats.reconnect_wait)
    }
}

/// Loads config from an optional TOML file, then applies CLI flag overrides.
/// A config file that does not exist is an error only if it was explicitly
/// named; an absent `--config` simply starts from defaults.
pub fn load(cli: &Cli) -> Result<Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = &cli.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    let raw = builder
        .build()
        .with_context(|| "failed to load config file")?;

    let mut cfg: Config = if cli.config.is_some() {
        raw.try_deserialize()
            .map_err(|err| anyhow!("invalid config file: {err}"))?
    } else {
        Config::default()
    };

    if let Some(dir) = &cli.dir {
        cfg.store.dir = Some(dir.clone());
    }
    if let Some(nats) = &cli.nats {
        cfg.nats.servers = nats.clone();
    }
    if let Some(creds) = &cli.creds {
        cfg.nats.user_credentials = Some(creds.clone());
    }
    if let Some(primary) = &cli.primary {
        cfg.primary = Some(primary.clone());
    }
    if let Some(hp) = &cli.hp {
        let (host, port) = hp
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--hp must be host:port, got {hp:?}"))?;
        cfg.http.host = host.to_string();
        cfg.http.port = port
            .parse()
            .with_context(|| format!("invalid port in --hp: {hp:?}"))?;
    }
    if let Some(cert) = &cli.tls_cert {
        let tls = cfg.http.tls.get_or_insert(TlsConfig { cert: None, key: None, ca: None });
        tls.cert = Some(cert.clone());
    }
    if let Some(key) = &cli.tls_key {
        let tls = cfg.http.tls.get_or_insert(TlsConfig { cert: None, key: None, ca: None });
        tls.key = Some(key.clone());
    }
    if let Some(ca) = &cli.tls_ca {
        cfg.nats.tls.get_or_insert(TlsConfig { cert: None, key: None, ca: None }).ca = Some(ca.clone());
    }

    Ok(cfg)
}
