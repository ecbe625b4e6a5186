//! Runtime configuration, merged from (highest precedence first) command
//! line flags, the optional YAML configuration file, `HETZNER_SD_*`
//! environment variables and built-in defaults.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use argh::FromArgs;
use serde::Deserialize;

use crate::hetzner::{self, ServerFilter};
use crate::http::{Auth, MaybeAuth};
use crate::tls::TlsConfig;

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7764;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_NODE_PORT: u16 = 9090;
pub const DEFAULT_METRICS_ENDPOINT: &str = "/metrics";
pub const DEFAULT_NODE_LABEL_PREFIX: &str = "hetzner";
pub const DEFAULT_LOG_LEVEL: &str = "debug";

// Refreshing faster than this would trip Hetzner's API rate limits.
const MIN_REFRESH_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {}: {source}", path.display())]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("missing Hetzner API token")]
    MissingApiToken,

    #[error("port out of range")]
    PortOutOfRange,

    #[error("node port out of range")]
    NodePortOutOfRange,

    #[error("invalid hostname")]
    InvalidHostname,

    #[error("mTLS cannot be used without an HTTPS server")]
    MutualTlsWithoutHttps,

    #[error("https is enabled but no certificate and key are configured")]
    HttpsWithoutCertificate,

    #[error("tls requires both a certificate and a private key")]
    IncompleteKeyPair,

    #[error("refresh interval must be at least one second")]
    RefreshIntervalTooShort,

    #[error("two authorization credentials was provided")]
    AmbiguousAuth,

    #[error("basic credentials must be given as user:password")]
    InvalidBasicCredentials,

    #[error("unable to resolve listen address {0:?}")]
    ResolveAddr(String),
}

/// Serve Hetzner Cloud servers as Prometheus HTTP service discovery targets.
#[derive(Debug, Default, FromArgs)]
#[argh(help_triggers("-h", "--help"))]
pub struct Opts {
    #[argh(switch, short = 'v', description = "show version")]
    pub version: bool,

    #[argh(
        option,
        short = 'c',
        description = "path to a YAML configuration file"
    )]
    pub config_file: Option<PathBuf>,

    #[argh(
        option,
        short = 't',
        description = "API token obtained from Hetzner Cloud"
    )]
    pub hetzner_api_token: Option<String>,

    #[argh(option, description = "hostname or address to listen on")]
    pub hostname: Option<String>,

    #[argh(option, short = 'p', description = "port to listen on")]
    pub port: Option<u16>,

    #[argh(switch, short = 'H', description = "serve over HTTPS")]
    pub https: bool,

    #[argh(option, description = "path to the TLS certificate, PEM encoded")]
    pub tls_cert: Option<PathBuf>,

    #[argh(option, description = "path to the TLS private key, PEM encoded")]
    pub tls_key: Option<PathBuf>,

    #[argh(
        option,
        description = "path to a CA bundle; clients must present a certificate signed by it"
    )]
    pub m_tls_ca: Option<PathBuf>,

    #[argh(
        option,
        short = 's',
        description = "interval between inventory refreshes, in milliseconds"
    )]
    pub refresh_interval: Option<u64>,

    #[argh(option, description = "path the metrics exposition is served at")]
    pub metrics_endpoint: Option<String>,

    #[argh(
        option,
        description = "port the discovered targets expose their metrics on"
    )]
    pub node_port: Option<u16>,

    #[argh(
        option,
        description = "private network (id or CIDR) to prefer when resolving target addresses"
    )]
    pub node_network: Option<String>,

    #[argh(option, description = "prefix for the generated target labels")]
    pub node_label_prefix: Option<String>,

    #[argh(option, short = 'l', description = "log level")]
    pub log_level: Option<String>,

    #[argh(
        switch,
        short = 'D',
        description = "enable debug mode (verbose error responses)"
    )]
    pub debug: bool,

    #[argh(
        option,
        description = "bearer token clients must present to query this server"
    )]
    pub bearer_token: Option<String>,

    #[argh(
        option,
        description = "basic credentials (user:password) clients must present to query this server"
    )]
    pub basic_auth: Option<String>,

    #[argh(
        option,
        description = "specify how many threads the Tokio runtime will use"
    )]
    pub threads: Option<usize>,
}

/// The optional YAML configuration file. Every key is optional, values
/// given on the command line win over values from the file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    hostname: Option<String>,
    port: Option<u16>,
    https: Option<bool>,
    tls: Option<TlsConfig>,
    hetzner_api_token: Option<String>,
    api_endpoint: Option<String>,
    refresh_interval: Option<u64>,
    metrics_endpoint: Option<String>,
    node_port: Option<u16>,
    node_network: Option<String>,
    node_label_prefix: Option<String>,
    log_level: Option<String>,
    debug: Option<bool>,
    auth: Option<Auth>,
    filter: Option<ServerFilter>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub hostname: String,
    pub port: u16,
    pub https: bool,
    pub tls: Option<TlsConfig>,

    pub api_token: String,
    pub api_endpoint: String,
    pub refresh_interval_ms: u64,
    pub filter: ServerFilter,

    pub metrics_endpoint: String,
    pub node_port: u16,
    pub node_network: Option<String>,
    pub node_label_prefix: String,

    pub log_level: String,
    pub debug: bool,
    pub auth: Option<Auth>,
}

impl Config {
    pub fn load(opts: &Opts) -> Result<Config, ConfigError> {
        let env = std::env::vars().collect::<BTreeMap<_, _>>();
        Self::load_from(opts, &env)
    }

    pub fn load_from(
        opts: &Opts,
        env: &BTreeMap<String, String>,
    ) -> Result<Config, ConfigError> {
        let file = match &opts.config_file {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };

        Self::merge(opts, file, env)
    }

    fn merge(
        opts: &Opts,
        file: FileConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Config, ConfigError> {
        let auth = Self::cli_auth(opts)?.choose_one(&file.auth).map_err(|_| ConfigError::AmbiguousAuth)?;

        let config = Config {
            hostname: opts
                .hostname
                .clone()
                .or(file.hostname)
                .or_else(|| env_str(env, "HETZNER_SD_HOSTNAME"))
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            port: opts
                .port
                .or(file.port)
                .or(env_parse(env, "HETZNER_SD_PORT")?)
                .unwrap_or(DEFAULT_PORT),
            https: opts.https
                || file
                    .https
                    .unwrap_or_else(|| env_flag(env, "HETZNER_SD_HTTPS")),
            tls: Self::merge_tls(opts, file.tls, env)?,
            api_token: opts
                .hetzner_api_token
                .clone()
                .or(file.hetzner_api_token)
                .or_else(|| env_str(env, "HETZNER_SD_API_TOKEN"))
                .unwrap_or_default(),
            api_endpoint: file
                .api_endpoint
                .or_else(|| env_str(env, "HETZNER_SD_API_ENDPOINT"))
                .unwrap_or_else(|| hetzner::client::DEFAULT_ENDPOINT.to_string()),
            refresh_interval_ms: opts
                .refresh_interval
                .or(file.refresh_interval)
                .or(env_parse(env, "HETZNER_SD_REFRESH_INTERVAL")?)
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS),
            filter: file.filter.unwrap_or_default(),
            metrics_endpoint: opts
                .metrics_endpoint
                .clone()
                .or(file.metrics_endpoint)
                .or_else(|| env_str(env, "HETZNER_SD_METRICS_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_METRICS_ENDPOINT.to_string()),
            node_port: opts
                .node_port
                .or(file.node_port)
                .or(env_parse(env, "HETZNER_SD_NODE_PORT")?)
                .unwrap_or(DEFAULT_NODE_PORT),
            node_network: opts
                .node_network
                .clone()
                .or(file.node_network)
                .or_else(|| env_str(env, "HETZNER_SD_NODE_NETWORK")),
            node_label_prefix: opts
                .node_label_prefix
                .clone()
                .or(file.node_label_prefix)
                .or_else(|| env_str(env, "HETZNER_SD_NODE_LABEL_PREFIX"))
                .unwrap_or_else(|| DEFAULT_NODE_LABEL_PREFIX.to_string()),
            log_level: opts
                .log_level
                .clone()
                .or(file.log_level)
                .or_else(|| env_str(env, "HETZNER_SD_LOG_LEVEL"))
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            debug: opts.debug
                || file
                    .debug
                    .unwrap_or_else(|| env_flag(env, "HETZNER_SD_DEBUG")),
            auth,
        };

        config.validate()?;

        Ok(config)
    }

    fn cli_auth(opts: &Opts) -> Result<Option<Auth>, ConfigError> {
        let bearer = opts.bearer_token.clone().map(Auth::bearer);
        let basic = opts
            .basic_auth
            .as_deref()
            .map(|credentials| {
                let (user, password) = credentials
                    .split_once(':')
                    .ok_or(ConfigError::InvalidBasicCredentials)?;
                Ok(Auth::basic(user.to_string(), password.to_string()))
            })
            .transpose()?;

        bearer
            .choose_one(&basic)
            .map_err(|_| ConfigError::AmbiguousAuth)
    }

    fn merge_tls(
        opts: &Opts,
        file: Option<TlsConfig>,
        env: &BTreeMap<String, String>,
    ) -> Result<Option<TlsConfig>, ConfigError> {
        let (file_cert, file_key, file_ca) = match file {
            Some(tls) => (Some(tls.cert), Some(tls.key), tls.client_ca),
            None => (None, None, None),
        };

        let cert = opts.tls_cert.clone().or(file_cert);
        let key = opts.tls_key.clone().or(file_key);
        let client_ca = opts
            .m_tls_ca
            .clone()
            .or(file_ca)
            .or_else(|| env_str(env, "HETZNER_SD_MTLS_CA").map(PathBuf::from));

        match (cert, key) {
            (Some(cert), Some(key)) => Ok(Some(TlsConfig {
                cert,
                key,
                client_ca,
            })),
            (None, None) if client_ca.is_some() => Err(ConfigError::IncompleteKeyPair),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteKeyPair),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.is_empty() {
            return Err(ConfigError::MissingApiToken);
        }

        if self.port == 0 {
            return Err(ConfigError::PortOutOfRange);
        }

        if self.hostname.is_empty() || self.hostname.len() > 4096 {
            return Err(ConfigError::InvalidHostname);
        }

        if self.node_port == 0 {
            return Err(ConfigError::NodePortOutOfRange);
        }

        if self.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(ConfigError::RefreshIntervalTooShort);
        }

        let mutual = self
            .tls
            .as_ref()
            .is_some_and(|tls| tls.client_ca.is_some());
        if mutual && !self.https {
            return Err(ConfigError::MutualTlsWithoutHttps);
        }

        if self.https && self.tls.is_none() {
            return Err(ConfigError::HttpsWithoutCertificate);
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// TLS options for the listener, `None` when serving plain HTTP.
    pub fn tls(&self) -> Option<&TlsConfig> {
        if self.https { self.tls.as_ref() } else { None }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.hostname.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::ResolveAddr(format!("{}:{}", self.hostname, self.port)))
    }
}

fn env_str(env: &BTreeMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|value| !value.is_empty()).cloned()
}

fn env_flag(env: &BTreeMap<String, String>, key: &str) -> bool {
    env.get(key).is_some_and(|value| flag_enabled(value))
}

fn env_parse<T: FromStr>(
    env: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env.get(key) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidEnv {
            name: key,
            value: value.clone(),
        }),
    }
}

fn flag_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}
