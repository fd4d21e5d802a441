use crate::logging::LoggingConfig;
use duration_str::deserialize_duration;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variables read once at startup. Everything else lives in
/// the configuration file.
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_TUNNEL_ID: &str = "TUNNEL_ID";
pub const ENV_MASTER_KEY_FILE: &str = "SC_MASTER_KEY_FILE";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_URL: &str = "sqlite://supervisor-control.db";
const DEFAULT_CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_TUNNEL_BINARY: &str = "cloudflared";
const DEFAULT_TUNNEL_METRICS_PORT: u16 = 20241;

const fn default_docker_poll_interval() -> Duration {
    Duration::from_secs(60)
}
const fn default_tunnel_check_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config file `{path}`: {err}")]
    Read { path: String, err: String },

    #[error("error parsing config: `{0}`")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid project name `{0}`: must be a lowercase slug")]
    InvalidProjectName(String),

    #[error("duplicated project `{0}`")]
    DuplicatedProject(String),

    #[error("project `{project}` references unknown port range `{range}`")]
    UnknownPortRange { project: String, range: String },

    #[error("port ranges `{0}` and `{1}` overlap")]
    OverlappingRanges(String, String),

    #[error("port range `{name}` is empty: start {start} > end {end}")]
    EmptyRange { name: String, start: u16, end: u16 },

    #[error("invalid `{var}` value `{value}`: {err}")]
    InvalidEnvValue {
        var: String,
        value: String,
        err: String,
    },
}

/// Top-level configuration of the control plane, loaded from a YAML file
/// with a handful of environment overrides applied on top.
#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub log: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    #[serde(default)]
    pub port_ranges: Vec<PortRangeConfig>,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> IpAddr {
    DEFAULT_HOST.parse().expect("default host must parse")
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Default)]
pub struct CryptoConfig {
    /// Path of the file holding the master key (hex or base64). Overridden
    /// by `SC_MASTER_KEY_FILE`.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct TunnelConfig {
    /// Tunnel UUID as registered with the edge.
    pub id: String,
    /// Path of the ingress YAML the tunnel binary reads.
    pub config_file: PathBuf,
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    /// Local metrics/ready port of the tunnel binary, used for liveness pings.
    #[serde(default = "default_tunnel_metrics_port")]
    pub metrics_port: u16,
    #[serde(
        default = "default_tunnel_check_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub check_interval: Duration,
}

fn default_tunnel_binary() -> String {
    DEFAULT_TUNNEL_BINARY.to_string()
}
fn default_tunnel_metrics_port() -> u16 {
    DEFAULT_TUNNEL_METRICS_PORT
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct DockerConfig {
    #[serde(
        default = "default_docker_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_docker_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct CloudflareConfig {
    #[serde(default = "default_cloudflare_api_base")]
    pub api_base: String,
    /// Domain used when a CNAME request does not name one.
    pub default_domain: Option<String>,
}

fn default_cloudflare_api_base() -> String {
    DEFAULT_CLOUDFLARE_API_BASE.to_string()
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_base: default_cloudflare_api_base(),
            default_domain: None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct PortRangeConfig {
    pub name: String,
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub working_dir: PathBuf,
    pub port_range: String,
    /// Tool names this project may call, besides the global ones.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl ControlPlaneConfig {
    /// Loads the configuration from `path`, applies environment overrides
    /// and validates cross-field invariants.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            err: err.to_string(),
        })?;
        let mut config: ControlPlaneConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var(ENV_HOST) {
            self.server.host = host.parse().map_err(|err: std::net::AddrParseError| {
                ConfigError::InvalidEnvValue {
                    var: ENV_HOST.to_string(),
                    value: host.clone(),
                    err: err.to_string(),
                }
            })?;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            self.server.port =
                port.parse()
                    .map_err(|err: std::num::ParseIntError| ConfigError::InvalidEnvValue {
                        var: ENV_PORT.to_string(),
                        value: port.clone(),
                        err: err.to_string(),
                    })?;
        }
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Ok(id) = std::env::var(ENV_TUNNEL_ID) {
            self.tunnel.id = id;
        }
        if let Ok(key_file) = std::env::var(ENV_MASTER_KEY_FILE) {
            self.crypto.key_file = Some(PathBuf::from(key_file));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let slug = Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("slug regex must compile");

        let mut seen = HashSet::new();
        let range_names: HashSet<&str> =
            self.port_ranges.iter().map(|r| r.name.as_str()).collect();

        for project in &self.projects {
            if !slug.is_match(&project.name) {
                return Err(ConfigError::InvalidProjectName(project.name.clone()));
            }
            if !seen.insert(project.name.as_str()) {
                return Err(ConfigError::DuplicatedProject(project.name.clone()));
            }
            if !range_names.contains(project.port_range.as_str()) {
                return Err(ConfigError::UnknownPortRange {
                    project: project.name.clone(),
                    range: project.port_range.clone(),
                });
            }
        }

        for range in &self.port_ranges {
            if range.start > range.end {
                return Err(ConfigError::EmptyRange {
                    name: range.name.clone(),
                    start: range.start,
                    end: range.end,
                });
            }
        }
        for (i, a) in self.port_ranges.iter().enumerate() {
            for b in self.port_ranges.iter().skip(i + 1) {
                if a.start <= b.end && b.start <= a.end {
                    return Err(ConfigError::OverlappingRanges(
                        a.name.clone(),
                        b.name.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }
}
