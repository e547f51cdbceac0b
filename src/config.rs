//! Configuration module for streamwatch.
//!
//! Server settings come from environment variables with sensible defaults;
//! monitored groups are described in a TOML file.

use crate::model::{Key, Stream, StreamType};
use crate::sources;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid parse-name expression: {0}")]
    Regex(#[from] regex::Error),
    #[error("failed to fetch stream list: {0}")]
    Http(#[from] reqwest::Error),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the control API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "streamwatch.db")
    pub db_path: String,
    /// Path to the monitor configuration (default: "streamwatch.toml")
    pub config_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "streamwatch.db".to_string(),
            config_path: "streamwatch.toml".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STREAMWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `STREAMWATCH_DB_PATH`: Database file path (default: "streamwatch.db")
    /// - `STREAMWATCH_CONFIG`: Monitor config path (default: "streamwatch.toml")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("STREAMWATCH_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("STREAMWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(config_path) = env::var("STREAMWATCH_CONFIG") {
            cfg.config_path = config_path;
        }

        cfg
    }
}

/// HTTP method used by probers of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
}

impl HttpMethod {
    fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("head") {
            HttpMethod::Head
        } else {
            HttpMethod::Get
        }
    }
}

/// Probe settings shared by every stream of a group.
#[derive(Debug, Clone)]
pub struct GroupParams {
    pub stream_type: StreamType,
    pub probers: usize,
    pub check_broken_time: Duration,
    pub connect_timeout: Duration,
    pub rw_timeout: Duration,
    pub slow_warning_timeout: Duration,
    pub very_slow_warning_timeout: Duration,
    pub time_between_tasks: Duration,
    pub task_ttl: Duration,
    pub http_method: HttpMethod,
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Http,
            probers: 4,
            check_broken_time: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(3),
            rw_timeout: Duration::from_secs(10),
            slow_warning_timeout: Duration::from_secs(5),
            very_slow_warning_timeout: Duration::from_secs(10),
            time_between_tasks: Duration::from_secs(60),
            task_ttl: Duration::from_secs(60),
            http_method: HttpMethod::Get,
        }
    }
}

/// A group of streams checked with the same settings.
#[derive(Debug, Clone)]
pub struct Group {
    pub key: Key,
    pub name: String,
    pub params: Arc<GroupParams>,
    pub streams: Vec<Arc<Stream>>,
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Always-up resources used by the heartbeat.
    pub samples: Vec<String>,
    pub user_agents: Vec<String>,
    /// How long results and errors are retained.
    pub expire_duration: Duration,
    pub heartbeat_interval: Duration,
    pub groups: Vec<Group>,
}

impl MonitorConfig {
    /// Read and parse the config file, fetching remote stream lists.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&text).await
    }

    pub async fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mut groups = Vec::with_capacity(raw.groups.len());

        for (name, raw_group) in raw.groups {
            let params = raw_group.params();
            if params.stream_type == StreamType::Unknown {
                tracing::warn!("Config: skipping group {} with unknown type {:?}", name, raw_group.stream_type);
                continue;
            }

            let parse_name = match raw_group.parse_name.as_deref() {
                Some(re) if !re.is_empty() => Some(regex::Regex::new(re)?),
                _ => None,
            };

            let mut streams = sources::local_streams(
                &raw_group.streams,
                params.stream_type,
                &name,
                parse_name.as_ref(),
            );
            if let Some(uri) = &raw_group.streams_uri {
                let auth = raw_group.user.as_deref().map(|u| (u, raw_group.pass.as_deref()));
                match sources::fetch_remote_streams(uri, auth, params.stream_type, &name, parse_name.as_ref()).await {
                    Ok(remote) => streams.extend(remote),
                    Err(e) => tracing::error!("Config: failed to load remote list for group {}: {}", name, e),
                }
            }

            groups.push(Group {
                key: Key::of(&name),
                name,
                params: Arc::new(params),
                streams: streams.into_iter().map(Arc::new).collect(),
            });
        }

        Ok(Self {
            samples: raw.samples,
            user_agents: raw.user_agents,
            expire_duration: Duration::from_secs(raw.db_expired_hours * 3600),
            heartbeat_interval: Duration::from_secs(raw.heartbeat_interval.max(1)),
            groups,
        })
    }

    pub fn group(&self, key: &Key) -> Option<&Group> {
        self.groups.iter().find(|g| g.key == *key)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    samples: Vec<String>,
    #[serde(default)]
    user_agents: Vec<String>,
    #[serde(default = "default_expired_hours")]
    db_expired_hours: u64,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval: u64,
    #[serde(default)]
    groups: BTreeMap<String, RawGroup>,
}

fn default_expired_hours() -> u64 {
    24
}

fn default_heartbeat_interval() -> u64 {
    4
}

/// Group as written in the file. Durations are in seconds.
#[derive(Debug, Deserialize)]
struct RawGroup {
    #[serde(rename = "type")]
    stream_type: String,
    #[serde(default)]
    streams: Vec<String>,
    streams_uri: Option<String>,
    user: Option<String>,
    pass: Option<String>,
    probers: Option<usize>,
    check_broken_time: Option<u64>,
    connect_timeout: Option<u64>,
    rw_timeout: Option<u64>,
    slow_warning_timeout: Option<u64>,
    very_slow_warning_timeout: Option<u64>,
    time_between_tasks: Option<u64>,
    task_ttl: Option<u64>,
    http_method: Option<String>,
    parse_name: Option<String>,
}

impl RawGroup {
    fn params(&self) -> GroupParams {
        let d = GroupParams::default();
        let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);

        GroupParams {
            stream_type: self.stream_type.parse().unwrap_or(StreamType::Unknown),
            probers: self.probers.unwrap_or(d.probers).max(1),
            check_broken_time: secs(self.check_broken_time, d.check_broken_time),
            connect_timeout: secs(self.connect_timeout, d.connect_timeout),
            rw_timeout: secs(self.rw_timeout, d.rw_timeout),
            slow_warning_timeout: secs(self.slow_warning_timeout, d.slow_warning_timeout),
            very_slow_warning_timeout: secs(self.very_slow_warning_timeout, d.very_slow_warning_timeout),
            time_between_tasks: secs(self.time_between_tasks, d.time_between_tasks),
            task_ttl: secs(self.task_ttl, d.task_ttl),
            http_method: self.http_method.as_deref().map(HttpMethod::parse).unwrap_or_default(),
        }
    }
}
