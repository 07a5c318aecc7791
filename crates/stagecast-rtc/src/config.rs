use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::logging::{LogConfig, LogLevel};
use crate::retry::BackoffPolicy;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// A traversal server descriptor as supplied by the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid traversal server url {0}")]
    InvalidServerUrl(String),
    #[error("relay server {0} requires a username and credential")]
    MissingCredentials(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Tunable thresholds and the traversal-server list used by both roles.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub ice_servers: Vec<IceServer>,
    pub connection_timeout: Duration,
    pub poll_interval: Duration,
    pub candidate_buffer_timeout: Duration,
    pub max_candidate_retries: u32,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub stuck_connection_window: Duration,
    pub sweep_interval: Duration,
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
    pub log: LogConfig,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            connection_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            candidate_buffer_timeout: Duration::from_secs(5),
            max_candidate_retries: 3,
            max_reconnect_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            stuck_connection_window: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(15),
            ice_disconnected_timeout: Duration::from_secs(5),
            ice_failed_timeout: Duration::from_secs(25),
            ice_keepalive_interval: Duration::from_secs(2),
            log: LogConfig::default(),
        }
    }
}

/// On-disk shape; every field is optional and falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    ice_servers: Option<Vec<IceServer>>,
    connection_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    candidate_buffer_timeout_ms: Option<u64>,
    max_candidate_retries: Option<u32>,
    max_reconnect_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    stuck_connection_window_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    ice_disconnected_timeout_ms: Option<u64>,
    ice_failed_timeout_ms: Option<u64>,
    ice_keepalive_interval_ms: Option<u64>,
    log: Option<LogSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogSection {
    level: Option<String>,
    file: Option<PathBuf>,
}

impl HandshakeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = Self::default();
        config.merge_file(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, then lets `STAGECAST_*` variables override it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text)?;
        let mut config = Self::default();
        config.merge_file(file)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn builder() -> HandshakeConfigBuilder {
        HandshakeConfigBuilder::new()
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_reconnect_attempts, self.backoff_base, self.backoff_cap)
    }

    /// Number of establishment polls that fit in the connection timeout.
    pub fn max_polls(&self) -> u32 {
        let polls = self.connection_timeout.as_millis() / self.poll_interval.as_millis().max(1);
        polls.clamp(1, u32::MAX as u128) as u32
    }

    fn merge_file(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        if let Some(servers) = file.ice_servers {
            self.ice_servers = servers;
        }
        merge_ms(&mut self.connection_timeout, file.connection_timeout_ms);
        merge_ms(&mut self.poll_interval, file.poll_interval_ms);
        merge_ms(&mut self.candidate_buffer_timeout, file.candidate_buffer_timeout_ms);
        merge_ms(&mut self.backoff_base, file.backoff_base_ms);
        merge_ms(&mut self.backoff_cap, file.backoff_cap_ms);
        merge_ms(&mut self.stuck_connection_window, file.stuck_connection_window_ms);
        merge_ms(&mut self.sweep_interval, file.sweep_interval_ms);
        merge_ms(&mut self.ice_disconnected_timeout, file.ice_disconnected_timeout_ms);
        merge_ms(&mut self.ice_failed_timeout, file.ice_failed_timeout_ms);
        merge_ms(&mut self.ice_keepalive_interval, file.ice_keepalive_interval_ms);
        if let Some(retries) = file.max_candidate_retries {
            self.max_candidate_retries = retries;
        }
        if let Some(attempts) = file.max_reconnect_attempts {
            self.max_reconnect_attempts = attempts;
        }
        if let Some(log) = file.log {
            if let Some(level) = log.level {
                self.log.level = level.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "log.level",
                    value: level.clone(),
                })?;
            }
            if log.file.is_some() {
                self.log.file = log.file;
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if env_flag("STAGECAST_LOCALHOST_ONLY") {
            self.ice_servers.clear();
        } else if let Ok(urls) = std::env::var("STAGECAST_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                self.ice_servers = urls.into_iter().map(IceServer::stun).collect();
            }
        }
        env_ms("STAGECAST_CONNECTION_TIMEOUT_MS", &mut self.connection_timeout)?;
        env_ms("STAGECAST_POLL_INTERVAL_MS", &mut self.poll_interval)?;
        env_ms("STAGECAST_CANDIDATE_BUFFER_TIMEOUT_MS", &mut self.candidate_buffer_timeout)?;
        env_ms("STAGECAST_BACKOFF_BASE_MS", &mut self.backoff_base)?;
        env_ms("STAGECAST_BACKOFF_CAP_MS", &mut self.backoff_cap)?;
        env_ms("STAGECAST_SWEEP_INTERVAL_MS", &mut self.sweep_interval)?;
        if let Some(attempts) = env_number("STAGECAST_MAX_RECONNECT_ATTEMPTS")? {
            self.max_reconnect_attempts =
                u32::try_from(attempts).map_err(|_| ConfigError::InvalidValue {
                    field: "STAGECAST_MAX_RECONNECT_ATTEMPTS",
                    value: attempts.to_string(),
                })?;
        }
        if let Ok(level) = std::env::var("STAGECAST_LOG_LEVEL") {
            self.log.level = level.parse().map_err(|_| ConfigError::InvalidValue {
                field: "STAGECAST_LOG_LEVEL",
                value: level.clone(),
            })?;
        }
        Ok(())
    }

    /// Checks invariants and removes duplicate server urls in place.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.ice_servers = dedupe_ice_servers(std::mem::take(&mut self.ice_servers));
        for server in &self.ice_servers {
            for url in &server.urls {
                check_server_url(url)?;
            }
            if server.is_relay() && (server.username.is_none() || server.credential.is_none()) {
                return Err(ConfigError::MissingCredentials(server.urls.join(",")));
            }
        }
        let durations = [
            ("connection_timeout", self.connection_timeout),
            ("poll_interval", self.poll_interval),
            ("candidate_buffer_timeout", self.candidate_buffer_timeout),
            ("backoff_base", self.backoff_base),
            ("stuck_connection_window", self.stuck_connection_window),
            ("sweep_interval", self.sweep_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    value: "0ms".into(),
                });
            }
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::InvalidValue {
                field: "backoff_cap",
                value: format!("{}ms", self.backoff_cap.as_millis()),
            });
        }
        Ok(())
    }
}

/// Keeps the first occurrence of each url, preserving order, and drops
/// servers left without any url.
pub fn dedupe_ice_servers(servers: Vec<IceServer>) -> Vec<IceServer> {
    let mut seen = HashSet::new();
    servers
        .into_iter()
        .filter_map(|mut server| {
            server.urls.retain(|url| seen.insert(url.clone()));
            (!server.urls.is_empty()).then_some(server)
        })
        .collect()
}

fn check_server_url(url: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|_| ConfigError::InvalidServerUrl(url.to_string()))?;
    match parsed.scheme() {
        "stun" | "stuns" | "turn" | "turns" if !parsed.path().is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidServerUrl(url.to_string())),
    }
}

fn merge_ms(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false)
}

fn env_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { field: var, value }),
        _ => Ok(None),
    }
}

fn env_ms(var: &'static str, target: &mut Duration) -> Result<(), ConfigError> {
    merge_ms(target, env_number(var)?);
    Ok(())
}

/// Builder for [`HandshakeConfig`].
pub struct HandshakeConfigBuilder {
    config: HandshakeConfig,
    ice_servers: Vec<IceServer>,
}

impl HandshakeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HandshakeConfig::default(),
            ice_servers: vec![],
        }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: None,
            credential: None,
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    /// No traversal servers at all; host candidates only.
    pub fn localhost_only(mut self) -> Self {
        self.ice_servers.clear();
        self.config.ice_servers.clear();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn candidate_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.config.candidate_buffer_timeout = timeout;
        self
    }

    pub fn max_candidate_retries(mut self, retries: u32) -> Self {
        self.config.max_candidate_retries = retries;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.config.backoff_base = base;
        self.config.backoff_cap = cap;
        self
    }

    pub fn stuck_connection_window(mut self, window: Duration) -> Self {
        self.config.stuck_connection_window = window;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    pub fn build(self) -> Result<HandshakeConfig, ConfigError> {
        let mut config = self.config;
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        config.validate()?;
        Ok(config)
    }
}

impl Default for HandshakeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-wide; serialize the tests touching them.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = HandshakeConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.candidate_buffer_timeout, Duration::from_secs(5));
        assert_eq!(config.max_candidate_retries, 3);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.max_polls(), 60);
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_URL)]);
    }

    #[test]
    fn duplicate_urls_are_removed_in_order() {
        let servers = vec![
            IceServer {
                urls: vec!["stun:a.example:3478".into(), "stun:b.example:3478".into()],
                username: None,
                credential: None,
            },
            IceServer::stun("stun:a.example:3478"),
            IceServer::turn("turn:relay.example:3478", "user", "secret"),
        ];
        let deduped = dedupe_ice_servers(servers);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].urls, vec!["stun:a.example:3478", "stun:b.example:3478"]);
        assert_eq!(deduped[1].urls, vec!["turn:relay.example:3478"]);
    }

    #[test]
    fn toml_overrides_thresholds_and_servers() {
        let config = HandshakeConfig::from_toml_str(
            r#"
            connection_timeout_ms = 10000
            max_reconnect_attempts = 5

            [[ice_servers]]
            urls = ["stun:stun.example.org:3478"]

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "stage"
            credential = "cast"

            [log]
            level = "debug"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = HandshakeConfig::from_toml_str(
            r#"
            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentials(_)));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = HandshakeConfig::builder()
            .add_ice_server(vec!["https://stun.example.org".into()])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidServerUrl(_)));
    }

    #[test]
    fn builder_rejects_cap_below_base() {
        let err = HandshakeConfig::builder()
            .backoff(Duration::from_secs(4), Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "backoff_cap", .. }));
    }

    #[test]
    fn localhost_only_env_clears_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("STAGECAST_LOCALHOST_ONLY", "1");
            std::env::set_var("STAGECAST_CONNECTION_TIMEOUT_MS", "1500");
        }
        let config = HandshakeConfig::from_env();
        unsafe {
            std::env::remove_var("STAGECAST_LOCALHOST_ONLY");
            std::env::remove_var("STAGECAST_CONNECTION_TIMEOUT_MS");
        }
        let config = config.expect("valid env config");
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.connection_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn malformed_env_number_is_reported() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("STAGECAST_MAX_RECONNECT_ATTEMPTS", "many");
        }
        let result = HandshakeConfig::from_env();
        unsafe {
            std::env::remove_var("STAGECAST_MAX_RECONNECT_ATTEMPTS");
        }
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                field: "STAGECAST_MAX_RECONNECT_ATTEMPTS",
                ..
            })
        ));
    }

    #[test]
    fn reconnect_attempts_beyond_u32_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("STAGECAST_MAX_RECONNECT_ATTEMPTS", "4294967296");
        }
        let result = HandshakeConfig::from_env();
        unsafe {
            std::env::remove_var("STAGECAST_MAX_RECONNECT_ATTEMPTS");
        }
        match result {
            Err(ConfigError::InvalidValue { field, value }) => {
                assert_eq!(field, "STAGECAST_MAX_RECONNECT_ATTEMPTS");
                assert_eq!(value, "4294967296");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }
}
