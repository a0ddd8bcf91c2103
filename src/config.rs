use async_trait::async_trait;
use dashmap::DashMap;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIDENCE_FLOOR_KEY: &str = "TOPIC_CONFIDENCE_FLOOR";
pub const HISTORY_CAPACITY_KEY: &str = "TOPIC_EVENT_HISTORY";
pub const SUBTOPIC_TIMEOUT_KEY: &str = "TOPIC_SUBTOPIC_TIMEOUT_SECS";
pub const TERMINATE_TIMEOUT_KEY: &str = "TOPIC_TERMINATE_TIMEOUT_SECS";
pub const DEFAULT_TOPIC_KEY: &str = "TOPIC_DEFAULT_NAME";
pub const MAX_HANDOFF_DEPTH_KEY: &str = "TOPIC_MAX_HANDOFF_DEPTH";
pub const SESSION_TTL_KEY: &str = "TOPIC_SESSION_TTL_SECS";

/// Upper bound for a sub-topic hand-down window (30 days).
pub const MAX_SUBTOPIC_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("could not update {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key/value source of configuration strings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!(path = %env_file.display(), "loaded .env");
        } else {
            debug!(path = %env_file.display(), "no .env file, using process environment");
        }
        Box::new(Self { env_file })
    }

    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            let matches = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
            if !matches {
                lines.push(line.to_string());
                continue;
            }
            found = true;
            if let Some(value) = value {
                lines.push(format!("{key}={value}"));
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|source| ConfigError::Io {
            path: self.env_file.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(err) = self.rewrite_env_file(key, None) {
                warn!(error = %err, "could not remove key from .env");
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// In-memory configuration, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        mgr
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Tunables of the routing and hand-down machinery.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Routing falls back to the default topic below this confidence.
    pub confidence_floor: f32,
    pub history_capacity: usize,
    /// How long a parent waits for a sub-topic it handed down to.
    pub subtopic_timeout: Duration,
    pub terminate_timeout: Duration,
    pub default_topic: String,
    pub max_handoff_depth: usize,
    pub session_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            history_capacity: 1000,
            subtopic_timeout: Duration::from_secs(300),
            terminate_timeout: Duration::from_secs(5),
            default_topic: "Default".to_string(),
            max_handoff_depth: 8,
            session_ttl_secs: 1800,
        }
    }
}

impl OrchestratorConfig {
    /// Reads every tunable from `config`; missing keys keep their default.
    pub async fn from_manager(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let source = config.0.as_ref();

        let confidence_floor: f32 = parse_or(source, CONFIDENCE_FLOOR_KEY, defaults.confidence_floor).await?;
        if !(0.0..=1.0).contains(&confidence_floor) {
            return Err(invalid(CONFIDENCE_FLOOR_KEY, confidence_floor, "must be within [0, 1]"));
        }

        let history_capacity: usize = parse_or(source, HISTORY_CAPACITY_KEY, defaults.history_capacity).await?;
        if history_capacity == 0 {
            return Err(invalid(HISTORY_CAPACITY_KEY, history_capacity, "must be greater than zero"));
        }

        let max_handoff_depth: usize = parse_or(source, MAX_HANDOFF_DEPTH_KEY, defaults.max_handoff_depth).await?;
        if max_handoff_depth == 0 {
            return Err(invalid(MAX_HANDOFF_DEPTH_KEY, max_handoff_depth, "must be greater than zero"));
        }

        let subtopic_secs: u64 = parse_or(source, SUBTOPIC_TIMEOUT_KEY, defaults.subtopic_timeout.as_secs()).await?;
        if subtopic_secs > MAX_SUBTOPIC_TIMEOUT_SECS {
            return Err(invalid(SUBTOPIC_TIMEOUT_KEY, subtopic_secs, "must be at most 30 days"));
        }
        let terminate_secs: u64 =
            parse_or(source, TERMINATE_TIMEOUT_KEY, defaults.terminate_timeout.as_secs()).await?;
        let session_ttl_secs: u64 = parse_or(source, SESSION_TTL_KEY, defaults.session_ttl_secs).await?;

        let default_topic = match source.get(DEFAULT_TOPIC_KEY).await {
            Some(name) if name.trim().is_empty() => {
                return Err(invalid(DEFAULT_TOPIC_KEY, name, "must not be empty"));
            }
            Some(name) => name.trim().to_string(),
            None => defaults.default_topic,
        };

        Ok(Self {
            confidence_floor,
            history_capacity,
            subtopic_timeout: Duration::from_secs(subtopic_secs),
            terminate_timeout: Duration::from_secs(terminate_secs),
            default_topic,
            max_handoff_depth,
            session_ttl_secs,
        })
    }
}

async fn parse_or<T>(source: &dyn ConfigManagerType, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.get(key).await {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| invalid(key, &raw, e)),
    }
}

fn invalid(key: &str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
