//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum connections in the mapping store pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default buffer size of the lock event channel
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Environment variables that override `database.url`, highest priority first
const URL_OVERRIDES: [&str; 2] = ["ENTITY_LOCK_DATABASE_URL", "DATABASE_URL"];

/// entity-lock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub locking: LockingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL for the mapping store and lock broker
    pub url: String,
    /// Maximum number of pooled mapping store connections
    pub max_connections: u32,
    /// Whether to run schema migrations on connect
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Deadline applied to acquires that do not pass one; `None` waits forever
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,
    /// Buffer size of the lock event channel
    pub event_capacity: usize,
}

/// Backend selected by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/entity_lock".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_migrate: true,
        }
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl DatabaseConfig {
    /// Create a database config for the given URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Effective URL: `ENTITY_LOCK_DATABASE_URL`, then `DATABASE_URL`, then the file value
    pub fn resolved_url(&self) -> String {
        Self::url_override()
            .map(|(_, url)| url)
            .unwrap_or_else(|| self.url.clone())
    }

    /// The environment override in effect, as (variable, url)
    pub fn url_override() -> Option<(&'static str, String)> {
        URL_OVERRIDES
            .iter()
            .find_map(|var| env::var(var).ok().map(|url| (*var, url)))
    }

    /// Pick the backend from the URL scheme
    pub fn backend(&self) -> anyhow::Result<Backend> {
        backend_for_url(&self.resolved_url())
    }

    /// The URL with any password replaced, for logs and CLI output
    pub fn redacted_url(&self) -> String {
        redact_url(&self.resolved_url())
    }

    /// Redacted effective URL, naming the variable it came from when overridden
    fn describe_url(&self, url_override: Option<&(&str, String)>) -> String {
        match url_override {
            Some((var, url)) => format!("{} (from {})", redact_url(url), var),
            None => redact_url(&self.url),
        }
    }

    /// Both the file URL and the effective URL must name a supported backend
    fn check_urls(&self, url_override: Option<&(&str, String)>) -> anyhow::Result<()> {
        backend_for_url(&self.url).context("Invalid database.url")?;
        if let Some((var, url)) = url_override {
            backend_for_url(url).with_context(|| format!("Invalid {}", var))?;
        }
        Ok(())
    }
}

impl LockingConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

/// Pick the backend from a connection URL
pub fn backend_for_url(url: &str) -> anyhow::Result<Backend> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Backend::Postgres)
    } else if url.starts_with("sqlite:") {
        Ok(Backend::Sqlite)
    } else {
        Err(anyhow!(
            "Unsupported database URL scheme: {}. Use postgres:// or sqlite:",
            redact_url(url)
        ))
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => url.to_string(),
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ENTITY_LOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("entity-lock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("entity-lock.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be at least 1"));
        }
        if self.locking.default_deadline_ms == Some(0) {
            return Err(anyhow!(
                "locking.default_deadline_ms must be positive; remove it to wait without a deadline"
            ));
        }
        if self.locking.event_capacity == 0 {
            return Err(anyhow!("locking.event_capacity must be at least 1"));
        }
        self.database
            .check_urls(DatabaseConfig::url_override().as_ref())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "database.url" => Ok(self
                .database
                .describe_url(DatabaseConfig::url_override().as_ref())),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.auto_migrate" => Ok(self.database.auto_migrate.to_string()),
            "locking.default_deadline_ms" => Ok(self
                .locking
                .default_deadline_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "(none - wait without deadline)".to_string())),
            "locking.event_capacity" => Ok(self.locking.event_capacity.to_string()),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `entity-lock config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "database.url" => {
                backend_for_url(value)?;
                self.database.url = value.to_string();
            }
            "database.max_connections" => {
                let max: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid max_connections value: {}", value))?;
                if max == 0 {
                    return Err(anyhow!("max_connections must be at least 1"));
                }
                self.database.max_connections = max;
            }
            "database.auto_migrate" => {
                self.database.auto_migrate = value
                    .parse()
                    .with_context(|| format!("Invalid auto_migrate value: {}", value))?;
            }
            "locking.default_deadline_ms" => {
                if value.is_empty() || value == "none" {
                    self.locking.default_deadline_ms = None;
                } else {
                    let ms: u64 = value
                        .parse()
                        .with_context(|| format!("Invalid default_deadline_ms value: {}", value))?;
                    if ms == 0 {
                        return Err(anyhow!("default_deadline_ms must be positive"));
                    }
                    self.locking.default_deadline_ms = Some(ms);
                }
            }
            "locking.event_capacity" => {
                let capacity: usize = value
                    .parse()
                    .with_context(|| format!("Invalid event_capacity value: {}", value))?;
                if capacity == 0 {
                    return Err(anyhow!("event_capacity must be at least 1"));
                }
                self.locking.event_capacity = capacity;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `entity-lock config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = vec![
            "database.url",
            "database.max_connections",
            "database.auto_migrate",
            "locking.default_deadline_ms",
            "locking.event_capacity",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.locking.default_deadline(), None);
        assert_eq!(backend_for_url(&config.database.url).unwrap(), Backend::Postgres);
    }

    #[test]
    fn test_backend_detection() {
        assert_eq!(
            backend_for_url("postgresql://u:p@db/locks").unwrap(),
            Backend::Postgres
        );
        assert_eq!(backend_for_url("sqlite::memory:").unwrap(), Backend::Sqlite);
        assert!(backend_for_url("mysql://db/locks").is_err());
    }

    #[test]
    fn test_redact_url_hides_password() {
        assert_eq!(
            redact_url("postgres://locker:hunter2@db:5432/locks"),
            "postgres://locker:***@db:5432/locks"
        );
        assert_eq!(redact_url("postgres://db/locks"), "postgres://db/locks");
        assert_eq!(redact_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("locking.default_deadline_ms", "1500").unwrap();
        assert_eq!(
            config.locking.default_deadline(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.get("locking.default_deadline_ms").unwrap(), "1500");

        config.set("locking.default_deadline_ms", "none").unwrap();
        assert_eq!(config.locking.default_deadline_ms, None);

        config.set("database.max_connections", "12").unwrap();
        assert_eq!(config.database.max_connections, 12);
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("database.max_connections", "0").is_err());
        assert!(config.set("locking.default_deadline_ms", "0").is_err());
        assert!(config.set("locking.event_capacity", "abc").is_err());
        assert!(config.set("database.url", "redis://cache").is_err());
        assert!(config.set("no.such.key", "1").is_err());
    }

    #[test]
    fn test_env_override_is_reported_and_validated() {
        let config = DatabaseConfig::with_url("postgres://locker:hunter2@db/locks");
        let sqlite = ("ENTITY_LOCK_DATABASE_URL", "sqlite:/tmp/locks.db".to_string());
        let broken = ("DATABASE_URL", "mysql://root:secret@db/locks".to_string());

        assert_eq!(config.describe_url(None), "postgres://locker:***@db/locks");
        assert_eq!(
            config.describe_url(Some(&sqlite)),
            "sqlite:/tmp/locks.db (from ENTITY_LOCK_DATABASE_URL)"
        );

        assert!(config.check_urls(None).is_ok());
        assert!(config.check_urls(Some(&sqlite)).is_ok());
        let err = config.check_urls(Some(&broken)).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
        assert!(!format!("{:#}", err).contains("secret"));

        let bad_file = DatabaseConfig::with_url("redis://cache");
        assert!(bad_file.check_urls(Some(&sqlite)).is_err());
    }

    #[test]
    fn test_list_covers_all_keys() {
        let listed = Config::default().list().unwrap();
        assert_eq!(listed.len(), 5);
        assert!(listed.iter().any(|(k, _)| k == "locking.event_capacity"));
    }

    #[test]
    fn test_toml_round_trip_keeps_optional_deadline() {
        let mut config = Config::default();
        config.locking.default_deadline_ms = Some(250);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.locking.default_deadline_ms, Some(250));

        let without_deadline = r#"
            [database]
            url = "sqlite::memory:"
            max_connections = 1
            auto_migrate = true

            [locking]
            event_capacity = 16
        "#;
        let parsed: Config = toml::from_str(without_deadline).unwrap();
        assert_eq!(parsed.locking.default_deadline_ms, None);
        parsed.validate().unwrap();
    }
}
