//! Configuration management for Autopost

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::types::Platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub tokens: TokenConfig,

    #[serde(default)]
    pub enforcer: EnforcerConfig,

    /// Keyed by platform name (`x`, `linkedin`, `facebook`, `instagram`, `tiktok`)
    #[serde(default)]
    pub platforms: HashMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/autopost/autopost.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

/// Publishing queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent publish workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a claimed post stays leased to its worker
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Upper bound on a single platform call
    ///
    /// Two calls and a credential refresh must fit in one lease.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// Floor between two attempts of the same post
    #[serde(default = "default_min_retry_delay_ms")]
    pub min_retry_delay_ms: u64,

    /// Delay before the second attempt; doubles with each further attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Idle workers re-check for due posts at least this often
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_secs: default_lease_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            min_retry_delay_ms: default_min_retry_delay_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_workers() -> usize {
    3
}

fn default_lease_secs() -> u64 {
    120
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_min_retry_delay_ms() -> u64 {
    2_000
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Credentials expiring within this window are refreshed before use
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_window_secs: default_refresh_window_secs(),
        }
    }
}

impl TokenConfig {
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }
}

fn default_refresh_window_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How long before cycle end the cycle-ending warning is raised
    #[serde(default = "default_warning_window_hours")]
    pub warning_window_hours: u64,

    /// Inside the warning window, admit posts targeted after the cycle end
    #[serde(default = "default_true")]
    pub publish_before_cycle_end: bool,

    /// Most posts admitted per subscriber in one pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            warning_window_hours: default_warning_window_hours(),
            publish_before_cycle_end: true,
            batch_size: default_batch_size(),
        }
    }
}

impl EnforcerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn warning_window_ms(&self) -> i64 {
        (self.warning_window_hours * 3600 * 1000) as i64
    }
}

fn default_interval_secs() -> u64 {
    60
}

fn default_warning_window_hours() -> u64 {
    48
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Per-platform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Overrides the platform's public API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Overrides the OAuth token endpoint
    #[serde(default)]
    pub token_url: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            requests_per_minute: default_requests_per_minute(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: every section has defaults.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            debug!(path = %config_path.display(), "No configuration file, using defaults");
            return Self::from_toml("");
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text, then apply environment overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("AUTOPOST_DB_PATH") {
            if !db_path.is_empty() {
                config.database.path = db_path;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Settings for one platform, if the file names it
    pub fn platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        self.platforms.get(platform.as_str())
    }

    /// Database path with `~` expanded
    pub fn db_path(&self) -> String {
        shellexpand::tilde(&self.database.path).to_string()
    }

    fn validate(&self) -> Result<()> {
        for name in self.platforms.keys() {
            let platform: Platform = name.parse().map_err(ConfigError::Invalid)?;
            if platform.as_str() != name {
                return Err(ConfigError::Invalid(format!(
                    "Platform section '{}' must be named '{}'",
                    name, platform
                ))
                .into());
            }
        }

        for (name, platform) in &self.platforms {
            if platform.requests_per_minute == 0 {
                return Err(ConfigError::Invalid(format!(
                    "platforms.{}.requests_per_minute must be at least 1",
                    name
                ))
                .into());
            }
        }

        let queue = &self.queue;
        if queue.workers == 0 {
            return Err(ConfigError::Invalid("queue.workers must be at least 1".to_string()).into());
        }
        if queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".to_string()).into());
        }
        // Worst case for one attempt: rejected call, refresh request, second call
        let refresh_secs = self
            .platforms
            .values()
            .map(|p| p.timeout_secs)
            .max()
            .unwrap_or_else(default_timeout_secs);
        let worst_case_secs = queue
            .publish_timeout_secs
            .saturating_mul(2)
            .saturating_add(refresh_secs);
        if worst_case_secs >= queue.lease_secs {
            return Err(ConfigError::Invalid(format!(
                "queue.lease_secs ({}) must exceed two publish timeouts plus a refresh ({}s)",
                queue.lease_secs, worst_case_secs
            ))
            .into());
        }
        if queue.max_delay_ms < queue.base_delay_ms {
            return Err(ConfigError::Invalid(
                "queue.max_delay_ms must not be less than queue.base_delay_ms".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autopost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutopostError;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        std::env::remove_var("AUTOPOST_DB_PATH");
        let config = Config::from_toml(
            r#"
[database]
path = "/tmp/autopost-test.db"
"#,
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/autopost-test.db");
        assert_eq!(config.queue.workers, 3);
        assert_eq!(config.queue.lease_secs, 120);
        assert_eq!(config.queue.publish_timeout_secs, 30);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.tokens.refresh_window_secs, 300);
        assert_eq!(config.enforcer.interval_secs, 60);
        assert_eq!(config.enforcer.warning_window_hours, 48);
        assert!(config.enforcer.publish_before_cycle_end);
        assert!(config.platforms.is_empty());
    }

    #[test]
    #[serial]
    fn test_platform_sections() {
        std::env::remove_var("AUTOPOST_DB_PATH");
        let config = Config::from_toml(
            r#"
[platforms.linkedin]
enabled = true
client_id = "li-client"
requests_per_minute = 20

[platforms.tiktok]
enabled = false
base_url = "http://localhost:9000"
"#,
        )
        .unwrap();

        let linkedin = config.platform(Platform::LinkedIn).unwrap();
        assert!(linkedin.enabled);
        assert_eq!(linkedin.client_id.as_deref(), Some("li-client"));
        assert_eq!(linkedin.requests_per_minute, 20);
        assert_eq!(linkedin.timeout_secs, 30);

        let tiktok = config.platform(Platform::TikTok).unwrap();
        assert!(!tiktok.enabled);
        assert_eq!(tiktok.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(tiktok.requests_per_minute, 60);

        assert!(config.platform(Platform::X).is_none());
    }

    #[test]
    #[serial]
    fn test_unknown_platform_section_is_rejected() {
        let result = Config::from_toml("[platforms.myspace]\nenabled = true\n");
        match result {
            Err(AutopostError::Config(ConfigError::Invalid(msg))) => {
                assert!(msg.contains("myspace"))
            }
            other => panic!("Expected invalid config, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_alias_platform_section_is_rejected() {
        let result = Config::from_toml("[platforms.twitter]\nenabled = true\n");
        assert!(matches!(
            result,
            Err(AutopostError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_publish_timeout_must_fit_in_lease() {
        let result = Config::from_toml(
            r#"
[queue]
lease_secs = 60
publish_timeout_secs = 60
"#,
        );
        assert!(matches!(
            result,
            Err(AutopostError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_lease_must_cover_refresh_and_retry() {
        // 2 x 50s publish plus the default 30s refresh does not fit in 120s
        let result = Config::from_toml("[queue]\nlease_secs = 120\npublish_timeout_secs = 50\n");
        match result {
            Err(AutopostError::Config(ConfigError::Invalid(msg))) => {
                assert!(msg.contains("queue.lease_secs"))
            }
            other => panic!("Expected invalid config, got {:?}", other),
        }

        // A slow platform token endpoint counts too
        let result = Config::from_toml(
            r#"
[queue]
lease_secs = 120
publish_timeout_secs = 30

[platforms.x]
timeout_secs = 60
"#,
        );
        assert!(result.is_err());

        let config = Config::from_toml("[queue]\nlease_secs = 120\npublish_timeout_secs = 40\n").unwrap();
        assert_eq!(config.queue.publish_timeout_secs, 40);
    }

    #[test]
    #[serial]
    fn test_zero_workers_is_rejected() {
        let result = Config::from_toml("[queue]\nworkers = 0\n");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        std::env::set_var("AUTOPOST_DB_PATH", "/tmp/override.db");
        let config = Config::from_toml("[database]\npath = \"/tmp/file.db\"\n").unwrap();
        std::env::remove_var("AUTOPOST_DB_PATH");

        assert_eq!(config.database.path, "/tmp/override.db");
    }

    #[test]
    #[serial]
    fn test_load_from_path() {
        std::env::remove_var("AUTOPOST_DB_PATH");
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[database]\npath = \"/tmp/from-file.db\"\n\n[enforcer]\ninterval_secs = 5").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.database.path, "/tmp/from-file.db");
        assert_eq!(config.enforcer.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load_from_path(Path::new("/nonexistent/autopost/config.toml"));
        assert!(matches!(
            result,
            Err(AutopostError::Config(ConfigError::ReadError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_load_without_file_uses_defaults() {
        std::env::remove_var("AUTOPOST_DB_PATH");
        std::env::set_var("AUTOPOST_CONFIG", "/nonexistent/autopost/config.toml");
        let config = Config::load().unwrap();
        std::env::remove_var("AUTOPOST_CONFIG");

        assert_eq!(config.queue.workers, 3);
        assert!(config.database.path.ends_with("autopost.db"));
    }

    #[test]
    fn test_malformed_toml() {
        let result = Config::from_toml("[database\npath = ");
        assert!(matches!(
            result,
            Err(AutopostError::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("AUTOPOST_CONFIG", "/tmp/custom-autopost.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("AUTOPOST_CONFIG");

        assert_eq!(path, PathBuf::from("/tmp/custom-autopost.toml"));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_default() {
        std::env::remove_var("AUTOPOST_CONFIG");
        let path = resolve_config_path().unwrap();
        assert!(path.ends_with("autopost/config.toml"));
    }

    #[test]
    fn test_db_path_expands_tilde() {
        let config = Config {
            database: DatabaseConfig {
                path: "~/autopost.db".to_string(),
                max_connections: 4,
            },
            ..Default::default()
        };
        assert!(!config.db_path().starts_with('~'));
        assert!(config.db_path().ends_with("autopost.db"));
    }
}
