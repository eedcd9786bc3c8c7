use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use humantime_serde::re::humantime;
use serde::Deserialize;

use crate::event::decode::DEFAULT_MAX_LINE_BYTES;

/// Top-level configuration for the history collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Scheduler REST endpoint.
    #[serde(default)]
    pub yunikorn: YunikornConfig,

    /// Durable store connection.
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Event stream consumption and reconnect policy.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Periodic history rollup.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Scheduler REST endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct YunikornConfig {
    #[serde(default)]
    pub host: String,

    /// Default: 9080.
    #[serde(default = "default_yunikorn_port")]
    pub port: u16,

    /// "http" or "https". Default: "http".
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Per-request timeout for state endpoints. The event stream has none.
    /// Default: 10s.
    #[serde(default = "default_yunikorn_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl YunikornConfig {
    /// Base URL, e.g. `http://yunikorn:9080`.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default)]
    pub host: String,

    /// Default: 5432.
    #[serde(default = "default_postgres_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db_name: String,

    /// Zero leaves the driver default.
    #[serde(default)]
    pub pool_max_conns: u32,

    #[serde(default)]
    pub pool_min_conns: u32,

    #[serde(default, with = "humantime_serde")]
    pub pool_max_conn_lifetime: Duration,

    #[serde(default, with = "humantime_serde")]
    pub pool_max_conn_idle_time: Duration,
}

/// Event stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// First reconnect delay. Default: 1s.
    #[serde(default = "default_backoff_initial", with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Reconnect delay ceiling. Default: 30s.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Consecutive failed connects before giving up. 0 means never.
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// How long an in-flight handler may run after cancellation. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Initial decode buffer capacity. Default: 64KiB.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Longest line accepted before it is dropped. Default: 4MiB.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Re-read scheduler state after every successful connect. Default: true.
    #[serde(default = "default_true")]
    pub resync_on_connect: bool,
}

/// History rollup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rollup period. Default: 60s.
    #[serde(default = "default_history_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the health/metrics HTTP server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_yunikorn_port() -> u16 {
    9080
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_yunikorn_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_true() -> bool {
    true
}

fn default_history_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            yunikorn: YunikornConfig::default(),
            postgres: PostgresConfig::default(),
            stream: StreamConfig::default(),
            history: HistoryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for YunikornConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_yunikorn_port(),
            protocol: default_protocol(),
            timeout: default_yunikorn_timeout(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_postgres_port(),
            username: String::new(),
            password: String::new(),
            db_name: String::new(),
            pool_max_conns: 0,
            pool_min_conns: 0,
            pool_max_conn_lifetime: Duration::ZERO,
            pool_max_conn_idle_time: Duration::ZERO,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            max_reconnect_attempts: 0,
            shutdown_timeout: default_shutdown_timeout(),
            read_buffer_size: default_read_buffer_size(),
            max_line_bytes: default_max_line_bytes(),
            resync_on_connect: true,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_history_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.yunikorn.host.is_empty() {
            bail!("yunikorn.host is required");
        }

        if self.yunikorn.port == 0 {
            bail!("yunikorn.port must be positive");
        }

        match self.yunikorn.protocol.as_str() {
            "http" | "https" => {}
            other => bail!("yunikorn.protocol must be http or https, got {other}"),
        }

        if self.yunikorn.timeout.is_zero() {
            bail!("yunikorn.timeout must be positive");
        }

        if self.postgres.host.is_empty() {
            bail!("postgres.host is required");
        }

        if self.postgres.db_name.is_empty() {
            bail!("postgres.db_name is required");
        }

        if self.postgres.pool_max_conns > 0
            && self.postgres.pool_min_conns > self.postgres.pool_max_conns
        {
            bail!("postgres.pool_min_conns must not exceed postgres.pool_max_conns");
        }

        if self.stream.backoff_initial.is_zero() {
            bail!("stream.backoff_initial must be positive");
        }

        if self.stream.backoff_max < self.stream.backoff_initial {
            bail!("stream.backoff_max must be at least stream.backoff_initial");
        }

        if self.stream.max_line_bytes == 0 {
            bail!("stream.max_line_bytes must be positive");
        }

        if self.history.enabled && self.history.interval.is_zero() {
            bail!("history.interval must be positive when enabled");
        }

        Ok(())
    }
}

/// Escapes backslashes and single quotes for a quoted descriptor value.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

impl PostgresConfig {
    /// Builds a keyword/value connection descriptor.
    ///
    /// Format: `host='..' port='..' user='..' password='..' dbname='..'`
    /// followed by any configured `pool_*` settings.
    pub fn connection_string(&self) -> String {
        self.descriptor(&self.password)
    }

    /// Same as [`connection_string`](Self::connection_string) with the
    /// password masked, for logging.
    pub fn redacted_connection_string(&self) -> String {
        let masked = if self.password.is_empty() { "" } else { "***" };
        self.descriptor(masked)
    }

    fn descriptor(&self, password: &str) -> String {
        let mut pairs = vec![
            format!("host={}", quote(&self.host)),
            format!("port={}", quote(&self.port.to_string())),
            format!("user={}", quote(&self.username)),
            format!("password={}", quote(password)),
            format!("dbname={}", quote(&self.db_name)),
        ];

        if self.pool_max_conns > 0 {
            pairs.push(format!(
                "pool_max_conns={}",
                quote(&self.pool_max_conns.to_string())
            ));
        }
        if self.pool_min_conns > 0 {
            pairs.push(format!(
                "pool_min_conns={}",
                quote(&self.pool_min_conns.to_string())
            ));
        }
        if !self.pool_max_conn_lifetime.is_zero() {
            pairs.push(format!(
                "pool_max_conn_lifetime={}",
                quote(&humantime::format_duration(self.pool_max_conn_lifetime).to_string())
            ));
        }
        if !self.pool_max_conn_idle_time.is_zero() {
            pairs.push(format!(
                "pool_max_conn_idle_time={}",
                quote(&humantime::format_duration(self.pool_max_conn_idle_time).to_string())
            ));
        }

        pairs.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            yunikorn: YunikornConfig {
                host: "yunikorn".to_string(),
                ..Default::default()
            },
            postgres: PostgresConfig {
                host: "localhost".to_string(),
                db_name: "history".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.yunikorn.port, 9080);
        assert_eq!(cfg.yunikorn.protocol, "http");
        assert_eq!(cfg.yunikorn.timeout, Duration::from_secs(10));
        assert_eq!(cfg.postgres.port, 5432);
        assert_eq!(cfg.stream.backoff_initial, Duration::from_secs(1));
        assert_eq!(cfg.stream.backoff_max, Duration::from_secs(30));
        assert_eq!(cfg.stream.max_reconnect_attempts, 0);
        assert_eq!(cfg.stream.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(cfg.stream.read_buffer_size, 64 * 1024);
        assert!(cfg.stream.resync_on_connect);
        assert!(cfg.history.enabled);
        assert_eq!(cfg.history.interval, Duration::from_secs(60));
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
yunikorn:
  host: yk.example
  protocol: https
  timeout: 3s
postgres:
  host: db
  username: history
  password: secret
  db_name: yhs
  pool_max_conns: 8
  pool_max_conn_lifetime: 1h
stream:
  backoff_initial: 500ms
  backoff_max: 10s
  max_reconnect_attempts: 5
history:
  enabled: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.yunikorn.base_url(), "https://yk.example:9080");
        assert_eq!(cfg.yunikorn.timeout, Duration::from_secs(3));
        assert_eq!(cfg.postgres.pool_max_conns, 8);
        assert_eq!(
            cfg.postgres.pool_max_conn_lifetime,
            Duration::from_secs(3600)
        );
        assert_eq!(cfg.stream.backoff_initial, Duration::from_millis(500));
        assert_eq!(cfg.stream.max_reconnect_attempts, 5);
        assert!(!cfg.history.enabled);
        assert!(cfg.stream.resync_on_connect);
    }

    #[test]
    fn test_validation_accepts_valid_config() {
        valid_config().validate().expect("valid");
    }

    #[test]
    fn test_validation_missing_yunikorn_host() {
        let mut cfg = valid_config();
        cfg.yunikorn.host.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("yunikorn.host"));
    }

    #[test]
    fn test_validation_bad_protocol() {
        let mut cfg = valid_config();
        cfg.yunikorn.protocol = "ftp".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("yunikorn.protocol"));
    }

    #[test]
    fn test_validation_missing_db_name() {
        let mut cfg = valid_config();
        cfg.postgres.db_name.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("postgres.db_name"));
    }

    #[test]
    fn test_validation_pool_bounds() {
        let mut cfg = valid_config();
        cfg.postgres.pool_max_conns = 2;
        cfg.postgres.pool_min_conns = 4;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pool_min_conns"));
    }

    #[test]
    fn test_validation_backoff_order() {
        let mut cfg = valid_config();
        cfg.stream.backoff_max = Duration::from_millis(100);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stream.backoff_max"));
    }

    #[test]
    fn test_validation_history_interval() {
        let mut cfg = valid_config();
        cfg.history.interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("history.interval"));

        cfg.history.enabled = false;
        cfg.validate().expect("disabled rollup ignores interval");
    }

    #[test]
    fn test_connection_string_minimal() {
        let cfg = PostgresConfig {
            host: "localhost".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            db_name: "db".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.connection_string(),
            "host='localhost' port='5432' user='user' password='pass' dbname='db'"
        );
    }

    #[test]
    fn test_connection_string_escapes_values() {
        let cfg = PostgresConfig {
            host: "db".to_string(),
            username: "o'brien".to_string(),
            password: r"pa\ss'word".to_string(),
            db_name: "db".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.connection_string(),
            r"host='db' port='5432' user='o\'brien' password='pa\\ss\'word' dbname='db'"
        );
    }

    #[test]
    fn test_connection_string_pool_settings() {
        let cfg = PostgresConfig {
            host: "db".to_string(),
            db_name: "db".to_string(),
            pool_max_conns: 10,
            pool_min_conns: 2,
            pool_max_conn_lifetime: Duration::from_secs(3600),
            pool_max_conn_idle_time: Duration::from_secs(90),
            ..Default::default()
        };
        let s = cfg.connection_string();
        assert!(s.ends_with(
            "pool_max_conns='10' pool_min_conns='2' pool_max_conn_lifetime='1h' pool_max_conn_idle_time='1m 30s'"
        ));
    }

    #[test]
    fn test_redacted_connection_string() {
        let cfg = PostgresConfig {
            host: "db".to_string(),
            password: "secret".to_string(),
            db_name: "db".to_string(),
            ..Default::default()
        };
        let s = cfg.redacted_connection_string();
        assert!(s.contains("password='***'"));
        assert!(!s.contains("secret"));
    }
}
