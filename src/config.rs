use crate::error::{BrokerError, Result};
use std::env;
use std::time::Duration;

use crate::broker::BrokerConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Event bus and heartbeat store connection
    pub backend: BackendConfig,
    /// Stale job reaper timing
    pub reaper: ReaperConfig,
    /// WebSocket session settings
    pub session: SessionConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8001)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
}

/// Which implementation backs the event bus and heartbeat store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Redis connection URL
    pub redis_url: String,
    /// Pub/sub channel carrying job events
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Seconds between stale job sweeps (default: 300)
    pub sweep_interval_seconds: u64,
    /// Heartbeat age in seconds after which a job is stale (default: 600)
    pub max_heartbeat_age_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-session send timeout in milliseconds
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8001").parse().map_err(|_| {
                    BrokerError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
            },
            backend: BackendConfig {
                kind: parse_backend(&get_env_or("BROKER_BACKEND", "redis"))?,
                redis_url: get_env_or("REDIS_URL", "redis://127.0.0.1:6379"),
                channel: get_env_or("JOB_EVENTS_CHANNEL", "job_updates"),
            },
            reaper: ReaperConfig {
                sweep_interval_seconds: parse_positive("JOB_CLEANUP_INTERVAL", "300")?,
                max_heartbeat_age_seconds: parse_positive("MAX_WORKER_HEARTBEAT_AGE", "600")?,
            },
            session: SessionConfig {
                send_timeout_ms: parse_positive("WS_SEND_TIMEOUT_MS", "5000")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// Explicit values handed to the broker core
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            channel: self.backend.channel.clone(),
            sweep_interval: Duration::from_secs(self.reaper.sweep_interval_seconds),
            max_heartbeat_age: Duration::from_secs(self.reaper.max_heartbeat_age_seconds),
            send_timeout: Duration::from_millis(self.session.send_timeout_ms),
            ..BrokerConfig::default()
        }
    }
}

fn parse_backend(raw: &str) -> Result<BackendKind> {
    match raw.trim().to_lowercase().as_str() {
        "redis" => Ok(BackendKind::Redis),
        "memory" | "in-memory" | "in_memory" => Ok(BackendKind::Memory),
        other => Err(BrokerError::InvalidConfig(format!(
            "BROKER_BACKEND has unsupported value: {}",
            other
        ))),
    }
}

fn parse_positive(key: &str, default: &str) -> Result<u64> {
    match get_env_or(key, default).trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(BrokerError::InvalidConfig(format!(
            "{} must be a positive integer",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "API_PORT",
        "API_HOST",
        "BROKER_BACKEND",
        "REDIS_URL",
        "JOB_EVENTS_CHANNEL",
        "JOB_CLEANUP_INTERVAL",
        "MAX_WORKER_HEARTBEAT_AGE",
        "WS_SEND_TIMEOUT_MS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.api.port, 8001);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(config.backend.kind, BackendKind::Redis);
        assert_eq!(config.backend.channel, "job_updates");
        assert_eq!(config.reaper.sweep_interval_seconds, 300);
        assert_eq!(config.reaper.max_heartbeat_age_seconds, 600);
        assert_eq!(config.session.send_timeout_ms, 5000);
        assert_eq!(config.api_addr(), "0.0.0.0:8001");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("API_PORT", "9001");
        env::set_var("BROKER_BACKEND", "memory");
        env::set_var("REDIS_URL", "redis://cache.internal:6380/2");
        env::set_var("JOB_EVENTS_CHANNEL", "jobs");
        env::set_var("JOB_CLEANUP_INTERVAL", "30");
        env::set_var("MAX_WORKER_HEARTBEAT_AGE", "90");

        let config = Config::from_env().unwrap();

        assert_eq!(config.api.port, 9001);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.backend.redis_url, "redis://cache.internal:6380/2");

        let broker = config.broker_config();
        assert_eq!(broker.channel, "jobs");
        assert_eq!(broker.sweep_interval, Duration::from_secs(30));
        assert_eq!(broker.max_heartbeat_age, Duration::from_secs(90));
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("API_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("JOB_CLEANUP_INTERVAL", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("BROKER_BACKEND", "kafka");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }
}
