use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Absent means every store and queue lives in memory.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub notification_encryption_key: String,
    pub log_dir: String,
    pub listen_address: String,
    pub scheduler_poll_interval_seconds: u64,
    pub sweep_grace_seconds: i64,
    pub sweep_batch_size: i64,
    pub queue_soft_cap: usize,
    pub check_workers: usize,
    pub notification_workers: usize,
    pub worker_idle_poll_millis: u64,
    pub job_max_attempts: i32,
    pub job_retry_backoff_seconds: i64,
    pub job_reservation_timeout_seconds: i64,
    pub validation_timeout_seconds: u64,
    pub lock_namespace: i32,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    database_url: Option<String>,
    database_max_connections: Option<u32>,
    notification_encryption_key: Option<String>,
    log_dir: Option<String>,
    listen_address: Option<String>,
    scheduler_poll_interval_seconds: Option<u64>,
    sweep_grace_seconds: Option<i64>,
    sweep_batch_size: Option<i64>,
    queue_soft_cap: Option<usize>,
    check_workers: Option<usize>,
    notification_workers: Option<usize>,
    worker_idle_poll_millis: Option<u64>,
    job_max_attempts: Option<i32>,
    job_retry_backoff_seconds: Option<i64>,
    job_reservation_timeout_seconds: Option<i64>,
    validation_timeout_seconds: Option<u64>,
    lock_namespace: Option<i32>,
}

fn default_notification_key() -> String {
    // Development key. Override it in production.
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        merge(PartialServerConfig::default(), PartialServerConfig::default())
    }
}

fn merge(env: PartialServerConfig, file: PartialServerConfig) -> ServerConfig {
    ServerConfig {
        database_url: env.database_url.or(file.database_url).filter(|url| !url.trim().is_empty()),
        database_max_connections: env.database_max_connections.or(file.database_max_connections).unwrap_or(20),
        notification_encryption_key: env
            .notification_encryption_key
            .or(file.notification_encryption_key)
            .unwrap_or_else(default_notification_key),
        log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
        listen_address: env.listen_address.or(file.listen_address).unwrap_or_else(default_listen_address),
        scheduler_poll_interval_seconds: env
            .scheduler_poll_interval_seconds
            .or(file.scheduler_poll_interval_seconds)
            .unwrap_or(30),
        sweep_grace_seconds: env.sweep_grace_seconds.or(file.sweep_grace_seconds).unwrap_or(60),
        sweep_batch_size: env.sweep_batch_size.or(file.sweep_batch_size).unwrap_or(500),
        queue_soft_cap: env.queue_soft_cap.or(file.queue_soft_cap).unwrap_or(1000),
        check_workers: env.check_workers.or(file.check_workers).unwrap_or(8),
        notification_workers: env.notification_workers.or(file.notification_workers).unwrap_or(2),
        worker_idle_poll_millis: env.worker_idle_poll_millis.or(file.worker_idle_poll_millis).unwrap_or(500),
        job_max_attempts: env.job_max_attempts.or(file.job_max_attempts).unwrap_or(3),
        job_retry_backoff_seconds: env.job_retry_backoff_seconds.or(file.job_retry_backoff_seconds).unwrap_or(10),
        job_reservation_timeout_seconds: env
            .job_reservation_timeout_seconds
            .or(file.job_reservation_timeout_seconds)
            .unwrap_or(300),
        validation_timeout_seconds: env.validation_timeout_seconds.or(file.validation_timeout_seconds).unwrap_or(15),
        lock_namespace: env.lock_namespace.or(file.lock_namespace).unwrap_or(7301),
    }
}

fn read_file(config_path: Option<&str>) -> Result<PartialServerConfig, ConfigError> {
    let Some(path_str) = config_path else {
        return Ok(PartialServerConfig::default());
    };
    let path = Path::new(path_str);
    if !path.exists() {
        return Ok(PartialServerConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str.to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path_str.to_string(),
        source,
    })
}

impl ServerConfig {
    /// Defaults, then the optional TOML file, then environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let file_config = read_file(config_path)?;
        let env_config: PartialServerConfig = envy::from_env()?;
        let config = merge(env_config, file_config);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let key = hex::decode(self.notification_encryption_key.trim()).map_err(|e| ConfigError::Invalid {
            field: "notification_encryption_key",
            reason: e.to_string(),
        })?;
        if key.len() != 32 {
            return Err(ConfigError::Invalid {
                field: "notification_encryption_key",
                reason: format!("expected 32 bytes, got {}", key.len()),
            });
        }
        let positive: [(&'static str, i64); 5] = [
            ("scheduler_poll_interval_seconds", self.scheduler_poll_interval_seconds as i64),
            ("sweep_batch_size", self.sweep_batch_size),
            ("job_max_attempts", self.job_max_attempts as i64),
            ("validation_timeout_seconds", self.validation_timeout_seconds as i64),
            ("database_max_connections", self.database_max_connections as i64),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.database_url.is_some() {
            let needed = self.pool_connections_needed();
            if needed > self.database_max_connections as usize {
                return Err(ConfigError::Invalid {
                    field: "database_max_connections",
                    reason: format!(
                        "{} check workers and {} notification workers need at least {needed} connections",
                        self.check_workers, self.notification_workers
                    ),
                });
            }
        }
        Ok(())
    }

    /// Each check worker may hold an advisory-lock session while its cycle
    /// makes store calls on a second connection. One more for the sweep.
    fn pool_connections_needed(&self) -> usize {
        self.check_workers * 2 + self.notification_workers + 1
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_interval_seconds)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_seconds)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.worker_idle_poll_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> PartialServerConfig {
        envy::from_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(config.sweep_grace_seconds, 60);
        assert_eq!(config.queue_soft_cap, 1000);
        assert_eq!(config.lock_namespace, 7301);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "check_workers = 4\nqueue_soft_cap = 50\ndatabase_url = \"postgres://file/db\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let from_file = read_file(Some(&path)).unwrap();
        let config = merge(env(&[("CHECK_WORKERS", "16")]), from_file);
        assert_eq!(config.check_workers, 16);
        assert_eq!(config.queue_soft_cap, 50);
        assert_eq!(config.database_url.as_deref(), Some("postgres://file/db"));
        assert_eq!(config.notification_workers, 2);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let partial = read_file(Some("/nonexistent/pulsekeeper.toml")).unwrap();
        assert_eq!(merge(PartialServerConfig::default(), partial), ServerConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check_workers = \"many\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(matches!(read_file(Some(&path)), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = merge(env(&[("NOTIFICATION_ENCRYPTION_KEY", "abcd")]), PartialServerConfig::default());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "notification_encryption_key",
                ..
            })
        ));

        let config = merge(env(&[("JOB_MAX_ATTEMPTS", "0")]), PartialServerConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_must_cover_workers() {
        let database = ("DATABASE_URL", "postgres://localhost/pulsekeeper");
        let config = merge(env(&[database]), PartialServerConfig::default());
        assert_eq!(config.database_max_connections, 20);
        assert!(config.validate().is_ok());

        let config = merge(
            env(&[database, ("CHECK_WORKERS", "10"), ("DATABASE_MAX_CONNECTIONS", "10")]),
            PartialServerConfig::default(),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "database_max_connections",
                ..
            })
        ));

        let config = merge(
            env(&[database, ("CHECK_WORKERS", "8"), ("DATABASE_MAX_CONNECTIONS", "18")]),
            PartialServerConfig::default(),
        );
        assert!(config.validate().is_err());

        // Without a database the pool is never opened.
        let config = merge(env(&[("CHECK_WORKERS", "64")]), PartialServerConfig::default());
        assert!(config.validate().is_ok());
    }
}
