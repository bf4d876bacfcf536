//! Runtime configuration from `STRATUM_*` environment variables.
//!
//! | Variable | Default | |
//! |---|---|---|
//! | `STRATUM_POOL_URL` | required | `stratum+tcp://host:port` |
//! | `STRATUM_POOL_USER` | required | account or payout address |
//! | `STRATUM_POOL_WORKER` | none | appended as `user.worker` |
//! | `STRATUM_POOL_PASS` | `x` | |
//! | `STRATUM_CPU_THREADS` | 1 | at least 1 |
//! | `STRATUM_CONNECT_TIMEOUT_SECS` | 30 | |
//! | `STRATUM_KEEPALIVE_SECS` | 30 | |
//! | `STRATUM_MAX_RECONNECTS` | 10 | |
//! | `STRATUM_BACKOFF_BASE_MS` | 1000 | |
//! | `STRATUM_BACKOFF_CAP_MS` | 60000 | |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::stratum_v1::{ConnectionConfig, PoolConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Everything the daemon needs to start mining.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub pool: PoolConfig,
    pub connection: ConnectionConfig,
    pub cpu_threads: usize,
}

impl MinerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = required("STRATUM_POOL_URL")?;
        let user = required("STRATUM_POOL_USER")?;
        let username = match optional("STRATUM_POOL_WORKER") {
            Some(worker) => format!("{}.{}", user, worker),
            None => user,
        };

        let mut pool = PoolConfig {
            url,
            username,
            ..Default::default()
        };
        if let Some(password) = optional("STRATUM_POOL_PASS") {
            pool.password = password;
        }

        let mut connection = ConnectionConfig::default();
        if let Some(secs) = parsed::<u64>("STRATUM_CONNECT_TIMEOUT_SECS")? {
            connection.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>("STRATUM_KEEPALIVE_SECS")? {
            if secs == 0 {
                return Err(invalid("STRATUM_KEEPALIVE_SECS", "0"));
            }
            connection.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parsed::<u32>("STRATUM_MAX_RECONNECTS")? {
            connection.backoff.max_attempts = n;
        }
        if let Some(ms) = parsed::<u64>("STRATUM_BACKOFF_BASE_MS")? {
            connection.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>("STRATUM_BACKOFF_CAP_MS")? {
            connection.backoff.cap = Duration::from_millis(ms);
        }

        let cpu_threads = match parsed::<usize>("STRATUM_CPU_THREADS")? {
            Some(0) => return Err(invalid("STRATUM_CPU_THREADS", "0")),
            Some(n) => n,
            None => 1,
        };

        Ok(Self {
            pool,
            connection,
            cpu_threads,
        })
    }
}

/// Unset and empty are treated alike.
fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn parsed<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    optional(var)
        .map(|value| value.trim().parse().map_err(|_| invalid(var, &value)))
        .transpose()
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "STRATUM_POOL_URL",
        "STRATUM_POOL_USER",
        "STRATUM_POOL_WORKER",
        "STRATUM_POOL_PASS",
        "STRATUM_CPU_THREADS",
        "STRATUM_CONNECT_TIMEOUT_SECS",
        "STRATUM_KEEPALIVE_SECS",
        "STRATUM_MAX_RECONNECTS",
        "STRATUM_BACKOFF_BASE_MS",
        "STRATUM_BACKOFF_CAP_MS",
    ];

    fn set_env(pairs: &[(&str, &str)]) {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
        for (var, value) in pairs {
            unsafe { env::set_var(var, value) };
        }
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        set_env(&[
            ("STRATUM_POOL_URL", "stratum+tcp://pool.example.com:3333"),
            ("STRATUM_POOL_USER", "alice"),
        ]);

        let config = MinerConfig::from_env().unwrap();

        assert_eq!(config.pool.url, "stratum+tcp://pool.example.com:3333");
        assert_eq!(config.pool.username, "alice");
        assert_eq!(config.pool.password, "x");
        assert_eq!(config.cpu_threads, 1);
        assert_eq!(config.connection.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.connection.backoff.max_attempts, 10);
    }

    #[test]
    #[serial]
    fn test_full_config() {
        set_env(&[
            ("STRATUM_POOL_URL", "pool.example.com:3333"),
            ("STRATUM_POOL_USER", "alice"),
            ("STRATUM_POOL_WORKER", "rig1"),
            ("STRATUM_POOL_PASS", "d=0.5"),
            ("STRATUM_CPU_THREADS", "4"),
            ("STRATUM_CONNECT_TIMEOUT_SECS", "5"),
            ("STRATUM_KEEPALIVE_SECS", "15"),
            ("STRATUM_MAX_RECONNECTS", "3"),
            ("STRATUM_BACKOFF_BASE_MS", "250"),
            ("STRATUM_BACKOFF_CAP_MS", "8000"),
        ]);

        let config = MinerConfig::from_env().unwrap();

        assert_eq!(config.pool.username, "alice.rig1");
        assert_eq!(config.pool.password, "d=0.5");
        assert_eq!(config.cpu_threads, 4);
        assert_eq!(config.connection.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.connection.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.connection.backoff.max_attempts, 3);
        assert_eq!(config.connection.backoff.base, Duration::from_millis(250));
        assert_eq!(config.connection.backoff.cap, Duration::from_millis(8000));
    }

    #[test]
    #[serial]
    fn test_missing_required() {
        set_env(&[("STRATUM_POOL_USER", "alice")]);
        assert_eq!(
            MinerConfig::from_env().unwrap_err(),
            ConfigError::Missing("STRATUM_POOL_URL")
        );

        set_env(&[("STRATUM_POOL_URL", "pool:3333"), ("STRATUM_POOL_USER", " ")]);
        assert_eq!(
            MinerConfig::from_env().unwrap_err(),
            ConfigError::Missing("STRATUM_POOL_USER")
        );
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_are_errors() {
        set_env(&[
            ("STRATUM_POOL_URL", "pool:3333"),
            ("STRATUM_POOL_USER", "alice"),
            ("STRATUM_CPU_THREADS", "many"),
        ]);
        assert_eq!(
            MinerConfig::from_env().unwrap_err(),
            ConfigError::Invalid {
                var: "STRATUM_CPU_THREADS",
                value: "many".to_string()
            }
        );

        set_env(&[
            ("STRATUM_POOL_URL", "pool:3333"),
            ("STRATUM_POOL_USER", "alice"),
            ("STRATUM_CPU_THREADS", "0"),
        ]);
        assert!(matches!(
            MinerConfig::from_env(),
            Err(ConfigError::Invalid { var: "STRATUM_CPU_THREADS", .. })
        ));

        set_env(&[
            ("STRATUM_POOL_URL", "pool:3333"),
            ("STRATUM_POOL_USER", "alice"),
            ("STRATUM_MAX_RECONNECTS", "-1"),
        ]);
        assert!(matches!(
            MinerConfig::from_env(),
            Err(ConfigError::Invalid { var: "STRATUM_MAX_RECONNECTS", .. })
        ));
    }
}
