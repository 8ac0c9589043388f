//! Process configuration from environment variables.
//!
//! Every variable has a default. Values that are present but unparseable are
//! rejected instead of silently falling back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::domain::RetryPolicy;
use crate::orchestrator::{RecoveryConfig, WorkerPoolConfig};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:contentgen.db?mode=rwc";
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8700/generate";
pub const DEFAULT_PID_FILE: &str = "contentgen.pid";

/// Where the external generation backend lives.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the server binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub api: ApiServerConfig,
    pub workers: WorkerPoolConfig,
    pub retry: RetryPolicy,
    pub backend: BackendConfig,
    pub recovery: RecoveryConfig,
    pub pid_file: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut api = ApiServerConfig::default();
        if let Some(bind_address) = get("API_BIND_ADDRESS") {
            api.bind_address = bind_address;
        }
        if let Some(port) = parse_opt::<u16>(&get, "API_PORT")? {
            api.port = port;
        }

        let worker_defaults = WorkerPoolConfig::default();
        let workers = WorkerPoolConfig {
            max_workers: parse_opt(&get, "WORKER_MAX_WORKERS")?
                .unwrap_or(worker_defaults.max_workers),
            poll_interval: parse_opt(&get, "WORKER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(worker_defaults.poll_interval),
            shutdown_grace: parse_opt(&get, "WORKER_SHUTDOWN_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(worker_defaults.shutdown_grace),
        };
        if workers.max_workers == 0 {
            return Err(Error::config("WORKER_MAX_WORKERS must be at least 1"));
        }

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            parse_opt(&get, "STAGE_MAX_RETRIES")?.unwrap_or(retry_defaults.max_retries),
            parse_opt(&get, "STAGE_RETRY_INITIAL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.initial_delay),
            parse_opt(&get, "STAGE_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
        );

        let backend_defaults = BackendConfig::default();
        let backend = BackendConfig {
            url: get("GENERATION_BACKEND_URL").unwrap_or(backend_defaults.url),
            connect_timeout: parse_opt(&get, "GENERATION_BACKEND_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(backend_defaults.connect_timeout),
        };

        let recovery = RecoveryConfig {
            finalize_cancelling: parse_bool(&get, "RECOVERY_FINALIZE_CANCELLING")?
                .unwrap_or(false),
            fail_orphaned_running: parse_bool(&get, "RECOVERY_FAIL_ORPHANED_RUNNING")?
                .unwrap_or(false),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            api,
            workers,
            retry,
            backend,
            recovery,
            pid_file: get("CONTENTGEN_PID_FILE")
                .unwrap_or_else(|| DEFAULT_PID_FILE.to_string())
                .into(),
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}")))
        })
        .transpose()
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    get(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::config(format!("{key}={raw:?} is not a boolean"))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.api.bind_address, "0.0.0.0");
        assert_eq!(config.api.port, 12600);
        assert_eq!(config.workers.max_workers, 2);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.backend.url, DEFAULT_BACKEND_URL);
        assert!(!config.recovery.finalize_cancelling);
        assert!(!config.recovery.fail_orphaned_running);
        assert_eq!(config.pid_file, PathBuf::from("contentgen.pid"));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("API_PORT", "8080"),
            ("WORKER_MAX_WORKERS", "6"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("STAGE_MAX_RETRIES", "0"),
            ("RECOVERY_FINALIZE_CANCELLING", "yes"),
            ("RECOVERY_FAIL_ORPHANED_RUNNING", "true"),
            ("LOG_DIR", "/var/log/contentgen"),
        ])
        .unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.workers.max_workers, 6);
        assert_eq!(config.workers.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.recovery.finalize_cancelling);
        assert!(config.recovery.fail_orphaned_running);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/contentgen")));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = from_pairs(&[("API_PORT", "  "), ("DATABASE_URL", "")]).unwrap();
        assert_eq!(config.api.port, 12600);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            from_pairs(&[("API_PORT", "seventy")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            from_pairs(&[("WORKER_MAX_WORKERS", "0")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            from_pairs(&[("RECOVERY_FAIL_ORPHANED_RUNNING", "maybe")]),
            Err(Error::Configuration(_))
        ));
    }
}
