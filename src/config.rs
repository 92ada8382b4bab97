//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::DEFAULT_MAX_CONCURRENCY;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Listen host for the task stream server.
    pub host: String,
    /// Listen port for the task stream server.
    pub port: u16,
    /// Maximum concurrent handler invocations, process-wide.
    pub max_concurrency: usize,
    /// Capability tags advertised to the orchestrator.
    pub tags: Vec<String>,
    /// Optional JSON document binding (kind, version) to specifications.
    pub spec_path: Option<PathBuf>,
    /// How long draining sessions wait for in-flight work before abandoning it.
    pub drain_grace: Duration,
    /// Identifier sent in the session greeting.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tags: Vec::new(),
            spec_path: None,
            drain_grace: Duration::from_secs(1),
            worker_id: format!("wep-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Build from `WEP_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("WEP_HOST").unwrap_or(defaults.host);

        let port = match lookup("WEP_PORT") {
            Some(raw) => parse_value("WEP_PORT", &raw)?,
            None => defaults.port,
        };

        let max_concurrency = match lookup("WEP_MAX_CONCURRENCY") {
            Some(raw) => {
                let n: usize = parse_value("WEP_MAX_CONCURRENCY", &raw)?;
                if n == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "WEP_MAX_CONCURRENCY".to_string(),
                        message: "must be a positive integer".to_string(),
                    });
                }
                n
            }
            None => defaults.max_concurrency,
        };

        let tags: Vec<String> = lookup("WEP_TAGS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let spec_path = lookup("WEP_SPEC_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let drain_grace = match lookup("WEP_DRAIN_GRACE_MS") {
            Some(raw) => Duration::from_millis(parse_value("WEP_DRAIN_GRACE_MS", &raw)?),
            None => defaults.drain_grace,
        };

        let worker_id = lookup("WEP_WORKER_ID").unwrap_or(defaults.worker_id);

        Ok(Self {
            host,
            port,
            max_concurrency,
            tags,
            spec_path,
            drain_grace,
            worker_id,
        })
    }

    /// `host:port` for binding the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
