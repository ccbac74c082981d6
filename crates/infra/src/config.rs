//! Orchestrator configuration.
//!
//! Values come from the environment when present and fall back to defaults
//! otherwise:
//!
//! | variable | default |
//! |---|---|
//! | `JOBWARDEN_TABLE_NAME` | `job_records` |
//! | `JOBWARDEN_MAX_VISIBILITY_TIMEOUT_SECS` | `600` |
//! | `JOBWARDEN_CLAIM_MAX_ATTEMPTS` | `5` |
//! | `JOBWARDEN_CLAIM_BASE_DELAY_MS` | `100` |

use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::dispatcher::RetryPolicy;

pub const DEFAULT_TABLE_NAME: &str = "job_records";
pub const DEFAULT_MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(600);

pub const ENV_TABLE_NAME: &str = "JOBWARDEN_TABLE_NAME";
pub const ENV_MAX_VISIBILITY_TIMEOUT_SECS: &str = "JOBWARDEN_MAX_VISIBILITY_TIMEOUT_SECS";
pub const ENV_CLAIM_MAX_ATTEMPTS: &str = "JOBWARDEN_CLAIM_MAX_ATTEMPTS";
pub const ENV_CLAIM_BASE_DELAY_MS: &str = "JOBWARDEN_CLAIM_BASE_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Malformed { key: String, value: String },

    #[error("{0} must not be empty")]
    Empty(String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Store table holding job records
    pub table_name: String,
    /// Upper bound accepted by `extend_visibility`
    pub max_visibility_timeout: Duration,
    /// Retry budget for matching a claimed delivery to its record
    pub claim_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            max_visibility_timeout: DEFAULT_MAX_VISIBILITY_TIMEOUT,
            claim_retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_max_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.max_visibility_timeout = timeout;
        self
    }

    pub fn with_claim_retry(mut self, policy: RetryPolicy) -> Self {
        self.claim_retry = policy;
        self
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (environment, map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(table_name) = lookup(ENV_TABLE_NAME) {
            if table_name.trim().is_empty() {
                return Err(ConfigError::Empty(ENV_TABLE_NAME.to_string()));
            }
            config.table_name = table_name;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, ENV_MAX_VISIBILITY_TIMEOUT_SECS)? {
            config.max_visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse::<u32, _>(&lookup, ENV_CLAIM_MAX_ATTEMPTS)? {
            config.claim_retry.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_CLAIM_BASE_DELAY_MS)? {
            config.claim_retry.base_delay = Duration::from_millis(ms);
        }

        debug!(
            table_name = %config.table_name,
            max_visibility_timeout_secs = config.max_visibility_timeout.as_secs(),
            claim_max_attempts = config.claim_retry.max_attempts,
            "orchestrator configuration loaded"
        );
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Malformed {
                key: key.to_string(),
                value: raw,
            }),
    }
}
