//! Pipeline configuration.
//!
//! Loaded from a JSON file; every field has a default so a config file only
//! needs the values it changes. The oracle token may instead come from the
//! `FRANKEN_ORACLE_TOKEN` environment variable so it stays out of files.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteOracleClient;
use crate::reducer::ReductionBudget;
use crate::worker::{WorkerConfig, WorkerMode};

pub const TOKEN_ENV_VAR: &str = "FRANKEN_ORACLE_TOKEN";
pub const DEFAULT_LANGUAGE: &str = "glsl-310es";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("no oracle token configured and FRANKEN_ORACLE_TOKEN is unset")]
    MissingToken,
    #[error("oracle client could not be built: {0}")]
    Client(String),
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "config_read",
            Self::Parse { .. } => "config_parse",
            Self::Invalid(_) => "config_invalid",
            Self::MissingToken => "config_missing_token",
            Self::Client(_) => "config_client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleEndpoint {
    pub base_url: String,
    /// Falls back to `FRANKEN_ORACLE_TOKEN` when absent.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for OracleEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub language: String,
    pub oracle: OracleEndpoint,
    /// Pairs consumed by each worker.
    pub job_limit: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub ignore_strings: BTreeSet<String>,
    pub variants_only: bool,
    pub mode: WorkerMode,
    pub budget: ReductionBudget,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_defaults("out")
    }
}

impl PipelineConfig {
    pub fn with_defaults(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            oracle: OracleEndpoint::default(),
            job_limit: 100,
            workers: 1,
            queue_capacity: 16,
            ignore_strings: BTreeSet::new(),
            variants_only: false,
            mode: WorkerMode::RunOnly,
            budget: ReductionBudget {
                max_commits: None,
                max_oracle_calls: Some(2_000),
                time_budget_ms: Some(30 * 60 * 1_000),
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.language.trim().is_empty() {
            return Err(ConfigError::Invalid("language must not be empty".to_string()));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "oracle.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.ignore_strings.iter().any(|needle| needle.is_empty()) {
            return Err(ConfigError::Invalid(
                "ignore_strings must not contain empty strings".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured token, else the environment.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        self.resolve_token_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_token_with<F>(&self, lookup: F) -> Result<String, ConfigError>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        self.oracle
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .or_else(|| lookup(TOKEN_ENV_VAR).filter(|token| !token.is_empty()))
            .ok_or(ConfigError::MissingToken)
    }

    pub fn worker_config(&self, trace_id: &str) -> WorkerConfig {
        WorkerConfig {
            limit: self.job_limit,
            mode: self.mode,
            variants_only: self.variants_only,
            ignore_strings: self.ignore_strings.clone(),
            budget: self.budget,
            trace_id: trace_id.to_string(),
        }
    }

    pub fn remote_client(&self) -> Result<RemoteOracleClient, ConfigError> {
        let token = self.resolve_token()?;
        RemoteOracleClient::new(
            &self.oracle.base_url,
            token,
            self.language.clone(),
            Duration::from_secs(self.oracle.timeout_secs),
        )
        .map_err(|err| ConfigError::Client(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_file(label: &str, contents: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "franken_reducer_config_{label}_{nanos}_{}.json",
            std::process::id()
        ));
        fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::with_defaults("out");
        assert_eq!(config.validate().ok(), Some(()));
        assert_eq!(config.workers, 1);
        assert_eq!(config.mode, WorkerMode::RunOnly);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = temp_file(
            "partial",
            r#"{"output_dir":"triage","ignore_strings":["known_driver_bug"],"mode":"reduce","oracle":{"base_url":"http://oracle:9000"}}"#,
        );
        let config = PipelineConfig::load(&path).expect("load");
        assert_eq!(config.output_dir, PathBuf::from("triage"));
        assert_eq!(config.mode, WorkerMode::Reduce);
        assert!(config.ignore_strings.contains("known_driver_bug"));
        assert_eq!(config.oracle.base_url, "http://oracle:9000");
        assert_eq!(config.oracle.timeout_secs, 60);
        assert_eq!(config.language, DEFAULT_LANGUAGE);
        fs::remove_file(path).ok();
    }

    #[test]
    fn invalid_values_are_rejected_on_load() {
        let path = temp_file("zero_workers", r#"{"workers":0}"#);
        let error = PipelineConfig::load(&path).expect_err("invalid");
        assert_eq!(error.error_code(), "config_invalid");
        fs::remove_file(path).ok();
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let path = temp_file("malformed", "{workers:");
        let error = PipelineConfig::load(&path).expect_err("parse");
        assert_eq!(error.error_code(), "config_parse");
        fs::remove_file(path).ok();
    }

    #[test]
    fn token_prefers_config_over_environment() {
        let mut config = PipelineConfig::with_defaults("out");
        assert!(matches!(
            config.resolve_token_with(|_| None),
            Err(ConfigError::MissingToken)
        ));
        let from_env = config
            .resolve_token_with(|key| (key == TOKEN_ENV_VAR).then(|| "env-token".to_string()))
            .expect("env token");
        assert_eq!(from_env, "env-token");

        config.oracle.token = Some("file-token".to_string());
        let from_file = config
            .resolve_token_with(|_| Some("env-token".to_string()))
            .expect("file token");
        assert_eq!(from_file, "file-token");
    }

    #[test]
    fn token_is_never_serialized() {
        let mut config = PipelineConfig::with_defaults("out");
        config.oracle.token = Some("secret".to_string());
        let json = serde_json::to_string(&config).expect("encode");
        assert!(!json.contains("secret"));
    }

    #[test]
    fn worker_config_carries_pipeline_settings() {
        let mut config = PipelineConfig::with_defaults("out");
        config.variants_only = true;
        config.job_limit = 3;
        config.ignore_strings.insert("bug".to_string());
        let worker = config.worker_config("trace-1");
        assert_eq!(worker.limit, 3);
        assert!(worker.variants_only);
        assert!(worker.ignore_strings.contains("bug"));
        assert_eq!(worker.trace_id, "trace-1");
        assert_eq!(worker.budget, config.budget);
    }
}
