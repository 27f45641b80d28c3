//! HTTP client for the remote shader execution service.
//!
//! Jobs are posted to `<base_url>/manageAPI` as
//! `{ "token": ..., "language": ..., "job": <serialized job> }` and the
//! service answers with a [`JobResult`]. Static validation runs locally.

use std::time::Duration;

use serde::Serialize;

use crate::job::JobResult;
use crate::oracle::{OracleError, ShaderRunner};
use crate::validate::validate_job_json;

pub const MANAGE_API_PATH: &str = "manageAPI";

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    token: &'a str,
    language: &'a str,
    job: &'a str,
}

#[derive(Debug, Clone)]
pub struct RemoteOracleClient {
    endpoint: String,
    token: String,
    language: String,
    http: reqwest::blocking::Client,
}

impl RemoteOracleClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let base = base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(OracleError::Config(format!(
                "base url `{base_url}` must start with http:// or https://"
            )));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OracleError::Config(err.to_string()))?;
        Ok(Self {
            endpoint: format!("{base}/{MANAGE_API_PATH}"),
            token: token.into(),
            language: language.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn language(&self) -> &str {
        &self.language
    }
}

impl ShaderRunner for RemoteOracleClient {
    fn validate(&self, serialized_job: &str) -> bool {
        match validate_job_json(serialized_job) {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(%error, "job failed static validation");
                false
            }
        }
    }

    fn run(&self, serialized_job: &str) -> Result<JobResult, OracleError> {
        let request = RunRequest {
            token: &self.token,
            language: &self.language,
            job: serialized_job,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OracleError::Status {
                code: status.as_u16(),
                body,
            });
        }
        let body = response
            .text()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| OracleError::Decode(err.to_string()))
    }
}
