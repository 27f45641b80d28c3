//! Interestingness oracle contract.
//!
//! The reducer only needs a predicate over serialized programs. Running a
//! shader is delegated to a [`ShaderRunner`]; [`FaultReproductionOracle`]
//! turns a runner into a predicate that asks "does this candidate still
//! reproduce the fault we started from".

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobResult, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Interesting,
    NotInteresting,
    /// Candidate failed static validation.
    Invalid,
    /// The oracle could not produce an answer.
    ExecutionError,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interesting => "interesting",
            Self::NotInteresting => "not_interesting",
            Self::Invalid => "invalid",
            Self::ExecutionError => "execution_error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait InterestingnessOracle {
    fn classify(&mut self, serialized_program: &str) -> Verdict;
}

impl<F> InterestingnessOracle for F
where
    F: FnMut(&str) -> Verdict,
{
    fn classify(&mut self, serialized_program: &str) -> Verdict {
        self(serialized_program)
    }
}

/// Failures talking to the execution oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failure: {0}")]
    Transport(String),
    #[error("oracle returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("oracle response could not be decoded: {0}")]
    Decode(String),
    #[error("oracle client configuration invalid: {0}")]
    Config(String),
}

impl OracleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "oracle_transport",
            Self::Status { .. } => "oracle_status",
            Self::Decode(_) => "oracle_decode",
            Self::Config(_) => "oracle_config",
        }
    }
}

/// Executes serialized shader jobs.
pub trait ShaderRunner {
    /// Static check that needs no network round trip.
    fn validate(&self, serialized_job: &str) -> bool;

    fn run(&self, serialized_job: &str) -> Result<JobResult, OracleError>;
}

impl<R: ShaderRunner + ?Sized> ShaderRunner for &R {
    fn validate(&self, serialized_job: &str) -> bool {
        (**self).validate(serialized_job)
    }

    fn run(&self, serialized_job: &str) -> Result<JobResult, OracleError> {
        (**self).run(serialized_job)
    }
}

/// Interesting when a candidate still ends in `target`, and, if a log
/// signature is set, its log still contains that signature.
#[derive(Debug)]
pub struct FaultReproductionOracle<R> {
    runner: R,
    target: JobStatus,
    log_signature: Option<String>,
    excluded_signatures: Vec<String>,
    calls: u64,
}

impl<R: ShaderRunner> FaultReproductionOracle<R> {
    pub fn new(runner: R, target: JobStatus) -> Self {
        Self {
            runner,
            target,
            log_signature: None,
            excluded_signatures: Vec::new(),
            calls: 0,
        }
    }

    pub fn with_log_signature(mut self, signature: impl Into<String>) -> Self {
        let signature = signature.into();
        self.log_signature = (!signature.is_empty()).then_some(signature);
        self
    }

    /// Logs containing any of these belong to a different, known fault and
    /// never count as a reproduction.
    pub fn with_excluded_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_signatures.extend(
            signatures
                .into_iter()
                .map(Into::into)
                .filter(|signature: &String| !signature.is_empty()),
        );
        self
    }

    pub fn target(&self) -> JobStatus {
        self.target
    }

    /// Number of runs dispatched to the runner.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl<R: ShaderRunner> InterestingnessOracle for FaultReproductionOracle<R> {
    fn classify(&mut self, serialized_program: &str) -> Verdict {
        if !self.runner.validate(serialized_program) {
            return Verdict::Invalid;
        }
        self.calls += 1;
        match self.runner.run(serialized_program) {
            Ok(result) => {
                let signature_holds = self
                    .log_signature
                    .as_deref()
                    .is_none_or(|signature| result.log.contains(signature));
                let known_fault = self
                    .excluded_signatures
                    .iter()
                    .any(|signature| result.log.contains(signature.as_str()));
                if result.status == self.target && signature_holds && !known_fault {
                    Verdict::Interesting
                } else {
                    Verdict::NotInteresting
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "oracle run failed; rejecting candidate");
                Verdict::ExecutionError
            }
        }
    }
}
