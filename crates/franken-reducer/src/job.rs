//! Jobs exchanged with the oracle and the outcomes it reports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::program_tree::{ProgramAst, ProgramTree, StructuralError, hash_program};

/// A shader program plus the metadata the oracle needs to run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderJob {
    pub name: String,
    /// Shading language and version tag, e.g. `"glsl-310es"`.
    pub language: String,
    pub program: ProgramAst,
}

impl ShaderJob {
    pub fn new(name: impl Into<String>, language: impl Into<String>, program: ProgramAst) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            program,
        }
    }

    pub fn from_tree(
        name: impl Into<String>,
        language: impl Into<String>,
        tree: &ProgramTree,
    ) -> Result<Self, StructuralError> {
        Ok(Self::new(name, language, tree.to_ast()?))
    }

    pub fn to_tree(&self) -> ProgramTree {
        ProgramTree::from_ast(&self.program)
    }

    /// Serialized job-file form handed to the oracle.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn program_hash(&self) -> String {
        hash_program(&self.program)
    }
}

/// One unit of work for the pipeline: a reference program and its variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramPair {
    pub reference: ShaderJob,
    pub variant: ShaderJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Crash,
    CompileError,
    LinkError,
    Timeout,
    UnexpectedError,
    SanityError,
    Nondet,
}

impl JobStatus {
    pub const ALL: [Self; 8] = [
        Self::Success,
        Self::Crash,
        Self::CompileError,
        Self::LinkError,
        Self::Timeout,
        Self::UnexpectedError,
        Self::SanityError,
        Self::Nondet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Crash => "CRASH",
            Self::CompileError => "COMPILE_ERROR",
            Self::LinkError => "LINK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::UnexpectedError => "UNEXPECTED_ERROR",
            Self::SanityError => "SANITY_ERROR",
            Self::Nondet => "NONDET",
        }
    }

    /// Every status other than success is filed for triage.
    pub fn is_fault(self) -> bool {
        self != Self::Success
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown job status `{value}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(default)]
    pub log: String,
}

impl JobResult {
    pub fn new(status: JobStatus, log: impl Into<String>) -> Self {
        Self {
            status,
            log: log.into(),
        }
    }

    /// Whether the log mentions any of the configured substrings.
    pub fn log_matches_any<'a, I>(&self, needles: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        needles
            .into_iter()
            .any(|needle| !needle.is_empty() && self.log.contains(needle.as_str()))
    }
}
