//! Reduction driver.
//!
//! A synchronous state machine that repeatedly scans the current tree for
//! opportunities, tries them shallow-first against the oracle, and keeps the
//! first interesting one before rescanning. Each oracle call depends on the
//! previous verdict, so one reduction is never parallelized.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::events::PipelineEvent;
use crate::finder::OpportunityFinder;
use crate::job::ShaderJob;
use crate::opportunity::{OpportunityKind, ReductionError, ReductionOpportunity};
use crate::oracle::{InterestingnessOracle, Verdict};
use crate::program_tree::ProgramTree;

const COMPONENT: &str = "reducer";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Outer-loop limits. Exceeding one halts the driver with a best-effort
/// result rather than a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionBudget {
    pub max_commits: Option<u64>,
    /// Stop before the oracle would be called more often than this.
    pub max_oracle_calls: Option<u64>,
    pub time_budget_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionConfig {
    pub job_name: String,
    pub language: String,
    pub budget: ReductionBudget,
    /// Ask the oracle about the unmodified input before searching.
    pub check_initial: bool,
    pub trace_id: String,
}

impl ReductionConfig {
    pub fn with_defaults(job_name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            language: language.into(),
            budget: ReductionBudget::default(),
            check_initial: false,
            trace_id: "reduce".to_string(),
        }
    }

    fn time_budget(&self) -> Option<Duration> {
        self.budget.time_budget_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Why the driver stopped. Everything except [`Termination::Fixpoint`] is a
/// best-effort result: the tree is still the last interesting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Fixpoint,
    InitialNotInteresting,
    CommitBudgetExhausted,
    OracleBudgetExhausted,
    TimeBudgetExhausted,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixpoint => "fixpoint",
            Self::InitialNotInteresting => "initial_not_interesting",
            Self::CommitBudgetExhausted => "commit_budget_exhausted",
            Self::OracleBudgetExhausted => "oracle_budget_exhausted",
            Self::TimeBudgetExhausted => "time_budget_exhausted",
        }
    }

    pub fn is_best_effort(self) -> bool {
        !matches!(self, Self::Fixpoint | Self::InitialNotInteresting)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sequence: u64,
    pub kind: OpportunityKind,
    pub description: String,
    pub depth: u32,
    pub nodes_before: usize,
    pub nodes_after: usize,
    /// Oracle call number that accepted this commit.
    pub oracle_call: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionStats {
    pub scans: u64,
    pub oracle_calls: u64,
    pub rejected_not_interesting: u64,
    pub rejected_invalid: u64,
    pub rejected_execution_error: u64,
    pub rejected_unserializable: u64,
    pub precondition_misses: u64,
    pub apply_failures: u64,
    pub initial_nodes: usize,
    pub final_nodes: usize,
    pub original_hash: String,
    pub reduced_hash: String,
    pub elapsed_ms: u64,
}

impl ReductionStats {
    pub fn rejections(&self) -> u64 {
        self.rejected_not_interesting
            + self.rejected_invalid
            + self.rejected_execution_error
            + self.rejected_unserializable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionReport {
    pub job_name: String,
    pub trace_id: String,
    pub termination: Termination,
    pub commits: Vec<CommitRecord>,
    pub stats: ReductionStats,
    pub events: Vec<PipelineEvent>,
}

#[derive(Debug, Clone)]
pub struct ReductionOutcome {
    pub tree: ProgramTree,
    pub report: ReductionReport,
}

impl ReductionOutcome {
    pub fn termination(&self) -> Termination {
        self.report.termination
    }

    pub fn commit_count(&self) -> usize {
        self.report.commits.len()
    }

    /// The reduced program packaged as a job file.
    pub fn job(&self, name: &str, language: &str) -> Result<ShaderJob, ReductionError> {
        Ok(ShaderJob::from_tree(name, language, &self.tree)?)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DriverState {
    Scanning,
    Attempting(VecDeque<ReductionOpportunity>),
    Committed,
    Rejected(VecDeque<ReductionOpportunity>),
    Done(Termination),
}

#[derive(Debug, Clone)]
pub struct Reducer {
    finder: OpportunityFinder,
    config: ReductionConfig,
}

impl Reducer {
    pub fn new(finder: OpportunityFinder, config: ReductionConfig) -> Self {
        Self { finder, config }
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    /// Minimizes `tree` against `oracle`.
    ///
    /// Errors only when the tree itself is inconsistent; every failure tied
    /// to a single candidate is recorded and the candidate rejected.
    pub fn reduce<O>(
        &self,
        tree: ProgramTree,
        oracle: &mut O,
    ) -> Result<ReductionOutcome, ReductionError>
    where
        O: InterestingnessOracle + ?Sized,
    {
        let mut run = Run::start(&self.config, tree)?;
        let mut state = if self.config.check_initial {
            run.check_initial(oracle)
        } else {
            DriverState::Scanning
        };

        let termination = loop {
            state = match state {
                DriverState::Done(termination) => break termination,
                DriverState::Scanning | DriverState::Attempting(_) if run.out_of_time() => {
                    DriverState::Done(Termination::TimeBudgetExhausted)
                }
                DriverState::Scanning => run.scan(&self.finder),
                DriverState::Attempting(queue) => run.attempt(queue, oracle)?,
                DriverState::Committed => DriverState::Scanning,
                DriverState::Rejected(queue) => DriverState::Attempting(queue),
            };
        };

        run.finish(termination)
    }
}

struct Run<'a> {
    config: &'a ReductionConfig,
    tree: ProgramTree,
    started: Instant,
    commits: Vec<CommitRecord>,
    stats: ReductionStats,
    events: Vec<PipelineEvent>,
}

impl<'a> Run<'a> {
    fn start(config: &'a ReductionConfig, tree: ProgramTree) -> Result<Self, ReductionError> {
        let stats = ReductionStats {
            initial_nodes: tree.node_count(),
            original_hash: tree.canonical_hash()?,
            ..ReductionStats::default()
        };
        tracing::info!(
            job = %config.job_name,
            nodes = stats.initial_nodes,
            "starting reduction"
        );
        Ok(Self {
            config,
            tree,
            started: Instant::now(),
            commits: Vec::new(),
            stats,
            events: Vec::new(),
        })
    }

    fn out_of_time(&self) -> bool {
        self.config
            .time_budget()
            .is_some_and(|budget| self.started.elapsed() >= budget)
    }

    fn oracle_budget_spent(&self) -> bool {
        self.config
            .budget
            .max_oracle_calls
            .is_some_and(|max| self.stats.oracle_calls >= max)
    }

    fn commit_budget_spent(&self) -> bool {
        self.config
            .budget
            .max_commits
            .is_some_and(|max| self.commits.len() as u64 >= max)
    }

    fn check_initial<O>(&mut self, oracle: &mut O) -> DriverState
    where
        O: InterestingnessOracle + ?Sized,
    {
        if self.oracle_budget_spent() {
            return DriverState::Done(Termination::OracleBudgetExhausted);
        }
        let verdict = match self.serialize_current() {
            Ok(serialized) => {
                self.stats.oracle_calls += 1;
                oracle.classify(&serialized)
            }
            Err(error_code) => {
                self.record_fail("initial_check", error_code);
                return DriverState::Done(Termination::InitialNotInteresting);
            }
        };
        if verdict == Verdict::Interesting {
            self.record_pass("initial_check");
            DriverState::Scanning
        } else {
            tracing::warn!(job = %self.config.job_name, %verdict, "input is not interesting");
            self.record_fail("initial_check", verdict.as_str());
            DriverState::Done(Termination::InitialNotInteresting)
        }
    }

    fn scan(&mut self, finder: &OpportunityFinder) -> DriverState {
        self.stats.scans += 1;
        let found = finder.find(&self.tree);
        tracing::debug!(scan = self.stats.scans, candidates = found.len(), "scanned tree");
        if found.is_empty() {
            return DriverState::Done(Termination::Fixpoint);
        }
        if self.commit_budget_spent() {
            return DriverState::Done(Termination::CommitBudgetExhausted);
        }
        DriverState::Attempting(found.into())
    }

    fn attempt<O>(
        &mut self,
        mut queue: VecDeque<ReductionOpportunity>,
        oracle: &mut O,
    ) -> Result<DriverState, ReductionError>
    where
        O: InterestingnessOracle + ?Sized,
    {
        let Some(candidate) = queue.pop_front() else {
            return Ok(DriverState::Done(Termination::Fixpoint));
        };
        if !candidate.precondition_holds(&self.tree) {
            self.stats.precondition_misses += 1;
            self.record_skip("precondition_miss");
            return Ok(DriverState::Attempting(queue));
        }
        if self.oracle_budget_spent() {
            return Ok(DriverState::Done(Termination::OracleBudgetExhausted));
        }

        let nodes_before = self.tree.node_count();
        let description = candidate.describe(&self.tree);
        let edit = match candidate.apply(&mut self.tree) {
            Ok(edit) => edit,
            Err(error) => {
                self.stats.apply_failures += 1;
                tracing::warn!(%description, %error, "candidate could not be applied");
                self.record_fail("candidate_apply", error.error_code());
                return Ok(DriverState::Attempting(queue));
            }
        };

        let verdict = match self.serialize_current() {
            Ok(serialized) => {
                self.stats.oracle_calls += 1;
                oracle.classify(&serialized)
            }
            Err(error_code) => {
                edit.revert(&mut self.tree)?;
                self.stats.rejected_unserializable += 1;
                self.record_fail("candidate_serialize", error_code);
                return Ok(DriverState::Rejected(queue));
            }
        };

        match verdict {
            Verdict::Interesting => {
                let nodes_after = self.tree.node_count();
                self.tree = self.tree.compact()?;
                let record = CommitRecord {
                    sequence: self.commits.len() as u64 + 1,
                    kind: candidate.kind(),
                    description,
                    depth: candidate.depth(),
                    nodes_before,
                    nodes_after,
                    oracle_call: self.stats.oracle_calls,
                };
                tracing::info!(
                    sequence = record.sequence,
                    kind = %record.kind,
                    nodes_before,
                    nodes_after,
                    "committed reduction"
                );
                self.commits.push(record);
                self.record_pass("candidate_committed");
                Ok(DriverState::Committed)
            }
            rejected => {
                edit.revert(&mut self.tree)?;
                match rejected {
                    Verdict::Invalid => self.stats.rejected_invalid += 1,
                    Verdict::ExecutionError => self.stats.rejected_execution_error += 1,
                    _ => self.stats.rejected_not_interesting += 1,
                }
                tracing::debug!(%description, verdict = %rejected, "rejected candidate");
                self.record_fail("candidate_rejected", rejected.as_str());
                Ok(DriverState::Rejected(queue))
            }
        }
    }

    fn serialize_current(&self) -> Result<String, &'static str> {
        let job = ShaderJob::from_tree(
            self.config.job_name.as_str(),
            self.config.language.as_str(),
            &self.tree,
        )
        .map_err(|_| "structural_error")?;
        job.to_json().map_err(|_| "serialization_error")
    }

    fn finish(mut self, termination: Termination) -> Result<ReductionOutcome, ReductionError> {
        let tree = self.tree.compact()?;
        self.stats.final_nodes = tree.node_count();
        self.stats.reduced_hash = tree.canonical_hash()?;
        self.stats.elapsed_ms =
            u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if termination.is_best_effort() {
            self.record_skip(termination.as_str());
        } else {
            self.record_pass(termination.as_str());
        }
        tracing::info!(
            job = %self.config.job_name,
            %termination,
            commits = self.commits.len(),
            oracle_calls = self.stats.oracle_calls,
            nodes = self.stats.final_nodes,
            "reduction finished"
        );
        Ok(ReductionOutcome {
            tree,
            report: ReductionReport {
                job_name: self.config.job_name.clone(),
                trace_id: self.config.trace_id.clone(),
                termination,
                commits: self.commits,
                stats: self.stats,
                events: self.events,
            },
        })
    }

    fn record_pass(&mut self, event: &str) {
        let event = PipelineEvent::pass(
            &self.config.trace_id,
            &self.config.job_name,
            COMPONENT,
            event,
        );
        self.events.push(event);
    }

    fn record_skip(&mut self, event: &str) {
        let event = PipelineEvent::skip(
            &self.config.trace_id,
            &self.config.job_name,
            COMPONENT,
            event,
        );
        self.events.push(event);
    }

    fn record_fail(&mut self, event: &str, error_code: &str) {
        let event = PipelineEvent::fail(
            &self.config.trace_id,
            &self.config.job_name,
            COMPONENT,
            event,
            error_code,
        );
        self.events.push(event);
    }
}
