//! Job pipeline worker.
//!
//! A worker takes (reference, variant) pairs from the queue, runs each
//! program through the oracle, and files whatever looks wrong. Only an
//! interrupted dequeue or a broken scratch directory stops a worker early;
//! everything else is recorded against the job and the loop moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::PipelineEvent;
use crate::finder::OpportunityFinder;
use crate::job::{JobResult, JobStatus, ProgramPair, ShaderJob};
use crate::oracle::{FaultReproductionOracle, ShaderRunner};
use crate::queue::{Dequeue, JobQueue};
use crate::reducer::{ReductionBudget, ReductionConfig, Reducer, Termination};
use crate::triage::{TriageError, TriageLayout, counter_prefix};

const COMPONENT: &str = "worker";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Run and triage only.
    RunOnly,
    /// Also minimize every faulting variant.
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pairs each worker consumes before stopping.
    pub limit: u64,
    pub mode: WorkerMode,
    /// Skip running and comparing the reference program.
    pub variants_only: bool,
    /// Crash logs containing any of these are filed under `IGNORE/`.
    pub ignore_strings: BTreeSet<String>,
    pub budget: ReductionBudget,
    pub trace_id: String,
}

impl WorkerConfig {
    pub fn with_defaults(limit: u64) -> Self {
        Self {
            limit,
            mode: WorkerMode::RunOnly,
            variants_only: false,
            ignore_strings: BTreeSet::new(),
            budget: ReductionBudget::default(),
            trace_id: "pipeline".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison hook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    Consistent,
    Mismatch { detail: String },
    /// The comparator cannot judge this pair.
    Unsupported,
}

/// Decides whether a reference and its variant behaved equivalently.
/// Image comparison belongs to the rendering backend, so it plugs in here.
pub trait ResultComparator {
    fn compare(&self, reference: &JobResult, variant: &JobResult) -> ComparisonOutcome;
}

impl<F> ResultComparator for F
where
    F: Fn(&JobResult, &JobResult) -> ComparisonOutcome,
{
    fn compare(&self, reference: &JobResult, variant: &JobResult) -> ComparisonOutcome {
        self(reference, variant)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoComparison;

impl ResultComparator for NoComparison {
    fn compare(&self, _reference: &JobResult, _variant: &JobResult) -> ComparisonOutcome {
        ComparisonOutcome::Unsupported
    }
}

// ---------------------------------------------------------------------------
// Reports and errors
// ---------------------------------------------------------------------------

/// Hands out artifact counters. Shared by a pool so prefixes never collide.
#[derive(Debug, Default)]
pub struct JobCounter(AtomicU64);

impl JobCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    LimitReached,
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionSummary {
    pub counter: u64,
    pub job_name: String,
    pub status: JobStatus,
    pub termination: Termination,
    pub commits: usize,
    pub initial_nodes: usize,
    pub final_nodes: usize,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: Option<usize>,
    pub consumed: u64,
    pub stop: StopReason,
    pub invalid: u64,
    pub skipped: u64,
    /// Filed faults per status name.
    pub faults: BTreeMap<String, u64>,
    pub ignored: u64,
    pub mismatches: u64,
    pub reductions: Vec<ReductionSummary>,
    pub events: Vec<PipelineEvent>,
}

impl WorkerReport {
    fn new(worker: Option<usize>) -> Self {
        Self {
            worker,
            consumed: 0,
            stop: StopReason::LimitReached,
            invalid: 0,
            skipped: 0,
            faults: BTreeMap::new(),
            ignored: 0,
            mismatches: 0,
            reductions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.values().sum()
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker cancelled while waiting for a job after {consumed} jobs")]
    Cancelled { consumed: u64 },
    #[error("scratch directory unusable: {0}")]
    Scratch(#[source] TriageError),
    #[error("worker {worker} panicked")]
    Panicked { worker: usize },
}

impl WorkerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Cancelled { .. } => "worker_cancelled",
            Self::Scratch(_) => "worker_scratch",
            Self::Panicked { .. } => "worker_panicked",
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reference,
    Variant,
}

impl Role {
    fn file_stem(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Variant => "variant",
        }
    }
}

/// Files produced for one executed program.
struct Executed {
    result: JobResult,
    job_file: PathBuf,
    result_file: PathBuf,
}

impl Executed {
    fn artifacts(&self) -> [PathBuf; 2] {
        [self.job_file.clone(), self.result_file.clone()]
    }
}

pub struct Worker<'a, R, C> {
    id: Option<usize>,
    config: &'a WorkerConfig,
    layout: &'a TriageLayout,
    runner: &'a R,
    comparator: &'a C,
    counter: &'a JobCounter,
}

impl<'a, R, C> Worker<'a, R, C>
where
    R: ShaderRunner,
    C: ResultComparator,
{
    pub fn new(
        id: Option<usize>,
        config: &'a WorkerConfig,
        layout: &'a TriageLayout,
        runner: &'a R,
        comparator: &'a C,
        counter: &'a JobCounter,
    ) -> Self {
        Self {
            id,
            config,
            layout,
            runner,
            comparator,
            counter,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.layout.scratch_dir(self.id)
    }

    pub fn run(&self, queue: &JobQueue<ProgramPair>) -> Result<WorkerReport, WorkerError> {
        let scratch = self.scratch_dir();
        let mut report = WorkerReport::new(self.id);
        while report.consumed < self.config.limit {
            tracing::info!(worker = ?self.id, job = report.consumed, "waiting for job");
            let pair = match queue.take() {
                Dequeue::Item(pair) => pair,
                Dequeue::Closed => {
                    report.stop = StopReason::QueueClosed;
                    break;
                }
                Dequeue::Cancelled => {
                    tracing::error!(worker = ?self.id, "cancelled while waiting for a job");
                    return Err(WorkerError::Cancelled {
                        consumed: report.consumed,
                    });
                }
            };
            report.consumed += 1;
            self.layout
                .reset_scratch(&scratch)
                .map_err(WorkerError::Scratch)?;
            let counter = self.counter.next();
            self.process(&pair, counter, &scratch, &mut report);
        }
        tracing::info!(worker = ?self.id, consumed = report.consumed, stop = ?report.stop, "worker stopped");
        Ok(report)
    }

    fn process(&self, pair: &ProgramPair, counter: u64, scratch: &Path, report: &mut WorkerReport) {
        let Some(variant) = self.execute(&pair.variant, Role::Variant, counter, scratch, report)
        else {
            return;
        };
        let ignored = self.file_if_fault(&pair.variant, &variant, counter, report);
        if self.config.mode == WorkerMode::Reduce && variant.result.status.is_fault() && !ignored {
            self.reduce(&pair.variant, &variant.result, counter, report);
        }
        if self.config.variants_only {
            return;
        }

        let Some(reference) =
            self.execute(&pair.reference, Role::Reference, counter, scratch, report)
        else {
            return;
        };
        self.file_if_fault(&pair.reference, &reference, counter, report);
        match self.comparator.compare(&reference.result, &variant.result) {
            ComparisonOutcome::Mismatch { detail } => {
                tracing::warn!(counter, %detail, "reference and variant disagree");
                let mut artifacts = reference.artifacts().to_vec();
                artifacts.extend(variant.artifacts());
                match self.layout.file_mismatch(counter, &artifacts) {
                    Ok(_) => {
                        report.mismatches += 1;
                        self.pass(report, &pair.variant, counter, "mismatch_filed");
                    }
                    Err(error) => {
                        self.fail(report, &pair.variant, counter, "mismatch_filed", error.error_code());
                    }
                }
            }
            ComparisonOutcome::Consistent | ComparisonOutcome::Unsupported => {}
        }
    }

    /// Serializes, validates and runs one program. `None` means the job was
    /// handled here (filed as invalid or skipped).
    fn execute(
        &self,
        job: &ShaderJob,
        role: Role,
        counter: u64,
        scratch: &Path,
        report: &mut WorkerReport,
    ) -> Option<Executed> {
        let job_file = scratch.join(format!("{}.json", role.file_stem()));
        let result_file = scratch.join(format!("{}.info.json", role.file_stem()));

        let serialized = match job.to_json() {
            Ok(serialized) => serialized,
            Err(error) => {
                tracing::error!(job = %job.name, %error, "could not serialize job");
                report.skipped += 1;
                self.fail(report, job, counter, "serialize", "serialization_error");
                return None;
            }
        };
        if let Err(error) = fs::write(&job_file, &serialized) {
            tracing::error!(path = %job_file.display(), %error, "could not write job file");
            report.skipped += 1;
            self.fail(report, job, counter, "write_job", "scratch_io");
            return None;
        }

        if !self.runner.validate(&serialized) {
            report.invalid += 1;
            match self.layout.file_invalid(counter, std::slice::from_ref(&job_file)) {
                Ok(_) => self.fail(report, job, counter, "validate", "invalid_program"),
                Err(error) => self.fail(report, job, counter, "validate", error.error_code()),
            }
            return None;
        }

        let result = match self.runner.run(&serialized) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(job = %job.name, %error, "oracle run failed; skipping job");
                report.skipped += 1;
                self.fail(report, job, counter, "oracle_run", error.error_code());
                return None;
            }
        };
        let written = serde_json::to_string_pretty(&result)
            .map_err(|err| err.to_string())
            .and_then(|json| fs::write(&result_file, json).map_err(|err| err.to_string()));
        if let Err(error) = written {
            tracing::error!(path = %result_file.display(), %error, "could not write result file");
            report.skipped += 1;
            self.fail(report, job, counter, "write_result", "scratch_io");
            return None;
        }
        self.pass(report, job, counter, "oracle_run");
        Some(Executed {
            result,
            job_file,
            result_file,
        })
    }

    /// Files a faulting result. Returns whether it was routed to `IGNORE/`.
    fn file_if_fault(
        &self,
        job: &ShaderJob,
        executed: &Executed,
        counter: u64,
        report: &mut WorkerReport,
    ) -> bool {
        let status = executed.result.status;
        if !status.is_fault() {
            return false;
        }
        let ignored = status == JobStatus::Crash
            && executed.result.log_matches_any(&self.config.ignore_strings);
        match self
            .layout
            .file_failure(status, ignored, counter, &executed.artifacts())
        {
            Ok(_) => {
                *report.faults.entry(status.as_str().to_string()).or_default() += 1;
                if ignored {
                    report.ignored += 1;
                }
                tracing::info!(job = %job.name, counter, %status, ignored, "filed fault");
                self.pass(report, job, counter, "fault_filed");
            }
            Err(error) => {
                tracing::error!(job = %job.name, %error, "could not file fault artifacts");
                self.fail(report, job, counter, "fault_filed", error.error_code());
            }
        }
        ignored
    }

    /// Minimizes a faulting job. Candidates whose log shows an ignore-listed
    /// signature the original log lacked reproduce a known fault instead.
    fn reduce(
        &self,
        job: &ShaderJob,
        original: &JobResult,
        counter: u64,
        report: &mut WorkerReport,
    ) {
        let status = original.status;
        let mut config = ReductionConfig::with_defaults(job.name.as_str(), job.language.as_str());
        config.budget = self.config.budget;
        config.trace_id = self.config.trace_id.clone();
        let reducer = Reducer::new(OpportunityFinder::default(), config);
        let unseen_known_faults = self
            .config
            .ignore_strings
            .iter()
            .filter(|needle| !original.log.contains(needle.as_str()))
            .cloned();
        let mut oracle = FaultReproductionOracle::new(self.runner, status)
            .with_excluded_signatures(unseen_known_faults);
        let outcome = match reducer.reduce(job.to_tree(), &mut oracle) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(job = %job.name, %error, "reduction failed");
                self.fail(report, job, counter, "reduce", error.error_code());
                return;
            }
        };
        let filed = outcome
            .job(&job.name, &job.language)
            .map_err(|error| error.error_code())
            .and_then(|reduced| {
                self.layout
                    .file_reduction(status, counter, &reduced, &outcome.report)
                    .map_err(|error| error.error_code())
            });
        match filed {
            Ok(artifacts) => {
                report.reductions.push(ReductionSummary {
                    counter,
                    job_name: job.name.clone(),
                    status,
                    termination: outcome.termination(),
                    commits: outcome.commit_count(),
                    initial_nodes: outcome.report.stats.initial_nodes,
                    final_nodes: outcome.report.stats.final_nodes,
                    artifacts,
                });
                self.pass(report, job, counter, "reduce");
            }
            Err(error_code) => self.fail(report, job, counter, "reduce", error_code),
        }
    }

    fn pass(&self, report: &mut WorkerReport, job: &ShaderJob, counter: u64, event: &str) {
        let decision = format!("{}{}", counter_prefix(counter), job.name);
        report.events.push(PipelineEvent::pass(
            &self.config.trace_id,
            &decision,
            COMPONENT,
            event,
        ));
    }

    fn fail(
        &self,
        report: &mut WorkerReport,
        job: &ShaderJob,
        counter: u64,
        event: &str,
        error_code: &str,
    ) {
        let decision = format!("{}{}", counter_prefix(counter), job.name);
        report.events.push(PipelineEvent::fail(
            &self.config.trace_id,
            &decision,
            COMPONENT,
            event,
            error_code,
        ));
    }
}

/// Runs `workers` workers over one queue on scoped threads and returns each
/// worker's result in id order. A single worker uses the plain `temp/`
/// scratch directory.
pub fn run_worker_pool<R, C>(
    workers: usize,
    config: &WorkerConfig,
    layout: &TriageLayout,
    runner: &R,
    comparator: &C,
    queue: &JobQueue<ProgramPair>,
) -> Vec<Result<WorkerReport, WorkerError>>
where
    R: ShaderRunner + Sync,
    C: ResultComparator + Sync,
{
    let counter = JobCounter::default();
    let workers = workers.max(1);
    thread::scope(|scope| {
        let handles = (0..workers)
            .map(|id| {
                let slot = (workers > 1).then_some(id);
                let worker = Worker::new(slot, config, layout, runner, comparator, &counter);
                scope.spawn(move || worker.run(queue))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(WorkerError::Panicked { worker: id }))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::oracle::OracleError;
    use crate::program_tree::{AstDecl, AstExpr, AstStmt, BinaryOp, ProgramAst};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "franken_reducer_worker_{label}_{nanos}_{}",
            std::process::id()
        ))
    }

    /// Crashes on any program containing `discard`, optionally with a log.
    struct DiscardCrashRunner {
        crash_log: String,
        fail_transport: bool,
        runs: Mutex<u64>,
    }

    impl DiscardCrashRunner {
        fn new(crash_log: &str) -> Self {
            Self {
                crash_log: crash_log.to_string(),
                fail_transport: false,
                runs: Mutex::new(0),
            }
        }

        fn runs(&self) -> u64 {
            *self.runs.lock().expect("lock")
        }
    }

    impl ShaderRunner for DiscardCrashRunner {
        fn validate(&self, serialized_job: &str) -> bool {
            crate::validate::validate_job_json(serialized_job).is_ok()
        }

        fn run(&self, serialized_job: &str) -> Result<JobResult, OracleError> {
            *self.runs.lock().expect("lock") += 1;
            if self.fail_transport {
                return Err(OracleError::Transport("connection reset".to_string()));
            }
            if serialized_job.contains("\"discard\"") {
                Ok(JobResult::new(JobStatus::Crash, self.crash_log.clone()))
            } else {
                Ok(JobResult::new(JobStatus::Success, ""))
            }
        }
    }

    fn program(crashes: bool) -> ProgramAst {
        let mut body = vec![
            AstStmt::var(
                "float",
                "x",
                Some(AstExpr::binary(
                    BinaryOp::Add,
                    AstExpr::float("1.0"),
                    AstExpr::float("2.0"),
                )),
            ),
            AstStmt::Empty,
        ];
        if crashes {
            body.push(AstStmt::if_else(
                AstExpr::binary(BinaryOp::Gt, AstExpr::ident("x"), AstExpr::float("0.5")),
                AstStmt::block(vec![AstStmt::Discard]),
                None,
            ));
        }
        ProgramAst::new(vec![
            AstDecl::global("float", "unused", None),
            AstDecl::function("void", "main", Vec::new(), body),
        ])
    }

    fn pair(variant_crashes: bool) -> ProgramPair {
        ProgramPair {
            reference: ShaderJob::new("reference", "glsl-310es", program(false)),
            variant: ShaderJob::new("variant", "glsl-310es", program(variant_crashes)),
        }
    }

    fn queue_of(pairs: Vec<ProgramPair>) -> JobQueue<ProgramPair> {
        let queue = JobQueue::new(pairs.len().max(1));
        for pair in pairs {
            queue.push(pair).expect("push");
        }
        queue
    }

    fn run_single<R: ShaderRunner, C: ResultComparator>(
        config: &WorkerConfig,
        layout: &TriageLayout,
        runner: &R,
        comparator: &C,
        queue: &JobQueue<ProgramPair>,
    ) -> Result<WorkerReport, WorkerError> {
        let counter = JobCounter::default();
        Worker::new(None, config, layout, runner, comparator, &counter).run(queue)
    }

    #[test]
    fn ignored_crash_lands_under_ignore_directory() {
        let layout = TriageLayout::new(temp_dir("ignore")).expect("layout");
        let runner = DiscardCrashRunner::new("abort in known_driver_bug()");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        config.ignore_strings.insert("known_driver_bug".to_string());

        let queue = queue_of(vec![pair(true)]);
        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");

        let root = layout.root();
        assert!(root.join("CRASH/IGNORE/0000variant.json").is_file());
        assert!(root.join("CRASH/IGNORE/0000variant.info.json").is_file());
        assert!(!root.join("CRASH/0000variant.json").exists());
        assert_eq!(report.ignored, 1);
        assert_eq!(report.fault_count(), 1);
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn unmatched_crash_is_not_ignored() {
        let layout = TriageLayout::new(temp_dir("crash")).expect("layout");
        let runner = DiscardCrashRunner::new("segfault somewhere else");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        config.ignore_strings.insert("known_driver_bug".to_string());

        let queue = queue_of(vec![pair(true)]);
        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");

        assert!(layout.root().join("CRASH/0000variant.json").is_file());
        assert!(!layout.root().join("CRASH/IGNORE").exists());
        assert_eq!(report.ignored, 0);
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn worker_stops_at_its_limit() {
        let layout = TriageLayout::new(temp_dir("limit")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let config = WorkerConfig::with_defaults(2);
        let queue = queue_of(vec![pair(false), pair(false), pair(false)]);

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");

        assert_eq!(report.consumed, 2);
        assert_eq!(report.stop, StopReason::LimitReached);
        assert_eq!(queue.len(), 1);
        // Variant and reference of each consumed pair.
        assert_eq!(runner.runs(), 4);
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn closed_queue_ends_the_worker_early() {
        let layout = TriageLayout::new(temp_dir("closed")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let config = WorkerConfig::with_defaults(5);
        let queue = queue_of(vec![pair(false)]);
        queue.close();

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");
        assert_eq!(report.consumed, 1);
        assert_eq!(report.stop, StopReason::QueueClosed);
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn cancellation_is_fatal() {
        let layout = TriageLayout::new(temp_dir("cancel")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let config = WorkerConfig::with_defaults(2);
        let queue = queue_of(vec![pair(false)]);
        queue.cancel();

        let error = run_single(&config, &layout, &runner, &NoComparison, &queue)
            .expect_err("cancelled");
        assert!(matches!(error, WorkerError::Cancelled { consumed: 0 }));
        assert_eq!(runner.runs(), 0);
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn invalid_programs_are_filed_and_not_run() {
        let layout = TriageLayout::new(temp_dir("invalid")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        let broken = ProgramPair {
            reference: ShaderJob::new("reference", "glsl-310es", program(false)),
            variant: ShaderJob::new(
                "variant",
                "glsl-310es",
                ProgramAst::new(vec![AstDecl::global("float", "g", Some(AstExpr::ident("nope")))]),
            ),
        };
        let queue = queue_of(vec![broken]);

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");
        assert_eq!(report.invalid, 1);
        assert_eq!(runner.runs(), 0);
        assert!(layout.invalid_dir().join("0000variant.json").is_file());
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn oracle_failures_skip_the_job_and_continue() {
        let layout = TriageLayout::new(temp_dir("transport")).expect("layout");
        let mut runner = DiscardCrashRunner::new("");
        runner.fail_transport = true;
        let config = WorkerConfig::with_defaults(2);
        let queue = queue_of(vec![pair(true), pair(true)]);

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");
        assert_eq!(report.consumed, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.fault_count(), 0);
        assert!(
            report
                .events
                .iter()
                .any(|event| event.error_code.as_deref() == Some("oracle_transport"))
        );
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn reduce_mode_files_a_minimized_reproducer() {
        let layout = TriageLayout::new(temp_dir("reduce")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        config.mode = WorkerMode::Reduce;
        let queue = queue_of(vec![pair(true)]);

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");
        assert_eq!(report.reductions.len(), 1);
        let summary = &report.reductions[0];
        assert_eq!(summary.termination, Termination::Fixpoint);
        assert!(summary.commits > 0);
        assert!(summary.final_nodes < summary.initial_nodes);

        let reduced_path = layout.root().join("REDUCED/CRASH/0000variant.json");
        let reduced =
            ShaderJob::from_json(&fs::read_to_string(&reduced_path).expect("read")).expect("decode");
        let text = reduced.program.render();
        assert!(text.contains("discard;"));
        assert!(!text.contains("unused"));
        fs::remove_dir_all(layout.root()).ok();
    }

    /// Crashes on every program; only programs with `discard` hit the new bug.
    struct TwoBugRunner;

    impl ShaderRunner for TwoBugRunner {
        fn validate(&self, serialized_job: &str) -> bool {
            crate::validate::validate_job_json(serialized_job).is_ok()
        }

        fn run(&self, serialized_job: &str) -> Result<JobResult, OracleError> {
            let log = if serialized_job.contains("\"discard\"") {
                "new_bug in pass X"
            } else {
                "abort in known_driver_bug()"
            };
            Ok(JobResult::new(JobStatus::Crash, log))
        }
    }

    #[test]
    fn reduction_does_not_drift_into_ignored_crash() {
        let layout = TriageLayout::new(temp_dir("drift")).expect("layout");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        config.mode = WorkerMode::Reduce;
        config.ignore_strings.insert("known_driver_bug".to_string());
        let queue = queue_of(vec![pair(true)]);

        let report = run_single(&config, &layout, &TwoBugRunner, &NoComparison, &queue)
            .expect("run");
        assert_eq!(report.ignored, 0);
        assert_eq!(report.reductions.len(), 1);
        assert!(report.reductions[0].commits > 0);

        let reduced_path = layout.root().join("REDUCED/CRASH/0000variant.json");
        let reduced =
            ShaderJob::from_json(&fs::read_to_string(&reduced_path).expect("read")).expect("decode");
        assert!(reduced.program.render().contains("discard;"));
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn ignored_crashes_are_not_reduced() {
        let layout = TriageLayout::new(temp_dir("ignored_reduce")).expect("layout");
        let runner = DiscardCrashRunner::new("abort in known_driver_bug()");
        let mut config = WorkerConfig::with_defaults(1);
        config.variants_only = true;
        config.mode = WorkerMode::Reduce;
        config.ignore_strings.insert("known_driver_bug".to_string());
        let queue = queue_of(vec![pair(true)]);

        let report = run_single(&config, &layout, &runner, &NoComparison, &queue).expect("run");
        assert_eq!(report.ignored, 1);
        assert!(report.reductions.is_empty());
        assert_eq!(runner.runs(), 1);
        assert!(!layout.reduced_dir(JobStatus::Crash).exists());
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn mismatches_file_both_programs() {
        let layout = TriageLayout::new(temp_dir("mismatch")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let config = WorkerConfig::with_defaults(1);
        let queue = queue_of(vec![pair(true)]);
        let status_differs = |reference: &JobResult, variant: &JobResult| {
            if reference.status == variant.status {
                ComparisonOutcome::Consistent
            } else {
                ComparisonOutcome::Mismatch {
                    detail: format!("{} vs {}", reference.status, variant.status),
                }
            }
        };

        let report =
            run_single(&config, &layout, &runner, &status_differs, &queue).expect("run");
        assert_eq!(report.mismatches, 1);
        let mismatch = layout.mismatch_dir();
        for name in [
            "0000reference.json",
            "0000reference.info.json",
            "0000variant.json",
            "0000variant.info.json",
        ] {
            assert!(mismatch.join(name).is_file(), "missing {name}");
        }
        fs::remove_dir_all(layout.root()).ok();
    }

    #[test]
    fn pool_counters_are_unique_across_workers() {
        let layout = TriageLayout::new(temp_dir("pool")).expect("layout");
        let runner = DiscardCrashRunner::new("");
        let mut config = WorkerConfig::with_defaults(2);
        config.variants_only = true;
        let queue = queue_of((0..4).map(|_| pair(true)).collect());

        let results = run_worker_pool(2, &config, &layout, &runner, &NoComparison, &queue);
        let consumed: u64 = results
            .iter()
            .map(|result| result.as_ref().expect("worker ok").consumed)
            .sum();
        assert_eq!(consumed, 4);
        for counter in 0..4 {
            let name = format!("{}variant.json", counter_prefix(counter));
            assert!(layout.status_dir(JobStatus::Crash, false).join(&name).is_file());
        }
        assert!(layout.scratch_dir(Some(0)).is_dir());
        assert!(layout.scratch_dir(Some(1)).is_dir());
        fs::remove_dir_all(layout.root()).ok();
    }
}
