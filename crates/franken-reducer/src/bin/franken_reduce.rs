use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::thread;

use frankenengine_reducer::config::PipelineConfig;
use frankenengine_reducer::events::stamp_trace_id;
use frankenengine_reducer::finder::OpportunityFinder;
use frankenengine_reducer::job::{JobStatus, ProgramPair, ShaderJob};
use frankenengine_reducer::oracle::FaultReproductionOracle;
use frankenengine_reducer::queue::JobQueue;
use frankenengine_reducer::reducer::{ReductionConfig, Reducer};
use frankenengine_reducer::triage::TriageLayout;
use frankenengine_reducer::worker::{NoComparison, WorkerMode, run_worker_pool};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  franken_reduce reduce --job <path> --status <STATUS> [--log-signature <text>]
                        [--config <path>] [--output <dir>] [--max-commits <n>]
                        [--max-oracle-calls <n>] [--time-budget-ms <n>] [--skip-initial-check]
  franken_reduce pipeline --pairs <jsonl> [--config <path>] [--output <dir>]
                          [--workers <n>] [--limit <n>] [--variants-only] [--reduce]";

#[derive(Debug, Clone)]
enum Command {
    Reduce {
        job_path: PathBuf,
        status: JobStatus,
        log_signature: Option<String>,
        check_initial: bool,
    },
    Pipeline {
        pairs_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct CliArgs {
    command: Command,
    config: PipelineConfig,
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("{flag} expects a number, got `{value}`"))
}

fn parse_args() -> Result<CliArgs, String> {
    let mut args = std::env::args().skip(1);
    let subcommand = args.next().ok_or_else(|| USAGE.to_string())?;

    let mut config_path = None;
    let mut output = None;
    let mut job_path = None;
    let mut status = None;
    let mut log_signature = None;
    let mut check_initial = true;
    let mut pairs_path = None;
    let mut max_commits = None;
    let mut max_oracle_calls = None;
    let mut time_budget_ms = None;
    let mut workers = None;
    let mut limit = None;
    let mut variants_only = false;
    let mut reduce_faults = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(PathBuf::from(next_value(&mut args, "--config")?)),
            "--output" => output = Some(PathBuf::from(next_value(&mut args, "--output")?)),
            "--job" => job_path = Some(PathBuf::from(next_value(&mut args, "--job")?)),
            "--status" => {
                let value = next_value(&mut args, "--status")?;
                status = Some(value.parse::<JobStatus>()?);
            }
            "--log-signature" => log_signature = Some(next_value(&mut args, "--log-signature")?),
            "--skip-initial-check" => check_initial = false,
            "--pairs" => pairs_path = Some(PathBuf::from(next_value(&mut args, "--pairs")?)),
            "--max-commits" => {
                let value = next_value(&mut args, "--max-commits")?;
                max_commits = Some(parse_number(&value, "--max-commits")?);
            }
            "--max-oracle-calls" => {
                let value = next_value(&mut args, "--max-oracle-calls")?;
                max_oracle_calls = Some(parse_number(&value, "--max-oracle-calls")?);
            }
            "--time-budget-ms" => {
                let value = next_value(&mut args, "--time-budget-ms")?;
                time_budget_ms = Some(parse_number(&value, "--time-budget-ms")?);
            }
            "--workers" => {
                let value = next_value(&mut args, "--workers")?;
                workers = Some(parse_number(&value, "--workers")?);
            }
            "--limit" => {
                let value = next_value(&mut args, "--limit")?;
                limit = Some(parse_number(&value, "--limit")?);
            }
            "--variants-only" => variants_only = true,
            "--reduce" => reduce_faults = true,
            "--help" | "-h" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument: {other}\n{USAGE}")),
        }
    }

    let mut config = match config_path {
        Some(path) => PipelineConfig::load(&path).map_err(|err| err.to_string())?,
        None => PipelineConfig::default(),
    };
    if let Some(output) = output {
        config.output_dir = output;
    }
    if max_commits.is_some() {
        config.budget.max_commits = max_commits;
    }
    if max_oracle_calls.is_some() {
        config.budget.max_oracle_calls = max_oracle_calls;
    }
    if time_budget_ms.is_some() {
        config.budget.time_budget_ms = time_budget_ms;
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(limit) = limit {
        config.job_limit = limit;
    }
    config.variants_only |= variants_only;
    if reduce_faults {
        config.mode = WorkerMode::Reduce;
    }
    config.validate().map_err(|err| err.to_string())?;

    let command = match subcommand.as_str() {
        "reduce" => Command::Reduce {
            job_path: job_path.ok_or_else(|| "reduce requires --job".to_string())?,
            status: status.ok_or_else(|| "reduce requires --status".to_string())?,
            log_signature,
            check_initial,
        },
        "pipeline" => Command::Pipeline {
            pairs_path: pairs_path.ok_or_else(|| "pipeline requires --pairs".to_string())?,
        },
        "--help" | "-h" => return Err(USAGE.to_string()),
        other => return Err(format!("unknown command: {other}\n{USAGE}")),
    };
    Ok(CliArgs { command, config })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_reduce(
    config: &PipelineConfig,
    job_path: &PathBuf,
    status: JobStatus,
    log_signature: Option<String>,
    check_initial: bool,
) -> Result<(), Box<dyn Error>> {
    let job = ShaderJob::from_json(&fs::read_to_string(job_path)?)?;
    let client = config.remote_client()?;
    let trace_id = stamp_trace_id("reduce");

    let mut oracle = FaultReproductionOracle::new(&client, status);
    if let Some(signature) = log_signature {
        oracle = oracle.with_log_signature(signature);
    }
    let reducer = Reducer::new(
        OpportunityFinder::default(),
        ReductionConfig {
            job_name: job.name.clone(),
            language: job.language.clone(),
            budget: config.budget,
            check_initial,
            trace_id: trace_id.clone(),
        },
    );
    let outcome = reducer.reduce(job.to_tree(), &mut oracle)?;
    let reduced = outcome.job(&job.name, &job.language)?;
    let layout = TriageLayout::new(&config.output_dir)?;
    let artifacts = layout.file_reduction(status, 0, &reduced, &outcome.report)?;

    let summary = json!({
        "trace_id": trace_id,
        "job": job.name,
        "status": status,
        "termination": outcome.termination(),
        "commits": outcome.commit_count(),
        "oracle_calls": outcome.report.stats.oracle_calls,
        "initial_nodes": outcome.report.stats.initial_nodes,
        "final_nodes": outcome.report.stats.final_nodes,
        "original_hash": outcome.report.stats.original_hash,
        "reduced_hash": outcome.report.stats.reduced_hash,
        "artifacts": artifacts,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn read_pairs(path: &PathBuf) -> Result<Vec<ProgramPair>, Box<dyn Error>> {
    let raw = fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let pair = serde_json::from_str::<ProgramPair>(line)
            .map_err(|err| format!("{}:{}: {err}", path.display(), line_no + 1))?;
        pairs.push(pair);
    }
    Ok(pairs)
}

fn run_pipeline(config: &PipelineConfig, pairs_path: &PathBuf) -> Result<(), Box<dyn Error>> {
    let pairs = read_pairs(pairs_path)?;
    let client = config.remote_client()?;
    let layout = TriageLayout::new(&config.output_dir)?;
    let trace_id = stamp_trace_id("pipeline");
    let worker_config = config.worker_config(&trace_id);
    let queue = JobQueue::new(config.queue_capacity);

    let results = thread::scope(|scope| {
        scope.spawn(|| {
            for pair in pairs {
                if let Err(err) = queue.push(pair) {
                    tracing::info!(reason = %err, "producer stopped");
                    break;
                }
            }
            queue.close();
        });
        let results = run_worker_pool(
            config.workers,
            &worker_config,
            &layout,
            &client,
            &NoComparison,
            &queue,
        );
        // Workers are done; release a producer still blocked on a full queue.
        queue.cancel();
        results
    });

    let mut failures = Vec::new();
    let mut reports = Vec::new();
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(err) => {
                tracing::error!(error = %err, code = err.error_code(), "worker failed");
                failures.push(err.to_string());
            }
        }
    }
    let summary = json!({
        "trace_id": trace_id,
        "output_dir": config.output_dir,
        "reports": reports,
        "failures": failures,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !failures.is_empty() {
        return Err(format!("{} worker(s) failed", failures.len()).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args =
        parse_args().map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    init_tracing();

    match args.command {
        Command::Reduce {
            job_path,
            status,
            log_signature,
            check_initial,
        } => run_reduce(&args.config, &job_path, status, log_signature, check_initial),
        Command::Pipeline { pairs_path } => run_pipeline(&args.config, &pairs_path),
    }
}
