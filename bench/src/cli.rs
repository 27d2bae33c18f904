//! CLI command implementations.
//!
//! Every command returns the process exit code; errors bubble up to `main`,
//! which maps them with [`exit_code_for`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use kernel::core::critique::{CritiquePolicy, CritiqueReport, critique};
use kernel::core::gate::{GateReport, validate};
use kernel::core::plan::Plan;
use kernel::exit_codes;
use kernel::io::config::{KernelConfig, load_config, strict_from_env};
use kernel::io::sandbox::Sandbox;
use kernel::io::snapshot::CopySnapshotProvider;
use kernel::preflight::{Preflight, PreflightError, RequiredInputs, preflight};
use kernel::scheduler::{Scheduler, SchedulerConfig, Task};

use crate::dataset::Dataset;
use crate::plans::{load_plan, load_variants};
use crate::report::aggregate;
use crate::results::{RunMeta, create_run_dir, file_sha256, new_run_id, write_run};

/// Scratch directory for worker snapshots, inside the output directory.
const SNAPSHOT_DIR: &str = ".snapshots";

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub dataset: PathBuf,
    pub plans: PathBuf,
    pub workers: Option<usize>,
    pub task_ids: Vec<String>,
    pub max_tasks: Option<usize>,
    pub strict: bool,
    pub config: Option<PathBuf>,
    pub out: PathBuf,
}

#[derive(Serialize)]
struct Review<'a> {
    gate: &'a GateReport,
    critique: &'a CritiqueReport,
}

/// Strict-mode preflight failures exit with `STRICT_FATAL`, everything else
/// with `INVALID`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<PreflightError>()) {
        exit_codes::STRICT_FATAL
    } else {
        exit_codes::INVALID
    }
}

fn resolve_config(path: Option<&Path>) -> Result<KernelConfig> {
    match path {
        Some(path) => load_config(path).context("load config"),
        None => Ok(KernelConfig::default()),
    }
}

/// Gate and critique one plan file, printing both reports as JSON.
pub fn validate_plan(path: &Path, strict: bool, config: Option<&Path>) -> Result<i32> {
    let cfg = resolve_config(config)?;
    let strict = cfg.strict || strict || strict_from_env();
    preflight(
        strict,
        RequiredInputs {
            plan_source: Some(path),
            ..RequiredInputs::default()
        },
    )?;

    let plan = load_plan(path)?;
    let policy = CritiquePolicy {
        strict,
        ..cfg.critique_policy()
    };
    let gate = validate(&plan);
    let review = critique(&plan, &gate, &policy);
    let payload = serde_json::to_string_pretty(&Review {
        gate: &gate,
        critique: &review,
    })
    .context("serialize reports")?;
    println!("{payload}");

    if gate.accepted && review.accepted() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::INVALID)
    }
}

/// Run every dataset task through the scheduler and persist the results.
#[instrument(skip_all, fields(dataset = %args.dataset.display()))]
pub fn run_dataset(args: &RunArgs) -> Result<i32> {
    let mut cfg = resolve_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        cfg.worker_count = workers;
    }
    cfg.strict = cfg.strict || args.strict || strict_from_env();
    cfg.validate().context("validate config")?;
    if args.max_tasks == Some(0) {
        bail!("--max-tasks must be > 0");
    }

    let readiness = preflight(
        cfg.strict,
        RequiredInputs {
            dataset: Some(&args.dataset),
            plan_source: Some(&args.plans),
        },
    )?;
    if let Preflight::Degraded { missing } = &readiness
        && missing.contains(&args.dataset)
    {
        println!("run: dataset missing, nothing to run");
        return Ok(exit_codes::OK);
    }

    let dataset = Dataset::load(&args.dataset)?;
    let dataset_hash = file_sha256(&args.dataset).context("hash dataset")?;
    let base_dir = args.dataset.parent().unwrap_or_else(|| Path::new("."));

    // Every variant is loaded before the first worker starts.
    let mut work: Vec<(Task, Vec<Arc<Plan>>)> = Vec::new();
    for task in dataset.select(base_dir, &args.task_ids, args.max_tasks)? {
        let variants = load_variants(&args.plans, &task.id, cfg.strict)?;
        if variants.is_empty() {
            continue;
        }
        work.push((task, variants));
    }
    info!(tasks = work.len(), strict = cfg.strict, "dataset loaded");

    let executor = Arc::new(Sandbox::from_config(&cfg));
    let snapshots = Arc::new(CopySnapshotProvider::new(args.out.join(SNAPSHOT_DIR)));
    let mut exit_code = exit_codes::OK;

    for (task, variants) in work {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        let run_dir = create_run_dir(&args.out, &task.id, &run_id)?;
        let scheduler = Scheduler::new(
            executor.clone(),
            snapshots.clone(),
            SchedulerConfig {
                audit_dir: Some(run_dir.clone()),
                ..SchedulerConfig::from_config(&cfg)
            },
        );
        debug!(task_id = %task.id, variants = variants.len(), "scheduling task");
        let result = scheduler
            .run(&task, &variants, cfg.worker_count)
            .with_context(|| format!("run task {}", task.id))?;
        let finished_at = Utc::now();

        let meta = RunMeta::new(
            &run_id,
            &dataset_hash,
            cfg.strict,
            started_at,
            finished_at,
            &result,
        );
        write_run(&run_dir, &result, &meta)?;

        for outcome in result.security_violations() {
            error!(
                task_id = %task.id,
                worker_id = outcome.worker_id,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "security violation"
            );
            exit_code = exit_codes::SECURITY_VIOLATION;
        }
        println!(
            "run: task={} run_id={} winner=worker-{} status={} results={}",
            task.id,
            run_id,
            result.winner.worker_id,
            result.winner.status,
            run_dir.display()
        );
    }
    if exit_code != exit_codes::OK {
        warn!("run finished with security violations");
    }
    Ok(exit_code)
}

/// Print aggregated results.
pub fn report(out: &Path) -> Result<i32> {
    let (summary, warnings) = aggregate(out)?;
    println!(
        "report: runs={} workers={} gate_rejections={}",
        summary.runs, summary.workers, summary.gate_rejections
    );
    match summary.pass_rate() {
        Some(rate) => println!(
            "report: passed={} failed={} pass_rate={rate:.2}",
            summary.passed,
            summary.failed()
        ),
        None => println!("report: passed=0 failed=0 pass_rate=-"),
    }
    for (status, count) in &summary.winners {
        println!("report: winner {status} {count}");
    }
    if let Some(avg) = summary.avg_duration_secs {
        println!(
            "report: avg_duration_secs={avg:.2} total_duration_secs={:.2}",
            summary.total_duration_secs
        );
    }
    for record in &summary.security_violations {
        println!(
            "report: security_violation task={} run_id={} worker={} detail={}",
            record.task_id,
            record.run_id,
            record.worker_id,
            record.detail.as_deref().unwrap_or("-")
        );
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(exit_codes::OK)
}
