//! Benchmark driver for the repair-plan gating kernel.
//!
//! Loads a dataset of repair tasks and their plan variants, fans each task
//! out to isolated workers and records the winning outcome.

mod cli;
mod dataset;
mod plans;
mod report;
mod results;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::cli::RunArgs;

#[derive(Parser)]
#[command(
    name = "bench",
    version,
    about = "Gate, critique and race repair plans in isolated snapshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Gate and critique one plan file; prints both reports as JSON.
    Validate {
        plan: PathBuf,
        /// Fail on missing inputs and apply the strict command budget.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run every dataset task against its plan variants.
    Run {
        #[arg(long)]
        dataset: PathBuf,
        /// Directory holding `<task_id>/*.json` plan variants.
        #[arg(long)]
        plans: PathBuf,
        /// Overrides `worker_count` from the config.
        #[arg(long)]
        workers: Option<usize>,
        /// Run only this task; repeat to pick several. Dataset order is kept.
        #[arg(long = "task-id", value_name = "ID")]
        task_ids: Vec<String>,
        /// Stop after this many tasks.
        #[arg(long)]
        max_tasks: Option<usize>,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "bench-results")]
        out: PathBuf,
    },
    /// Aggregate recorded results.
    Report {
        #[arg(long, default_value = "bench-results")]
        out: PathBuf,
    },
}

fn main() {
    kernel::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            cli::exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate {
            plan,
            strict,
            config,
        } => cli::validate_plan(&plan, strict, config.as_deref()),
        Command::Run {
            dataset,
            plans,
            workers,
            task_ids,
            max_tasks,
            strict,
            config,
            out,
        } => cli::run_dataset(&RunArgs {
            dataset,
            plans,
            workers,
            task_ids,
            max_tasks,
            strict,
            config,
            out,
        }),
        Command::Report { out } => cli::report(&out),
    }
}
