// SPDX-License-Identifier: MIT
// jobgroupd: parallel job worker with per-group mutual exclusion
//
// - Polls a job store and runs eligible jobs on their own threads.
// - At most one running job per group key, at most N jobs overall.
// - Ctrl+C once: finish the cycle and exit. Twice quickly: print what is running.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use jobgroupd::json_store::JsonJobStore;
use jobgroupd::worker::signals::{self, SHUTDOWN_SIGNALS};
use jobgroupd::{ShutdownToken, Worker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON file with the job definitions
    #[arg(long, value_name = "FILE")]
    jobs: PathBuf,

    /// Worker name (defaults to host and pid)
    #[arg(long)]
    name: Option<String>,

    /// Do not echo worker messages to stdout
    #[arg(long, short)]
    quiet: bool,

    /// Seconds to sleep between polls
    #[arg(long, value_name = "SECONDS", default_value_t = 5.0)]
    sleep_delay: f64,

    #[arg(long)]
    min_priority: Option<i32>,

    #[arg(long)]
    max_priority: Option<i32>,

    /// Only run jobs of this type (repeatable)
    #[arg(long = "job-type", value_name = "TYPE")]
    job_types: Vec<String>,

    /// Only run jobs owned by this owner
    #[arg(long)]
    owner: Option<String>,

    /// Job attribute whose value groups jobs; enables parallel execution
    #[arg(long, value_name = "ATTRIBUTE")]
    group_by: Option<String>,

    /// Maximum number of jobs running at the same time (requires --group-by)
    #[arg(long, default_value_t = 1)]
    max_concurrent_jobs: usize,

    /// Seconds a single job may run before it is terminated
    #[arg(long, value_name = "SECONDS", default_value_t = 4.0 * 60.0 * 60.0)]
    max_run_time: f64,

    /// Jobs requested from the store per poll
    #[arg(long, default_value_t = 5)]
    read_ahead: usize,

    /// Exit once no jobs are left
    #[arg(long)]
    exit_on_complete: bool,

    /// Seconds to wait for running jobs on shutdown
    #[arg(long, value_name = "SECONDS", default_value_t = 30.0)]
    shutdown_timeout: f64,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if let (Some(min), Some(max)) = (args.min_priority, args.max_priority) {
        if min > max {
            return Err("--min-priority must not be greater than --max-priority".into());
        }
    }

    for (flag, value) in [
        ("--sleep-delay", args.sleep_delay),
        ("--max-run-time", args.max_run_time),
    ] {
        if !(value.is_finite() && value > 0.0) {
            return Err(format!("{} must be a positive number of seconds", flag));
        }
    }
    if !(args.shutdown_timeout.is_finite() && args.shutdown_timeout >= 0.0) {
        return Err("--shutdown-timeout must not be negative".into());
    }

    if args.max_concurrent_jobs == 0 {
        return Err("--max-concurrent-jobs must be at least 1".into());
    }
    if args.max_concurrent_jobs > 1 && args.group_by.is_none() {
        return Err("--max-concurrent-jobs only applies together with --group-by".into());
    }
    if args.read_ahead == 0 {
        return Err("--read-ahead must be at least 1".into());
    }

    Ok(())
}

fn config_from_args(args: &Args) -> WorkerConfig {
    let mut config = WorkerConfig::new()
        .with_quiet(args.quiet)
        .with_sleep_delay(Duration::from_secs_f64(args.sleep_delay))
        .with_priority_bounds(args.min_priority, args.max_priority)
        .with_job_types(args.job_types.clone())
        .with_owner(args.owner.clone())
        .with_max_concurrent_jobs(
            NonZeroUsize::new(args.max_concurrent_jobs).unwrap_or(NonZeroUsize::MIN),
        )
        .with_max_run_time(Duration::from_secs_f64(args.max_run_time))
        .with_read_ahead(args.read_ahead)
        .with_exit_on_complete(args.exit_on_complete)
        .with_shutdown_timeout(Duration::from_secs_f64(args.shutdown_timeout));
    if let Some(name) = &args.name {
        config = config.with_name(name.clone());
    }
    if let Some(group_by) = &args.group_by {
        config = config.with_group_by(group_by.clone());
    }
    config
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    // before any other thread exists
    let interrupts = signals::listen(&SHUTDOWN_SIGNALS)?;

    let store = Arc::new(JsonJobStore::load(&args.jobs)?);
    info!("loaded jobs from {}: {}", args.jobs.display(), store.summary());

    let worker = Worker::new(config_from_args(&args), store.clone(), ShutdownToken::new());
    worker.trap_signals(interrupts)?;

    let exit = worker.start();
    let summary = store.summary();
    if summary.failed > 0 {
        error!("jobs: {}", summary);
    } else {
        info!("jobs: {}", summary);
    }
    std::process::exit(exit.exit_code());
}
