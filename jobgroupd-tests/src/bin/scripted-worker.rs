// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Worker over in-memory sleeping jobs, driven by the signal tests.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use jobgroupd::worker::signals::{self, SHUTDOWN_SIGNALS};
use jobgroupd::{ShutdownToken, Worker, WorkerConfig};
use jobgroupd_tests::fixtures::ScriptedStore;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value_t = 0)]
    jobs: usize,

    #[arg(long, default_value_t = 1)]
    groups: usize,

    #[arg(long, default_value_t = 100)]
    job_ms: u64,

    #[arg(long, default_value_t = 2)]
    max_concurrent_jobs: usize,

    #[arg(long, default_value_t = 50)]
    sleep_delay_ms: u64,

    #[arg(long, default_value_t = 300)]
    interrupt_window_ms: u64,

    #[arg(long, default_value_t = 200)]
    shutdown_timeout_ms: u64,

    #[arg(long)]
    exit_on_complete: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let interrupts = signals::listen(&SHUTDOWN_SIGNALS)?;

    let store = Arc::new(ScriptedStore::new(
        args.jobs,
        args.groups,
        Duration::from_millis(args.job_ms),
    ));
    let config = WorkerConfig::new()
        .with_name("scripted")
        .with_group_by("group")
        .with_max_concurrent_jobs(
            NonZeroUsize::new(args.max_concurrent_jobs).unwrap_or(NonZeroUsize::MIN),
        )
        .with_sleep_delay(Duration::from_millis(args.sleep_delay_ms))
        .with_interrupt_window(Duration::from_millis(args.interrupt_window_ms))
        .with_shutdown_timeout(Duration::from_millis(args.shutdown_timeout_ms))
        .with_exit_on_complete(args.exit_on_complete);

    let worker = Worker::new(config, store.clone(), ShutdownToken::new());
    worker.trap_signals(interrupts)?;
    let exit = worker.start();

    let observations = store.observations();
    println!(
        "completed {} jobs, peak {} running, group overlap: {}",
        observations.completed(),
        observations.peak_running(),
        observations.saw_group_overlap()
    );
    std::process::exit(exit.exit_code());
}
