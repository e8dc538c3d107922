// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! # Worker loop
//!
//! Polls the job store until shutdown is requested. Two dispatch modes:
//!
//! - grouped (`group_by` set): sanity sweep, fetch eligible jobs that are
//!   not running here yet, hand each one to the launcher, sleep
//! - ungrouped: let the store select and run a batch on this thread,
//!   sleep only if the batch was empty
//!
//! Teardown always runs, also after the loop failed: wait for (or detach)
//! running jobs, then release the store locks held under this worker's name.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::Level;
use nix::sys::signal::Signal;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::WorkerConfig;
use crate::job::{JobId, JobQuery, JobStore};
use crate::launcher::execution::panic_message;
use crate::launcher::{Launcher, WorkerContext};

pub mod shutdown;
pub mod signals;

use shutdown::ShutdownToken;
use signals::InterruptHandler;

/// How the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested or there was no work left.
    Shutdown,
    /// The loop failed and teardown ran early.
    Aborted,
}

impl WorkerExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Shutdown => 0,
            WorkerExit::Aborted => 1,
        }
    }
}

/// The part of the worker that running jobs need access to.
#[derive(Debug)]
struct WorkerProfile {
    config: WorkerConfig,
}

impl WorkerContext for WorkerProfile {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn group_by(&self) -> Option<&str> {
        self.config.group_by.as_deref()
    }

    fn max_run_time(&self) -> Duration {
        self.config.max_run_time
    }

    fn say(&self, text: &str, level: Level) {
        let text = format!("[Worker({})] {}", self.config.name, text);
        log::log!(level, "{}", text);
        if !self.config.quiet {
            let clock = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
            let now = OffsetDateTime::now_utc()
                .format(&clock)
                .unwrap_or_default();
            println!("{} {}", now, text);
        }
    }
}

pub struct Worker {
    profile: Arc<WorkerProfile>,
    store: Arc<dyn JobStore>,
    launcher: Arc<Launcher>,
    shutdown: ShutdownToken,
}

impl Worker {
    pub fn new(config: WorkerConfig, store: Arc<dyn JobStore>, shutdown: ShutdownToken) -> Self {
        let max_concurrent_jobs = config.max_concurrent_jobs;
        let profile = Arc::new(WorkerProfile { config });
        let launcher = Arc::new(Launcher::new(profile.clone(), max_concurrent_jobs));
        Self {
            profile,
            store,
            launcher,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.profile.config
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn say(&self, text: &str, level: Level) {
        self.profile.say(text, level);
    }

    /// Routes interrupts from `signals::listen` into this worker.
    pub fn trap_signals(&self, interrupts: Receiver<Signal>) -> anyhow::Result<JoinHandle<()>> {
        let launcher = self.launcher.clone();
        let handler = InterruptHandler::new(
            self.profile.config.interrupt_window,
            self.shutdown.clone(),
            Box::new(move || {
                launcher.report_jobs_state();
            }),
        );
        handler.spawn(interrupts)
    }

    /// Runs the loop until shutdown, then tears down.
    pub fn start(&self) -> WorkerExit {
        self.say("Starting job worker", Level::Info);

        let exit = match panic::catch_unwind(AssertUnwindSafe(|| self.run_loop())) {
            Ok(Ok(())) => WorkerExit::Shutdown,
            Ok(Err(err)) => {
                self.say(&format!("worker loop failed: {:#}", err), Level::Error);
                WorkerExit::Aborted
            }
            Err(payload) => {
                self.say(
                    &format!("worker loop panicked: {}", panic_message(payload.as_ref())),
                    Level::Error,
                );
                WorkerExit::Aborted
            }
        };

        self.teardown();
        exit
    }

    fn run_loop(&self) -> anyhow::Result<()> {
        let grouped = self.profile.config.group_by.is_some();
        while !self.shutdown.is_requested() {
            let idle = if grouped {
                self.grouped_cycle()?
            } else {
                self.ungrouped_cycle()?
            };

            if idle && self.profile.config.exit_on_complete {
                self.say("No more jobs available. Exiting", Level::Info);
                self.shutdown.request();
                break;
            }
            if grouped || idle {
                self.shutdown.sleep(self.profile.config.sleep_delay);
            }
        }
        Ok(())
    }

    /// Returns `true` if nothing was launched and nothing is running.
    ///
    /// Jobs that were found but rejected do not count as work: a job whose
    /// group key cannot be computed would otherwise keep the worker busy
    /// forever.
    fn grouped_cycle(&self) -> anyhow::Result<bool> {
        self.launcher.check_thread_sanity();

        let query = self.query(self.launcher.job_ids_in_execution());
        let jobs = self.store.find_available(&query)?;

        let launched: Vec<JobId> = jobs
            .into_iter()
            .filter_map(|job| {
                let id = job.id();
                self.launcher.launch(job).then_some(id)
            })
            .collect();
        if !launched.is_empty() {
            let ids: Vec<String> = launched.iter().map(JobId::to_string).collect();
            self.say(&format!("launched jobs {}", ids.join(", ")), Level::Info);
        }

        Ok(launched.is_empty() && self.launcher.jobs_in_execution() == 0)
    }

    /// Returns `true` if the batch processed nothing.
    fn ungrouped_cycle(&self) -> anyhow::Result<bool> {
        let started = Instant::now();
        let stats = self.store.work_off(&self.query(Vec::new()))?;
        let runtime = started.elapsed().as_secs_f64().max(f64::EPSILON);

        let count = stats.total();
        if count > 0 {
            self.say(
                &format!(
                    "{} jobs processed at {:.4} j/s, {} failed",
                    count,
                    count as f64 / runtime,
                    stats.failed
                ),
                Level::Info,
            );
        }
        Ok(count == 0)
    }

    fn query(&self, exclude_ids: Vec<JobId>) -> JobQuery {
        let config = &self.profile.config;
        JobQuery {
            worker_name: config.name.clone(),
            max_run_time: config.max_run_time,
            min_priority: config.min_priority,
            max_priority: config.max_priority,
            job_types: config.job_types.clone(),
            owner: config.owner.clone(),
            exclude_ids,
            limit: config.read_ahead,
        }
    }

    fn teardown(&self) {
        let abandoned = self
            .launcher
            .kill_threads(self.profile.config.shutdown_timeout);
        if abandoned > 0 {
            self.say(
                &format!("{} jobs were still running and have been detached", abandoned),
                Level::Warn,
            );
        }
        if let Err(err) = self.store.clear_locks(self.name()) {
            self.say(&format!("failed to clear locks: {:#}", err), Level::Error);
        }
        self.say("Exiting...", Level::Info);
    }
}

#[cfg(test)]
mod tests;
