// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::num::NonZeroUsize;
use std::time::Duration;

pub const DEFAULT_SLEEP_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_READ_AHEAD: usize = 5;
pub const DEFAULT_INTERRUPT_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Suppresses the stdout echo of `say`; logging is unaffected.
    pub quiet: bool,
    pub sleep_delay: Duration,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub job_types: Vec<String>,
    pub owner: Option<String>,
    /// Switches to grouped dispatch through the launcher.
    pub group_by: Option<String>,
    pub max_concurrent_jobs: NonZeroUsize,
    pub max_run_time: Duration,
    pub read_ahead: usize,
    pub exit_on_complete: bool,
    /// Two interrupts within this window ask for a status report instead of shutdown.
    pub interrupt_window: Duration,
    /// How long teardown waits for running jobs before detaching them.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            quiet: false,
            sleep_delay: DEFAULT_SLEEP_DELAY,
            min_priority: None,
            max_priority: None,
            job_types: Vec::new(),
            owner: None,
            group_by: None,
            max_concurrent_jobs: NonZeroUsize::MIN,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            read_ahead: DEFAULT_READ_AHEAD,
            exit_on_complete: false,
            interrupt_window: DEFAULT_INTERRUPT_WINDOW,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_sleep_delay(mut self, delay: Duration) -> Self {
        self.sleep_delay = delay;
        self
    }

    pub fn with_priority_bounds(mut self, min: Option<i32>, max: Option<i32>) -> Self {
        self.min_priority = min;
        self.max_priority = max;
        self
    }

    pub fn with_job_types(mut self, job_types: Vec<String>) -> Self {
        self.job_types = job_types;
        self
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_group_by(mut self, group_by: impl Into<String>) -> Self {
        self.group_by = Some(group_by.into());
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    pub fn with_exit_on_complete(mut self, exit_on_complete: bool) -> Self {
        self.exit_on_complete = exit_on_complete;
        self
    }

    pub fn with_interrupt_window(mut self, window: Duration) -> Self {
        self.interrupt_window = window;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// `host:<hostname> pid:<pid>`, unique per process on a host.
pub fn default_worker_name() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("host:{} pid:{}", host, std::process::id())
}
