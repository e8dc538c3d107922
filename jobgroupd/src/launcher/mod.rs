// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! # Launcher: admission control for parallel jobs
//!
//! Every admitted job runs on its own thread. The registry maps a slot
//! (the job's group key, or its id when it has none) to the running
//! record, which gives two guarantees:
//!
//! - at most `max_concurrent_jobs` records exist at any time
//! - at most one record exists per group key
//!
//! Admission happens in one critical section: identity, group and
//! capacity checks, spawning the thread and inserting its record. The
//! thread is spawned suspended and only released after its record is
//! visible, so it can never finish (and unregister) before it was
//! registered.
//!
//! ```text
//!         launch(job)
//!             |
//!             v
//!     +----------------+   reject   +-------+
//!     | lock registry  |----------->| false |
//!     | check + spawn  |            +-------+
//!     | insert record  |
//!     +-------+--------+
//!             | release thread
//!             v
//!     +----------------+
//!     | run job        |
//!     | release        |
//!     | unregister     |
//!     +----------------+
//! ```

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn, Level};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::job::{Job, JobId};

pub(crate) mod execution;
pub mod registry;

use execution::{panic_message, ExecutionUnit};
use registry::{ExecutionRecord, Registry, SlotKey};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time aborted jobs get to unregister before their threads are detached.
pub const ABORT_GRACE: Duration = Duration::from_secs(3);

/// What the launcher needs from the worker that owns it.
pub trait WorkerContext: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Accessor used to compute group keys. `None` treats every job as ungrouped.
    fn group_by(&self) -> Option<&str>;

    fn max_run_time(&self) -> Duration;

    /// Operator-visible message.
    fn say(&self, text: &str, level: Level);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
    #[error("job {id}: group key unavailable: {reason}")]
    GroupKeyUnavailable { id: JobId, reason: String },
    #[error("job {id}: {slot} is busy")]
    GroupBusy { id: JobId, slot: SlotKey },
    #[error("job {id}: {limit} jobs already running")]
    AtCapacity { id: JobId, limit: usize },
    #[error("job {id}: could not spawn thread: {reason}")]
    SpawnFailed { id: JobId, reason: String },
}

pub struct Launcher {
    registry: Arc<Registry>,
    max_concurrent_jobs: NonZeroUsize,
    context: Arc<dyn WorkerContext>,
}

impl Launcher {
    pub fn new(context: Arc<dyn WorkerContext>, max_concurrent_jobs: NonZeroUsize) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            max_concurrent_jobs,
            context,
        }
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.get()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Starts `job` on its own thread. Returns `true` iff a thread was spawned.
    pub fn launch(&self, job: Arc<dyn Job>) -> bool {
        match self.try_launch(job) {
            Ok(()) => true,
            Err(rejection @ Rejection::GroupKeyUnavailable { .. }) => {
                // the object the job refers to is gone, the job will never start
                self.context.say(&rejection.to_string(), Level::Warn);
                false
            }
            Err(rejection) => {
                debug!("{}", rejection);
                false
            }
        }
    }

    pub fn try_launch(&self, job: Arc<dyn Job>) -> Result<(), Rejection> {
        let id = job.id();
        if self.registry.lock().is_running(id) {
            return Err(Rejection::AlreadyRunning(id));
        }

        // computed outside the lock, the store may be slow to answer
        let slot = self.slot_for(job.as_ref())?;

        let mut slots = self.registry.lock();
        if slots.is_running(id) {
            return Err(Rejection::AlreadyRunning(id));
        }
        if slots.is_occupied(&slot) {
            return Err(Rejection::GroupBusy { id, slot });
        }
        if slots.len() >= self.max_concurrent_jobs.get() {
            return Err(Rejection::AtCapacity {
                id,
                limit: self.max_concurrent_jobs.get(),
            });
        }

        let (registered_tx, registered_rx) = async_channel::bounded(1);
        let unit = ExecutionUnit {
            job: job.clone(),
            slot: slot.clone(),
            registry: self.registry.clone(),
            context: self.context.clone(),
            registered: registered_rx,
        };
        let handle = thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || unit.run())
            .map_err(|err| Rejection::SpawnFailed {
                id,
                reason: err.to_string(),
            })?;

        slots.insert(
            slot.clone(),
            ExecutionRecord {
                job,
                handle,
                started_at: Instant::now(),
                started_wall: OffsetDateTime::now_utc(),
            },
        );
        drop(slots);

        if registered_tx.send_blocking(()).is_err() {
            // thread is gone before it could start; the sanity sweep evicts the record
            warn!("job {}: thread exited before it was released", id);
        }
        debug!("job {}: launched in {}", id, slot);
        Ok(())
    }

    fn slot_for(&self, job: &dyn Job) -> Result<SlotKey, Rejection> {
        let id = job.id();
        let Some(group_by) = self.context.group_by() else {
            return Ok(SlotKey::Job(id));
        };
        match job.group_key(group_by) {
            Ok(Some(key)) => Ok(SlotKey::Group(key)),
            Ok(None) => Ok(SlotKey::Job(id)),
            Err(err) => Err(Rejection::GroupKeyUnavailable {
                id,
                reason: format!("{:#}", err),
            }),
        }
    }

    pub fn jobs_in_execution(&self) -> usize {
        self.registry.len()
    }

    pub fn job_ids_in_execution(&self) -> Vec<JobId> {
        self.registry.job_ids()
    }

    /// Renders the registry and hands it to the worker's `say`.
    pub fn report_jobs_state(&self) -> String {
        let snapshot = self.registry.snapshot();
        let clock = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

        let mut report = format!("{} jobs in execution", snapshot.len());
        for entry in &snapshot {
            let started = entry
                .started_wall
                .format(&clock)
                .unwrap_or_else(|_| "?".to_string());
            let _ = write!(
                report,
                "\n  {} (id {}) in {}: thread {}, running {:.1}s since {}",
                entry.job_name,
                entry.job_id,
                entry.slot,
                if entry.alive { "alive" } else { "dead" },
                entry.elapsed.as_secs_f64(),
                started
            );
        }
        self.context.say(&report, Level::Info);
        report
    }

    /// Evicts records whose thread ended without unregistering.
    ///
    /// That only happens if the unregister path itself failed, so every
    /// hit is reported as an error. Returns the number of evicted records.
    pub fn check_thread_sanity(&self) -> usize {
        let dead = self.registry.lock().take_dead();
        let evicted = dead.len();
        for (slot, record) in dead {
            let outcome = match record.handle.join() {
                Ok(()) => "returned".to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            self.context.say(
                &format!(
                    "thread of {} (id {}) in {} {} without unregistering, slot released",
                    record.job.name(),
                    record.job.id(),
                    slot,
                    outcome
                ),
                Level::Error,
            );
        }
        evicted
    }

    /// Waits up to `timeout` for running jobs to unregister, aborts the
    /// ones still running and gives them `ABORT_GRACE` to finish, then
    /// clears the registry. Threads that outlive the abort are detached.
    ///
    /// Returns the number of detached jobs.
    pub fn kill_threads(&self, timeout: Duration) -> usize {
        self.wait_until_empty(timeout);

        let running = self.registry.lock().live_jobs();
        if !running.is_empty() {
            for job in &running {
                self.context.say(
                    &format!(
                        "aborting {} (id {}), still running at shutdown",
                        job.name(),
                        job.id()
                    ),
                    Level::Warn,
                );
                job.abort();
            }
            drop(running);
            self.wait_until_empty(ABORT_GRACE);
        }

        let leftovers = self.registry.lock().drain();
        let mut abandoned = 0;
        for (slot, record) in leftovers {
            if record.is_alive() {
                abandoned += 1;
                self.context.say(
                    &format!(
                        "abandoning {} (id {}) in {}, still running after {:.1}s",
                        record.job.name(),
                        record.job.id(),
                        slot,
                        record.started_at.elapsed().as_secs_f64()
                    ),
                    Level::Warn,
                );
            } else {
                let _ = record.handle.join();
            }
        }
        abandoned
    }

    fn wait_until_empty(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.registry.is_empty() && Instant::now() < deadline {
            thread::sleep(KILL_POLL_INTERVAL);
        }
    }
}
