// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Interfaces towards the job store.
//!
//! The store decides which jobs are eligible, locks them against other
//! processes and executes their payload. The launcher only sees the
//! operations below.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stable identity of a job as handed out by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition value. At most one job per group key runs at any time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey(pub String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Job: Send + Sync + 'static {
    fn id(&self) -> JobId;

    /// Free-form description, used for logging and reports
    fn name(&self) -> &str;

    /// Computes the group key through the accessor named `group_by`.
    ///
    /// `Ok(None)` means the job is not grouped. An error means the key
    /// cannot be determined (e.g. the referenced object is gone) and the
    /// job must not be started.
    fn group_key(&self, group_by: &str) -> anyhow::Result<Option<GroupKey>>;

    /// Runs the payload under the store's lock, bounded by `max_run_time`.
    fn run(&self, max_run_time: Duration, worker_name: &str) -> anyhow::Result<()>;

    /// Best-effort cleanup after `run`, called whatever the outcome was.
    fn release_resources(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Asks a running `run` to stop early. Called from another thread at
    /// teardown; a job that cannot be interrupted keeps the default.
    fn abort(&self) {}
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Constraints passed to the store when asking for work.
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub worker_name: String,
    pub max_run_time: Duration,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Empty means every job type is accepted.
    pub job_types: Vec<String>,
    pub owner: Option<String>,
    /// Ids already running in this process.
    pub exclude_ids: Vec<JobId>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOffStats {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkOffStats {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub trait JobStore: Send + Sync {
    fn find_available(&self, query: &JobQuery) -> anyhow::Result<Vec<Arc<dyn Job>>>;

    /// Selects and runs a batch synchronously on the calling thread.
    fn work_off(&self, query: &JobQuery) -> anyhow::Result<WorkOffStats>;

    /// Releases every lock held under `worker_name`.
    fn clear_locks(&self, worker_name: &str) -> anyhow::Result<()>;
}
