// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Job store backed by a JSON file of command jobs.
//!
//! The file is read once at startup; state (locks, results) lives in
//! memory for the lifetime of the process.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use log::debug;
use serde::Deserialize;

use crate::job::{GroupKey, Job, JobId, JobQuery, JobStore, WorkOffStats};

pub mod command;

/// Upper bound of jobs run by one `work_off` call.
pub const WORK_OFF_BATCH: usize = 100;

fn default_job_type() -> String {
    "command".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub owner: Option<String>,
    /// Values a worker can group by.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
    Failed(String),
}

#[derive(Debug)]
struct JobEntry {
    definition: JobDefinition,
    status: JobStatus,
    locked_by: Option<String>,
    locked_at: Option<Instant>,
    attempts: u32,
}

impl JobEntry {
    /// A lock older than `max_run_time` belongs to a worker that is gone.
    fn is_locked_for(&self, worker_name: &str, max_run_time: Duration) -> bool {
        match (&self.locked_by, self.locked_at) {
            (Some(owner), Some(at)) => owner != worker_name && at.elapsed() < max_run_time,
            _ => false,
        }
    }

    fn matches(&self, query: &JobQuery) -> bool {
        let definition = &self.definition;
        self.status == JobStatus::Pending
            && !self.is_locked_for(&query.worker_name, query.max_run_time)
            && query.min_priority.map_or(true, |min| definition.priority >= min)
            && query.max_priority.map_or(true, |max| definition.priority <= max)
            && (query.job_types.is_empty() || query.job_types.contains(&definition.job_type))
            && query
                .owner
                .as_ref()
                .map_or(true, |owner| definition.owner.as_ref() == Some(owner))
            && !query.exclude_ids.contains(&JobId(definition.id))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<u64, JobEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
}

impl fmt::Display for StoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pending, {} done, {} failed",
            self.pending, self.done, self.failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct JsonJobStore {
    state: Arc<Mutex<StoreState>>,
}

fn lock_state(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JsonJobStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let definitions: Vec<JobDefinition> = serde_json::from_str(&json)
            .with_context(|| format!("invalid job file {}", path.display()))?;
        Self::from_definitions(definitions)
    }

    pub fn from_definitions(definitions: Vec<JobDefinition>) -> anyhow::Result<Self> {
        let mut state = StoreState::default();
        for definition in definitions {
            if definition.command.is_empty() {
                bail!("job {} has an empty command", definition.id);
            }
            let id = definition.id;
            let entry = JobEntry {
                definition,
                status: JobStatus::Pending,
                locked_by: None,
                locked_at: None,
                attempts: 0,
            };
            if state.entries.insert(id, entry).is_some() {
                bail!("job id {} is used twice", id);
            }
        }
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        lock_state(&self.state)
            .entries
            .get(&id.0)
            .map(|entry| entry.status.clone())
    }

    pub fn attempts(&self, id: JobId) -> Option<u32> {
        lock_state(&self.state).entries.get(&id.0).map(|entry| entry.attempts)
    }

    pub fn locked_by(&self, id: JobId) -> Option<String> {
        lock_state(&self.state)
            .entries
            .get(&id.0)
            .and_then(|entry| entry.locked_by.clone())
    }

    pub fn summary(&self) -> StoreSummary {
        let state = lock_state(&self.state);
        let mut summary = StoreSummary::default();
        for entry in state.entries.values() {
            match entry.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Done => summary.done += 1,
                JobStatus::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    fn available(&self, query: &JobQuery) -> Vec<Arc<StoredJob>> {
        let state = lock_state(&self.state);
        let mut entries: Vec<&JobEntry> = state
            .entries
            .values()
            .filter(|entry| entry.matches(query))
            .collect();
        // entries come ordered by id, the sort is stable
        entries.sort_by_key(|entry| entry.definition.priority);
        entries
            .into_iter()
            .take(query.limit)
            .map(|entry| {
                Arc::new(StoredJob {
                    definition: entry.definition.clone(),
                    state: self.state.clone(),
                    held_by: Mutex::new(None),
                    aborted: AtomicBool::new(false),
                })
            })
            .collect()
    }
}

impl JobStore for JsonJobStore {
    fn find_available(&self, query: &JobQuery) -> anyhow::Result<Vec<Arc<dyn Job>>> {
        Ok(self
            .available(query)
            .into_iter()
            .map(|job| job as Arc<dyn Job>)
            .collect())
    }

    fn work_off(&self, query: &JobQuery) -> anyhow::Result<WorkOffStats> {
        let single = JobQuery {
            limit: 1,
            ..query.clone()
        };
        let mut stats = WorkOffStats::default();
        let mut seen = HashSet::new();

        for _ in 0..WORK_OFF_BATCH {
            let Some(job) = self.available(&single).pop() else {
                break;
            };
            if !seen.insert(job.id()) {
                // still pending after a run: locked elsewhere, try again next cycle
                break;
            }
            match job.run(query.max_run_time, &query.worker_name) {
                Ok(()) => stats.succeeded += 1,
                Err(err) => {
                    debug!("job {} failed: {:#}", job.id(), err);
                    stats.failed += 1;
                }
            }
            if let Err(err) = job.release_resources() {
                debug!("job {}: ignoring failed resource release: {:#}", job.id(), err);
            }
        }
        Ok(stats)
    }

    fn clear_locks(&self, worker_name: &str) -> anyhow::Result<()> {
        let mut state = lock_state(&self.state);
        for entry in state.entries.values_mut() {
            if entry.locked_by.as_deref() == Some(worker_name) {
                entry.locked_by = None;
                entry.locked_at = None;
            }
        }
        Ok(())
    }
}

/// Handle to one job of a `JsonJobStore`.
#[derive(Debug)]
pub struct StoredJob {
    definition: JobDefinition,
    state: Arc<Mutex<StoreState>>,
    /// Worker that took the lock in `run`, until `release_resources`.
    held_by: Mutex<Option<String>>,
    aborted: AtomicBool,
}

impl StoredJob {
    fn lock_exclusively(&self, max_run_time: Duration, worker_name: &str) -> anyhow::Result<()> {
        let mut state = lock_state(&self.state);
        let entry = state
            .entries
            .get_mut(&self.definition.id)
            .ok_or_else(|| anyhow!("job {} no longer exists", self.definition.id))?;
        if entry.status != JobStatus::Pending {
            bail!("job {} is no longer pending", self.definition.id);
        }
        if entry.is_locked_for(worker_name, max_run_time) {
            bail!(
                "job {} is locked by {}",
                self.definition.id,
                entry.locked_by.as_deref().unwrap_or_default()
            );
        }
        entry.locked_by = Some(worker_name.to_string());
        entry.locked_at = Some(Instant::now());
        entry.attempts += 1;
        *self.held_by.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker_name.to_string());
        Ok(())
    }

    fn record(&self, outcome: &anyhow::Result<()>) {
        let mut state = lock_state(&self.state);
        if let Some(entry) = state.entries.get_mut(&self.definition.id) {
            entry.status = match outcome {
                Ok(()) => JobStatus::Done,
                Err(err) => JobStatus::Failed(format!("{:#}", err)),
            };
        }
    }
}

impl Job for StoredJob {
    fn id(&self) -> JobId {
        JobId(self.definition.id)
    }

    fn name(&self) -> &str {
        &self.definition.name
    }

    fn group_key(&self, group_by: &str) -> anyhow::Result<Option<GroupKey>> {
        self.definition
            .attributes
            .get(group_by)
            .map(|value| Some(GroupKey::new(value.clone())))
            .ok_or_else(|| anyhow!("job {} has no attribute {}", self.definition.id, group_by))
    }

    fn run(&self, max_run_time: Duration, worker_name: &str) -> anyhow::Result<()> {
        self.lock_exclusively(max_run_time, worker_name)?;
        let outcome = command::run_bounded(&self.definition.command, max_run_time, &self.aborted);
        // an aborted job stays pending for the next worker
        if !self.aborted.load(Ordering::SeqCst) {
            self.record(&outcome);
        }
        outcome
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Drops the lock taken by `run`.
    fn release_resources(&self) -> anyhow::Result<()> {
        let Some(worker_name) = self
            .held_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let mut state = lock_state(&self.state);
        let entry = state
            .entries
            .get_mut(&self.definition.id)
            .ok_or_else(|| anyhow!("job {} no longer exists", self.definition.id))?;
        if entry.locked_by.as_deref() == Some(worker_name.as_str()) {
            entry.locked_by = None;
            entry.locked_at = None;
        }
        Ok(())
    }
}
