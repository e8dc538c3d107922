// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! In-memory store and jobs that record how they were scheduled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use jobgroupd::{GroupKey, Job, JobId, JobQuery, JobStore, WorkOffStats, WorkerContext};
use log::Level;

/// Scheduling observations shared by all jobs of a store.
#[derive(Debug, Default)]
pub struct Observations {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    running_per_group: Mutex<HashMap<GroupKey, usize>>,
    group_overlap: AtomicBool,
    completed: Mutex<HashSet<JobId>>,
    runs: AtomicUsize,
}

impl Observations {
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn saw_group_overlap(&self) -> bool {
        self.group_overlap.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn has_completed(&self, id: JobId) -> bool {
        self.completed.lock().unwrap().contains(&id)
    }

    /// Includes repeated runs of the same job.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn enter(&self, group: &GroupKey) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);

        let mut per_group = self.running_per_group.lock().unwrap();
        let count = per_group.entry(group.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.group_overlap.store(true, Ordering::SeqCst);
        }
    }

    fn leave(&self, id: JobId, group: &GroupKey) {
        if let Some(count) = self.running_per_group.lock().unwrap().get_mut(group) {
            *count -= 1;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.lock().unwrap().insert(id);
    }
}

/// A job that sleeps for a fixed time inside its group.
#[derive(Debug)]
pub struct SleepingJob {
    id: JobId,
    name: String,
    group: GroupKey,
    duration: Duration,
    observations: Arc<Observations>,
}

impl Job for SleepingJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn group_key(&self, _group_by: &str) -> anyhow::Result<Option<GroupKey>> {
        Ok(Some(self.group.clone()))
    }

    fn run(&self, _max_run_time: Duration, _worker_name: &str) -> anyhow::Result<()> {
        self.observations.enter(&self.group);
        thread::sleep(self.duration);
        self.observations.leave(self.id, &self.group);
        Ok(())
    }
}

/// Jobs spread round-robin over `groups` group keys.
pub struct ScriptedStore {
    jobs: Vec<Arc<SleepingJob>>,
    observations: Arc<Observations>,
}

impl ScriptedStore {
    pub fn new(job_count: usize, groups: usize, duration: Duration) -> Self {
        let observations = Arc::new(Observations::default());
        let groups = groups.max(1);
        let jobs = (0..job_count)
            .map(|i| {
                Arc::new(SleepingJob {
                    id: JobId(i as u64 + 1),
                    name: format!("sleeper {}", i + 1),
                    group: GroupKey::new(format!("group-{}", i % groups)),
                    duration,
                    observations: observations.clone(),
                })
            })
            .collect();
        Self { jobs, observations }
    }

    pub fn observations(&self) -> &Arc<Observations> {
        &self.observations
    }

    pub fn jobs(&self) -> Vec<Arc<dyn Job>> {
        self.jobs
            .iter()
            .map(|job| job.clone() as Arc<dyn Job>)
            .collect()
    }

    fn pending(&self, query: &JobQuery) -> Vec<Arc<SleepingJob>> {
        let completed = self.observations.completed.lock().unwrap();
        self.jobs
            .iter()
            .filter(|job| !completed.contains(&job.id) && !query.exclude_ids.contains(&job.id))
            .take(query.limit)
            .cloned()
            .collect()
    }
}

impl JobStore for ScriptedStore {
    fn find_available(&self, query: &JobQuery) -> anyhow::Result<Vec<Arc<dyn Job>>> {
        Ok(self
            .pending(query)
            .into_iter()
            .map(|job| job as Arc<dyn Job>)
            .collect())
    }

    fn work_off(&self, query: &JobQuery) -> anyhow::Result<WorkOffStats> {
        let mut stats = WorkOffStats::default();
        for job in self.pending(query) {
            match job.run(query.max_run_time, &query.worker_name) {
                Ok(()) => stats.succeeded += 1,
                Err(_) => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    fn clear_locks(&self, _worker_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Worker context for driving a `Launcher` directly.
#[derive(Debug)]
pub struct LogContext {
    pub group_by: Option<String>,
}

impl WorkerContext for LogContext {
    fn name(&self) -> &str {
        "fixture worker"
    }

    fn group_by(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    fn max_run_time(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn say(&self, text: &str, level: Level) {
        log::log!(level, "{}", text);
    }
}
