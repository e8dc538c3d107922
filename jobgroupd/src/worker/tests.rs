use super::*;
use crate::job::{GroupKey, Job, WorkOffStats};
use crate::json_store::{JobDefinition, JobStatus, JsonJobStore};

use anyhow::{anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

#[derive(Default)]
struct StoreState {
    done: Mutex<HashSet<JobId>>,
    running_per_group: Mutex<HashMap<String, usize>>,
    group_violation: AtomicBool,
    find_calls: AtomicUsize,
    cleared_for: Mutex<Vec<String>>,
}

struct FakeJob {
    id: JobId,
    name: String,
    group: String,
    fails: bool,
    /// The object the group key is derived from is gone.
    ungroupable: bool,
    state: Arc<StoreState>,
}

impl Job for FakeJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn group_key(&self, _group_by: &str) -> anyhow::Result<Option<GroupKey>> {
        if self.ungroupable {
            bail!("job {} references a deleted {}", self.id, self.group);
        }
        Ok(Some(GroupKey::new(self.group.clone())))
    }

    fn run(&self, _max_run_time: Duration, _worker_name: &str) -> anyhow::Result<()> {
        {
            let mut running = self.state.running_per_group.lock().unwrap();
            let count = running.entry(self.group.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.state.group_violation.store(true, Ordering::SeqCst);
            }
        }
        thread::sleep(Duration::from_millis(20));
        *self
            .state
            .running_per_group
            .lock()
            .unwrap()
            .get_mut(&self.group)
            .unwrap() -= 1;
        self.state.done.lock().unwrap().insert(self.id);
        if self.fails {
            bail!("job {} failed on purpose", self.id);
        }
        Ok(())
    }
}

struct FakeStore {
    jobs: Vec<Arc<FakeJob>>,
    state: Arc<StoreState>,
    broken: bool,
}

impl FakeStore {
    fn new(groups: &[&str]) -> Self {
        let state = Arc::new(StoreState::default());
        let jobs = groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                Arc::new(FakeJob {
                    id: JobId(i as u64 + 1),
                    name: format!("fake job {}", i + 1),
                    group: group.to_string(),
                    fails: false,
                    ungroupable: false,
                    state: state.clone(),
                })
            })
            .collect();
        Self {
            jobs,
            state,
            broken: false,
        }
    }

    fn pending(&self, query: &JobQuery) -> Vec<Arc<FakeJob>> {
        let done = self.state.done.lock().unwrap();
        self.jobs
            .iter()
            .filter(|job| !done.contains(&job.id) && !query.exclude_ids.contains(&job.id))
            .take(query.limit)
            .cloned()
            .collect()
    }
}

impl JobStore for FakeStore {
    fn find_available(&self, query: &JobQuery) -> anyhow::Result<Vec<Arc<dyn Job>>> {
        self.state.find_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(anyhow!("connection lost"));
        }
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

    fn clear_locks(&self, worker_name: &str) -> anyhow::Result<()> {
        self.state.cleared_for.lock().unwrap().push(worker_name.to_string());
        Ok(())
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new()
        .with_name("test worker")
        .with_quiet(true)
        .with_sleep_delay(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5))
}

#[test]
fn test_grouped_mode_runs_everything_once_per_group() {
    let store = Arc::new(FakeStore::new(&["a", "a", "b", "b", "c", "c", "a"]));
    let config = config()
        .with_group_by("group")
        .with_max_concurrent_jobs(NonZeroUsize::new(2).unwrap())
        .with_exit_on_complete(true);
    let worker = Worker::new(config, store.clone(), ShutdownToken::new());

    assert_eq!(worker.start(), WorkerExit::Shutdown);
    assert_eq!(store.state.done.lock().unwrap().len(), 7);
    assert!(!store.state.group_violation.load(Ordering::SeqCst));
    assert_eq!(worker.launcher().jobs_in_execution(), 0);
    assert_eq!(*store.state.cleared_for.lock().unwrap(), vec!["test worker".to_string()]);
}

#[test]
fn test_ungroupable_job_does_not_block_exit_on_complete() {
    let mut store = FakeStore::new(&["a", "b"]);
    let orphan = FakeJob {
        id: JobId(50),
        name: "orphan".to_string(),
        group: "project".to_string(),
        fails: false,
        ungroupable: true,
        state: store.state.clone(),
    };
    store.jobs.push(Arc::new(orphan));
    let store = Arc::new(store);
    let worker = Worker::new(
        config()
            .with_group_by("group")
            .with_max_concurrent_jobs(NonZeroUsize::new(2).unwrap())
            .with_exit_on_complete(true),
        store.clone(),
        ShutdownToken::new(),
    );

    let runner = thread::spawn(move || worker.start());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !runner.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(runner.is_finished(), "worker kept polling for an ungroupable job");
    assert_eq!(runner.join().unwrap(), WorkerExit::Shutdown);

    let done = store.state.done.lock().unwrap();
    assert_eq!(done.len(), 2);
    assert!(!done.contains(&JobId(50)));
}

#[test]
fn test_teardown_terminates_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = format!("echo $$ > {}; exec sleep 30", pidfile.display());

    let mut attributes = std::collections::BTreeMap::new();
    attributes.insert("g".to_string(), "a".to_string());
    let store = Arc::new(
        JsonJobStore::from_definitions(vec![JobDefinition {
            id: 1,
            name: "long".to_string(),
            job_type: "command".to_string(),
            priority: 0,
            owner: None,
            attributes,
            command: vec!["sh".to_string(), "-c".to_string(), script],
        }])
        .unwrap(),
    );
    let token = ShutdownToken::new();
    let worker = Worker::new(
        config()
            .with_group_by("g")
            .with_shutdown_timeout(Duration::from_millis(100)),
        store.clone(),
        token.clone(),
    );
    let runner = thread::spawn(move || worker.start());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut child = None;
    while child.is_none() && Instant::now() < deadline {
        child = std::fs::read_to_string(&pidfile)
            .ok()
            .and_then(|pid| pid.trim().parse::<i32>().ok());
        thread::sleep(Duration::from_millis(10));
    }
    let child = nix::unistd::Pid::from_raw(child.expect("command did not start"));

    token.request();
    assert_eq!(runner.join().unwrap(), WorkerExit::Shutdown);

    // reaped by the job thread, so the pid no longer exists
    assert_eq!(
        nix::sys::signal::kill(child, None),
        Err(nix::errno::Errno::ESRCH)
    );
    assert_eq!(store.status(JobId(1)), Some(JobStatus::Pending));
    assert_eq!(store.locked_by(JobId(1)), None);
}

#[test]
fn test_ungrouped_mode_counts_failures() {
    let mut store = FakeStore::new(&["a", "a", "a"]);
    let failing = FakeJob {
        id: JobId(99),
        name: "failing".to_string(),
        group: "a".to_string(),
        fails: true,
        ungroupable: false,
        state: store.state.clone(),
    };
    store.jobs.push(Arc::new(failing));
    let store = Arc::new(store);
    let worker = Worker::new(
        config().with_exit_on_complete(true),
        store.clone(),
        ShutdownToken::new(),
    );

    assert_eq!(worker.start(), WorkerExit::Shutdown);
    assert_eq!(store.state.done.lock().unwrap().len(), 4);
    // the launcher is not involved in this mode
    assert_eq!(store.state.find_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_loop_error_still_tears_down() {
    let mut store = FakeStore::new(&["a"]);
    store.broken = true;
    let store = Arc::new(store);
    let worker = Worker::new(config().with_group_by("group"), store.clone(), ShutdownToken::new());

    assert_eq!(worker.start(), WorkerExit::Aborted);
    assert_eq!(WorkerExit::Aborted.exit_code(), 1);
    assert_eq!(store.state.cleared_for.lock().unwrap().len(), 1);
}

#[test]
fn test_requested_shutdown_skips_loop() {
    let store = Arc::new(FakeStore::new(&["a", "b"]));
    let token = ShutdownToken::new();
    token.request();
    let worker = Worker::new(config().with_group_by("group"), store.clone(), token);

    assert_eq!(worker.start(), WorkerExit::Shutdown);
    assert_eq!(store.state.find_calls.load(Ordering::SeqCst), 0);
    assert!(store.state.done.lock().unwrap().is_empty());
    assert_eq!(store.state.cleared_for.lock().unwrap().len(), 1);
}

#[test]
fn test_shutdown_interrupts_sleep() {
    let store = Arc::new(FakeStore::new(&[]));
    let token = ShutdownToken::new();
    let worker = Worker::new(
        config()
            .with_group_by("group")
            .with_sleep_delay(Duration::from_secs(60)),
        store,
        token.clone(),
    );

    let started = Instant::now();
    let runner = thread::spawn(move || worker.start());
    thread::sleep(Duration::from_millis(100));
    token.request();

    assert_eq!(runner.join().unwrap(), WorkerExit::Shutdown);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_status_report_through_trapped_interrupts() {
    let store = Arc::new(FakeStore::new(&[]));
    let token = ShutdownToken::new();
    let worker = Worker::new(
        config()
            .with_group_by("group")
            .with_interrupt_window(Duration::from_millis(200)),
        store,
        token.clone(),
    );

    let (tx, rx) = std::sync::mpsc::channel();
    let handler = worker.trap_signals(rx).unwrap();

    tx.send(Signal::SIGINT).unwrap();
    tx.send(Signal::SIGINT).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert!(!token.is_requested());

    tx.send(Signal::SIGTERM).unwrap();
    assert!(token.sleep(Duration::from_secs(5)));

    drop(tx);
    handler.join().unwrap();
}
