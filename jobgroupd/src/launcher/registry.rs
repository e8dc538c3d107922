// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::job::{GroupKey, Job, JobId};

/// Registry slot. Ungrouped jobs occupy a slot derived from their own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Group(GroupKey),
    Job(JobId),
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Group(key) => write!(f, "group {}", key),
            SlotKey::Job(id) => write!(f, "job {}", id),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionRecord {
    pub job: Arc<dyn Job>,
    pub handle: JoinHandle<()>,
    pub started_at: Instant,
    pub started_wall: OffsetDateTime,
}

impl ExecutionRecord {
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Point-in-time copy of one registry entry, used for reporting.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub slot: SlotKey,
    pub job_id: JobId,
    pub job_name: String,
    pub alive: bool,
    pub started_wall: OffsetDateTime,
    pub elapsed: Duration,
}

/// The map guarded by the registry mutex. Only reachable through a guard.
#[derive(Debug, Default)]
pub struct Slots {
    entries: HashMap<SlotKey, ExecutionRecord>,
}

impl Slots {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.entries.values().any(|record| record.job.id() == id)
    }

    pub fn is_occupied(&self, slot: &SlotKey) -> bool {
        self.entries.contains_key(slot)
    }

    pub fn insert(&mut self, slot: SlotKey, record: ExecutionRecord) {
        let previous = self.entries.insert(slot, record);
        debug_assert!(previous.is_none(), "registry slot inserted twice");
    }

    /// Removes the record at `slot` only if it belongs to job `id`.
    pub fn remove_owned(&mut self, slot: &SlotKey, id: JobId) -> Option<ExecutionRecord> {
        match self.entries.get(slot) {
            Some(record) if record.job.id() == id => self.entries.remove(slot),
            _ => None,
        }
    }

    /// Removes every record whose thread has already terminated.
    pub fn take_dead(&mut self) -> Vec<(SlotKey, ExecutionRecord)> {
        let dead: Vec<SlotKey> = self
            .entries
            .iter()
            .filter(|(_, record)| !record.is_alive())
            .map(|(slot, _)| slot.clone())
            .collect();
        dead.into_iter()
            .filter_map(|slot| self.entries.remove(&slot).map(|record| (slot, record)))
            .collect()
    }

    pub fn live_jobs(&self) -> Vec<Arc<dyn Job>> {
        self.entries
            .values()
            .filter(|record| record.is_alive())
            .map(|record| record.job.clone())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(SlotKey, ExecutionRecord)> {
        self.entries.drain().collect()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.entries.values().map(|record| record.job.id()).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let mut snapshot: Vec<RecordSnapshot> = self
            .entries
            .iter()
            .map(|(slot, record)| RecordSnapshot {
                slot: slot.clone(),
                job_id: record.job.id(),
                job_name: record.job.name().to_string(),
                alive: record.is_alive(),
                started_wall: record.started_wall,
                elapsed: record.started_at.elapsed(),
            })
            .collect();
        snapshot.sort_by_key(|entry| entry.job_id);
        snapshot
    }
}

/// Single source of truth for what runs in this process.
#[derive(Debug, Default)]
pub struct Registry {
    slots: Mutex<Slots>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicking job thread must not take the registry down with it,
    /// so poisoning is ignored. Every mutation keeps the map consistent
    /// before it can unwind.
    pub fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.lock().job_ids()
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        self.lock().snapshot()
    }
}
