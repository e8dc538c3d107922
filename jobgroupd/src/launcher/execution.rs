// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use async_channel::Receiver;
use log::{debug, Level};

use crate::job::{Job, JobId};
use crate::launcher::registry::{Registry, SlotKey};
use crate::launcher::WorkerContext;

/// Body of the thread spawned for one admitted job.
pub(crate) struct ExecutionUnit {
    pub job: Arc<dyn Job>,
    pub slot: SlotKey,
    pub registry: Arc<Registry>,
    pub context: Arc<dyn WorkerContext>,
    /// Fires once the record for this unit is in the registry.
    pub registered: Receiver<()>,
}

impl ExecutionUnit {
    pub fn run(self) {
        if self.registered.recv_blocking().is_err() {
            // the launcher gave up before registering us; nothing to clean up
            debug!("job {}: launch abandoned before start", self.job.id());
            return;
        }

        // Dropped last: after the body and after release_resources, also on unwind.
        let _registration = Registration {
            registry: &self.registry,
            slot: &self.slot,
            job_id: self.job.id(),
        };

        self.execute();
        self.release_resources();
    }

    fn execute(&self) {
        let job = &self.job;
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            job.run(self.context.max_run_time(), self.context.name())
        }));
        let runtime = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(())) => self.context.say(
                &format!("{} (id {}) completed after {:.4}s", job.name(), job.id(), runtime),
                Level::Info,
            ),
            Ok(Err(err)) => self.context.say(
                &format!(
                    "{} (id {}) failed after {:.4}s with {:#}",
                    job.name(),
                    job.id(),
                    runtime,
                    err
                ),
                Level::Error,
            ),
            Err(payload) => self.context.say(
                &format!(
                    "{} (id {}) panicked after {:.4}s: {}",
                    job.name(),
                    job.id(),
                    runtime,
                    panic_message(payload.as_ref())
                ),
                Level::Error,
            ),
        }
    }

    fn release_resources(&self) {
        let job = &self.job;
        match panic::catch_unwind(AssertUnwindSafe(|| job.release_resources())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("job {}: ignoring failed resource release: {:#}", job.id(), err),
            Err(payload) => debug!(
                "job {}: ignoring panic in resource release: {}",
                job.id(),
                panic_message(payload.as_ref())
            ),
        }
    }
}

struct Registration<'a> {
    registry: &'a Registry,
    slot: &'a SlotKey,
    job_id: JobId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let record = self.registry.lock().remove_owned(self.slot, self.job_id);
        match record {
            Some(_) => debug!("job {}: released {}", self.job_id, self.slot),
            None => debug!("job {}: {} was already released", self.job_id, self.slot),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
