// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! jobgroupd: runs background jobs in parallel, at most one per group key
//! and at most `max_concurrent_jobs` at once.

pub mod config;
pub mod job;
pub mod json_store;
pub mod launcher;
pub mod worker;

pub use config::WorkerConfig;
pub use job::{GroupKey, Job, JobId, JobQuery, JobStore, WorkOffStats};
pub use launcher::{Launcher, Rejection, WorkerContext};
pub use worker::shutdown::ShutdownToken;
pub use worker::{Worker, WorkerExit};
