// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use log::{debug, warn};
use nix::sys::signal::{self, SigSet, Signal};
use nix::unistd::Pid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Runs `argv` to completion, killing it once `max_run_time` has passed
/// or `cancel` is set.
pub fn run_bounded(
    argv: &[String],
    max_run_time: Duration,
    cancel: &AtomicBool,
) -> anyhow::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    // own process group: a Ctrl+C on the terminal is meant for the worker only
    command.process_group(0);
    unsafe {
        // the worker blocks SIGINT/SIGTERM and the mask survives exec
        command.pre_exec(|| {
            SigSet::all()
                .thread_unblock()
                .map_err(std::io::Error::from)
        });
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;
    debug!("started {} as pid {}", program, child.id());

    let deadline = Instant::now() + max_run_time;
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            bail!("{} exited with {}", program, status);
        }
        if Instant::now() >= deadline {
            terminate(&mut child);
            bail!("execution expired after {:?}", max_run_time);
        }
        if cancel.load(Ordering::SeqCst) {
            terminate(&mut child);
            bail!("{} aborted", program);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM to the child's process group first, SIGKILL if the child is
/// still there after the grace period.
fn terminate(child: &mut Child) {
    // the child leads its own group, so its pid is the group id
    let pgid = Pid::from_raw(child.id() as i32);
    let _ = signal::killpg(pgid, Signal::SIGTERM);

    let deadline = Instant::now() + TERMINATION_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!("process group {} ignored SIGTERM, killing it", pgid);
    let _ = signal::killpg(pgid, Signal::SIGKILL);
    let _ = child.wait();
}
