// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Interrupt handling for the worker loop.
//!
//! Signals are blocked process-wide and picked up synchronously by a
//! listener thread, so no code runs in signal context. The listener
//! forwards every arrival to the interrupt handler, which debounces them:
//!
//! - a single interrupt, followed by silence for the window, requests shutdown
//! - a second interrupt inside the window asks for a status report and
//!   keeps the worker running

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info};
use nix::sys::signal::{SigSet, Signal};

use crate::worker::shutdown::ShutdownToken;

pub const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Blocks `signals` on the calling thread and forwards them from a listener thread.
///
/// Must run before any other thread is spawned: threads inherit the mask,
/// and a thread that does not block the signals would receive the default
/// disposition instead.
pub fn listen(signals: &[Signal]) -> anyhow::Result<Receiver<Signal>> {
    let mut set = SigSet::empty();
    for signal in signals {
        set.add(*signal);
    }
    set.thread_block()
        .context("failed to block the shutdown signals")?;

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || loop {
            match set.wait() {
                Ok(signal) => {
                    debug!("received {:?}", signal);
                    if tx.send(signal).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("waiting for signals failed: {}", err);
                    break;
                }
            }
        })
        .context("failed to spawn the signal listener")?;
    Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Armed,
    ShuttingDown,
}

pub struct InterruptHandler {
    window: Duration,
    shutdown: ShutdownToken,
    report: Box<dyn Fn() + Send>,
    state: InterruptState,
}

impl InterruptHandler {
    pub fn new(window: Duration, shutdown: ShutdownToken, report: Box<dyn Fn() + Send>) -> Self {
        Self {
            window,
            shutdown,
            report,
            state: InterruptState::Armed,
        }
    }

    pub fn state(&self) -> InterruptState {
        self.state
    }

    /// Handles one interrupt that was just received from `interrupts`.
    ///
    /// Blocks for up to the window to see whether a second one follows.
    pub fn on_interrupt<T>(&mut self, interrupts: &Receiver<T>) -> InterruptState {
        if self.state == InterruptState::ShuttingDown {
            info!("shutdown already in progress");
            return self.state;
        }

        match interrupts.recv_timeout(self.window) {
            Ok(_) => {
                debug!("second interrupt within {:?}, reporting status", self.window);
                (self.report)();
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                info!("interrupt received, shutting down after the current cycle");
                self.state = InterruptState::ShuttingDown;
                self.shutdown.request();
            }
        }
        self.state
    }

    /// Processes interrupts until the sending side goes away.
    pub fn run<T>(mut self, interrupts: Receiver<T>) {
        while interrupts.recv().is_ok() {
            self.on_interrupt(&interrupts);
        }
        debug!("interrupt source closed");
    }

    pub fn spawn<T: Send + 'static>(self, interrupts: Receiver<T>) -> anyhow::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("interrupt-handler".to_string())
            .spawn(move || self.run(interrupts))
            .context("failed to spawn the interrupt handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn handler(window: Duration) -> (InterruptHandler, ShutdownToken, Arc<AtomicUsize>) {
        let token = ShutdownToken::new();
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        let handler = InterruptHandler::new(
            window,
            token.clone(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (handler, token, reports)
    }

    #[test]
    fn test_double_interrupt_reports_status() {
        let (mut handler, token, reports) = handler(Duration::from_millis(500));
        let (tx, rx) = mpsc::channel();

        // the follow-up is already waiting when the first one is handled
        tx.send(()).unwrap();
        assert_eq!(handler.on_interrupt(&rx), InterruptState::Armed);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert!(!token.is_requested());
    }

    #[test]
    fn test_isolated_interrupt_requests_shutdown() {
        let (mut handler, token, reports) = handler(Duration::from_millis(100));
        let (_tx, rx) = mpsc::channel::<()>();

        let started = Instant::now();
        assert_eq!(handler.on_interrupt(&rx), InterruptState::ShuttingDown);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(reports.load(Ordering::SeqCst), 0);
        assert!(token.is_requested());

        // later interrupts change nothing
        assert_eq!(handler.on_interrupt(&rx), InterruptState::ShuttingDown);
        assert_eq!(reports.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_report_then_shutdown_on_running_handler() {
        let (handler, token, reports) = handler(Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        let handle = handler.spawn(rx).unwrap();

        tx.send(()).unwrap();
        tx.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while reports.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(400));
        assert!(!token.is_requested());

        tx.send(()).unwrap();
        assert!(token.sleep(Duration::from_secs(5)));
        assert_eq!(reports.load(Ordering::SeqCst), 1);

        drop(tx);
        handle.join().unwrap();
    }
}
