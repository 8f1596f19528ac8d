//! Graceful-then-forceful teardown of the sandbox after a shutdown signal.

use crate::core::process_table::{ProcessTable, Signaller, Sleeper};
use nix::sys::signal::Signal;
use std::time::Duration;

/// Liveness polls after SIGTERM before escalating
const TERM_GRACE_POLLS: u32 = 9;

pub struct ShutdownController<'a> {
    table: &'a dyn ProcessTable,
    signaller: &'a mut dyn Signaller,
    sleeper: &'a mut dyn Sleeper,
}

impl<'a> ShutdownController<'a> {
    pub fn new(
        table: &'a dyn ProcessTable,
        signaller: &'a mut dyn Signaller,
        sleeper: &'a mut dyn Sleeper,
    ) -> Self {
        Self {
            table,
            signaller,
            sleeper,
        }
    }

    /// SIGTERM everyone, give `monitored` up to ten seconds, then SIGKILL.
    ///
    /// Returns the exit code of the sandbox init, the signal number.
    pub fn run(&mut self, signal: i32, monitored: Option<i32>) -> i32 {
        log::info!("received signal {}, shutting down the sandbox", signal);

        if let Err(e) = self.signaller.broadcast(Signal::SIGTERM) {
            log::warn!("SIGTERM broadcast failed: {}", e);
        }
        self.sleeper.sleep(Duration::from_secs(1));

        if let Some(pid) = monitored {
            for _ in 0..TERM_GRACE_POLLS {
                if !self.table.is_alive(pid) {
                    log::debug!("pid {} exited after SIGTERM", pid);
                    break;
                }
                self.sleeper.sleep(Duration::from_secs(1));
            }
        }

        if let Err(e) = self.signaller.broadcast(Signal::SIGKILL) {
            log::warn!("SIGKILL broadcast failed: {}", e);
        }
        self.signaller.flush_stdin();
        signal
    }
}
