//! Minimal init for the sandbox: reaps every descendant, follows one
//! monitored process at a time and enforces the wall-clock limit.
//!
//! The target may fork and exit, leaving its children behind. When the
//! monitored pid is reaped the supervisor picks the lowest remaining pid and
//! keeps going until nothing but itself is left.

use crate::config::types::{JailError, Result};
use crate::core::process_table::{ProcessTable, Reaper, Signaller, Sleeper, WaitEvent};
use crate::core::shutdown::ShutdownController;
use crate::core::types::{ChildStatus, MonitoredProcess, SupervisionEnd};
use crate::kernel::signal::ShutdownSource;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::Duration;

const CYCLE_PAUSE: Duration = Duration::from_millis(20);
const TICK: Duration = Duration::from_secs(1);
/// Poll interval when no timeout is configured
const IDLE_POLL: Duration = Duration::from_millis(100);
const RESCAN_BACKOFF: Duration = Duration::from_secs(2);

/// Kernel-facing collaborators of the supervisor loop
pub struct SupervisorDeps<'a> {
    pub table: &'a dyn ProcessTable,
    pub reaper: &'a mut dyn Reaper,
    pub signaller: &'a mut dyn Signaller,
    pub sleeper: &'a mut dyn Sleeper,
    pub shutdown: &'a dyn ShutdownSource,
}

pub struct Supervisor<'a> {
    deps: SupervisorDeps<'a>,
    command_name: String,
    timeout: Option<u64>,
    own_pid: i32,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        deps: SupervisorDeps<'a>,
        command_name: impl Into<String>,
        timeout: Option<u64>,
        own_pid: i32,
    ) -> Self {
        Self {
            deps,
            command_name: command_name.into(),
            timeout,
            own_pid,
        }
    }

    /// Follow `target` and its leftovers until none remain.
    pub fn supervise(&mut self, target: Pid) -> Result<SupervisionEnd> {
        let mut monitored = MonitoredProcess::Active(target);
        let mut last_status = ChildStatus::default();
        let mut remaining = self.timeout;

        while let MonitoredProcess::Active(pid) = monitored {
            self.deps.sleeper.sleep(CYCLE_PAUSE);
            log::debug!("monitoring pid {}", pid);
            let pid = pid.as_raw();

            loop {
                if let Some(signal) = self.deps.shutdown.take_request() {
                    let code = ShutdownController::new(
                        self.deps.table,
                        &mut *self.deps.signaller,
                        &mut *self.deps.sleeper,
                    )
                    .run(signal, Some(pid));
                    return Ok(SupervisionEnd::Shutdown(code));
                }

                match self.deps.reaper.wait_any()? {
                    WaitEvent::Interrupted => continue,
                    WaitEvent::NoChildren => {
                        log::debug!("no children left to wait for, rescanning");
                        self.deps.sleeper.sleep(TICK);
                        break;
                    }
                    WaitEvent::NothingYet if remaining.is_none() => {
                        self.deps.sleeper.sleep(IDLE_POLL);
                    }
                    WaitEvent::NothingYet => {
                        if self.tick(&mut remaining) {
                            return Ok(self.expire());
                        }
                    }
                    WaitEvent::Reaped { pid: reaped, status } => {
                        log::debug!("reaped pid {}: {:?}", reaped, status);
                        last_status = status;
                        if self.tick(&mut remaining) {
                            return Ok(self.expire());
                        }
                        if reaped == pid {
                            break;
                        }
                    }
                }
            }

            monitored = self.rescan(last_status)?;
        }

        match monitored {
            MonitoredProcess::Ended(status) => Ok(SupervisionEnd::Completed(status)),
            MonitoredProcess::Active(_) => Ok(SupervisionEnd::Completed(last_status)),
        }
    }

    /// One timeout tick. True once the limit is reached.
    fn tick(&mut self, remaining: &mut Option<u64>) -> bool {
        let Some(left) = remaining.as_mut() else {
            return false;
        };
        *left = left.saturating_sub(1);
        if *left == 0 {
            return true;
        }
        self.deps.sleeper.sleep(TICK);
        false
    }

    fn expire(&mut self) -> SupervisionEnd {
        log::warn!("timeout expired, terminating the sandbox");
        if let Err(e) = self.deps.signaller.broadcast(Signal::SIGTERM) {
            log::warn!("SIGTERM broadcast failed: {}", e);
        }
        self.deps.signaller.flush_stdin();
        self.deps.sleeper.sleep(TICK);
        if let Err(e) = self.deps.signaller.broadcast(Signal::SIGKILL) {
            log::warn!("SIGKILL broadcast failed: {}", e);
        }
        SupervisionEnd::TimedOut
    }

    fn rescan(&mut self, last_status: ChildStatus) -> Result<MonitoredProcess> {
        let pids = match self.deps.table.list_live_pids() {
            Ok(pids) => pids,
            Err(e) => {
                log::warn!("cannot scan the process table ({}), retrying", e);
                self.deps.sleeper.sleep(RESCAN_BACKOFF);
                self.deps.table.list_live_pids().map_err(|e| {
                    JailError::Process(format!("cannot scan the process table: {}", e))
                })?
            }
        };

        Ok(match self.select_next(&pids) {
            Some(pid) => MonitoredProcess::Active(Pid::from_raw(pid)),
            None => MonitoredProcess::Ended(last_status),
        })
    }

    /// Lowest pid that is neither init nor us. dillo's `dpid` helper never
    /// exits on its own, so it does not keep the session alive.
    fn select_next(&self, pids: &[i32]) -> Option<i32> {
        let mut candidates: Vec<i32> = pids
            .iter()
            .copied()
            .filter(|pid| *pid > 1 && *pid != self.own_pid)
            .collect();
        candidates.sort_unstable();

        candidates.into_iter().find(|pid| {
            if self.command_name == "dillo"
                && self.deps.table.read_command_name(*pid).as_deref() == Some("dpid")
            {
                log::debug!("skipping dpid helper {}", pid);
                return false;
            }
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process_table::testing::{
        FakeClock, FakeTable, RecordingSignaller, ScriptedReaper,
    };
    use std::cell::Cell;

    const OWN_PID: i32 = 4242;

    #[derive(Default)]
    struct Pending(Cell<Option<i32>>);

    impl ShutdownSource for Pending {
        fn take_request(&self) -> Option<i32> {
            self.0.take()
        }
    }

    fn reaped(pid: i32, code: i32) -> WaitEvent {
        WaitEvent::Reaped {
            pid,
            status: ChildStatus::Exited(code),
        }
    }

    struct Run {
        end: Result<SupervisionEnd>,
        reaper: ScriptedReaper,
        signaller: RecordingSignaller,
        clock: FakeClock,
    }

    fn run(
        table: &FakeTable,
        events: Vec<WaitEvent>,
        command: &str,
        timeout: Option<u64>,
        shutdown: &Pending,
        target: i32,
    ) -> Run {
        let mut reaper = ScriptedReaper::new(table, events);
        let mut signaller = RecordingSignaller::default();
        let mut clock = FakeClock::default();
        let end = {
            let deps = SupervisorDeps {
                table,
                reaper: &mut reaper,
                signaller: &mut signaller,
                sleeper: &mut clock,
                shutdown,
            };
            Supervisor::new(deps, command, timeout, OWN_PID).supervise(Pid::from_raw(target))
        };
        Run {
            end,
            reaper,
            signaller,
            clock,
        }
    }

    #[test]
    fn follows_leftover_children_but_never_pid_one() {
        let table = FakeTable::with(&[(1, "init"), (5, "sh"), (9, "sleep")]);
        let out = run(
            &table,
            vec![reaped(5, 0), reaped(9, 3)],
            "sh",
            None,
            &Pending::default(),
            5,
        );

        assert_eq!(
            out.end.unwrap(),
            SupervisionEnd::Completed(ChildStatus::Exited(3))
        );
        assert_eq!(out.reaper.calls, 2);
        assert!(out.signaller.sent.is_empty());
    }

    #[test]
    fn ends_when_only_pid_one_remains() {
        let table = FakeTable::with(&[(1, "init")]);
        let out = run(&table, vec![reaped(7, 2)], "true", None, &Pending::default(), 7);

        assert_eq!(
            out.end.unwrap(),
            SupervisionEnd::Completed(ChildStatus::Exited(2))
        );
    }

    #[test]
    fn other_children_are_reaped_while_waiting() {
        let table = FakeTable::with(&[(1, "init"), (5, "app"), (8, "helper")]);
        let out = run(
            &table,
            vec![reaped(8, 1), reaped(5, 0)],
            "app",
            None,
            &Pending::default(),
            5,
        );

        assert_eq!(
            out.end.unwrap(),
            SupervisionEnd::Completed(ChildStatus::Exited(0))
        );
        assert_eq!(out.reaper.calls, 2);
    }

    #[test]
    fn timeout_kills_within_limit_plus_one_tick() {
        let table = FakeTable::with(&[(1, "init"), (5, "app")]);
        let out = run(
            &table,
            vec![WaitEvent::NothingYet; 10],
            "app",
            Some(3),
            &Pending::default(),
            5,
        );

        assert_eq!(out.end.unwrap(), SupervisionEnd::TimedOut);
        assert_eq!(out.signaller.sent, vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert_eq!(out.signaller.flushes, 1);
        assert!(out.clock.elapsed >= Duration::from_secs(3));
        assert!(out.clock.elapsed <= Duration::from_secs(4));
    }

    #[test]
    fn dpid_does_not_keep_dillo_sessions_alive() {
        let table = FakeTable::with(&[(1, "init"), (3, "dpid"), (6, "dillo")]);
        let out = run(
            &table,
            vec![reaped(2, 0), reaped(6, 0)],
            "dillo",
            None,
            &Pending::default(),
            2,
        );

        assert_eq!(
            out.end.unwrap(),
            SupervisionEnd::Completed(ChildStatus::Exited(0))
        );
        assert_eq!(out.reaper.calls, 2);
    }

    #[test]
    fn dpid_is_followed_for_other_programs() {
        let table = FakeTable::with(&[(1, "init"), (3, "dpid")]);
        let out = run(
            &table,
            vec![reaped(2, 0), reaped(3, 0)],
            "sh",
            None,
            &Pending::default(),
            2,
        );

        assert!(out.end.is_ok());
        assert_eq!(out.reaper.calls, 2);
    }

    #[test]
    fn no_children_backs_off_and_rescans() {
        let table = FakeTable::with(&[(1, "init"), (5, "app")]);
        let out = run(
            &table,
            vec![WaitEvent::NoChildren, reaped(5, 4)],
            "app",
            None,
            &Pending::default(),
            5,
        );

        assert_eq!(
            out.end.unwrap(),
            SupervisionEnd::Completed(ChildStatus::Exited(4))
        );
        assert!(out.clock.naps.contains(&Duration::from_secs(1)));
    }

    #[test]
    fn rescan_is_retried_once() {
        let mut table = FakeTable::with(&[(1, "init")]);
        table.failing_scans = 1;
        let out = run(&table, vec![reaped(5, 0)], "app", None, &Pending::default(), 5);
        assert!(out.end.is_ok());
        assert!(out.clock.naps.contains(&Duration::from_secs(2)));

        let mut table = FakeTable::with(&[(1, "init")]);
        table.failing_scans = 2;
        let out = run(&table, vec![reaped(5, 0)], "app", None, &Pending::default(), 5);
        assert!(matches!(out.end, Err(JailError::Process(_))));
    }

    #[test]
    fn shutdown_request_runs_the_teardown() {
        let table = FakeTable::with(&[(1, "init"), (5, "app")]);
        let shutdown = Pending(Cell::new(Some(libc::SIGTERM)));
        let out = run(&table, vec![], "app", None, &shutdown, 5);

        assert_eq!(out.end.unwrap(), SupervisionEnd::Shutdown(libc::SIGTERM));
        assert_eq!(out.signaller.sent, vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert_eq!(out.reaper.calls, 0);
    }

    #[test]
    fn request_arriving_while_idle_is_seen_on_the_next_poll() {
        struct ThirdCheck(Cell<u32>);
        impl ShutdownSource for ThirdCheck {
            fn take_request(&self) -> Option<i32> {
                let n = self.0.get() + 1;
                self.0.set(n);
                (n == 3).then_some(libc::SIGTERM)
            }
        }

        let table = FakeTable::with(&[(1, "init"), (5, "app")]);
        let shutdown = ThirdCheck(Cell::new(0));
        let mut reaper = ScriptedReaper::new(&table, vec![WaitEvent::NothingYet; 2]);
        let mut signaller = RecordingSignaller::default();
        let mut clock = FakeClock::default();
        let deps = SupervisorDeps {
            table: &table,
            reaper: &mut reaper,
            signaller: &mut signaller,
            sleeper: &mut clock,
            shutdown: &shutdown,
        };
        let end = Supervisor::new(deps, "app", None, OWN_PID)
            .supervise(Pid::from_raw(5))
            .unwrap();

        assert_eq!(end, SupervisionEnd::Shutdown(libc::SIGTERM));
        assert_eq!(reaper.calls, 2);
        assert_eq!(
            clock.naps.iter().filter(|nap| **nap == IDLE_POLL).count(),
            2
        );
        assert_eq!(signaller.sent, vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[test]
    fn interrupted_wait_checks_for_shutdown() {
        struct SecondCall(Cell<u32>);
        impl ShutdownSource for SecondCall {
            fn take_request(&self) -> Option<i32> {
                let n = self.0.get() + 1;
                self.0.set(n);
                (n == 2).then_some(libc::SIGTERM)
            }
        }

        let table = FakeTable::with(&[(1, "init"), (5, "app")]);
        let shutdown = SecondCall(Cell::new(0));
        let mut reaper = ScriptedReaper::new(&table, vec![WaitEvent::Interrupted]);
        let mut signaller = RecordingSignaller::default();
        let mut clock = FakeClock::default();
        let deps = SupervisorDeps {
            table: &table,
            reaper: &mut reaper,
            signaller: &mut signaller,
            sleeper: &mut clock,
            shutdown: &shutdown,
        };
        let end = Supervisor::new(deps, "app", None, OWN_PID)
            .supervise(Pid::from_raw(5))
            .unwrap();

        assert_eq!(end, SupervisionEnd::Shutdown(libc::SIGTERM));
    }
}
