//! Process-table, reaping, signalling and sleeping seams used by the
//! supervisor loop, with their kernel-backed defaults.

use crate::config::types::{JailError, Result};
use crate::core::types::ChildStatus;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Read-only view of the processes visible to the supervisor
pub trait ProcessTable {
    /// Live pids in ascending order.
    fn list_live_pids(&self) -> Result<Vec<i32>>;
    fn read_command_name(&self, pid: i32) -> Option<String>;
    fn is_alive(&self, pid: i32) -> bool;
}

/// Result of one wait for any child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitEvent {
    Reaped { pid: i32, status: ChildStatus },
    NothingYet,
    NoChildren,
    Interrupted,
}

/// Non-blocking reap of any child, so the caller can keep checking for
/// shutdown requests between polls.
pub trait Reaper {
    fn wait_any(&mut self) -> Result<WaitEvent>;
}

pub trait Signaller {
    fn broadcast(&mut self, signal: Signal) -> Result<()>;
    /// Drop pending terminal input so killed programs leave nothing behind.
    fn flush_stdin(&mut self);
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// `/proc` scanner
pub struct ProcfsTable {
    root: PathBuf,
}

impl ProcfsTable {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcfsTable {
    fn list_live_pids(&self) -> Result<Vec<i32>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            JailError::Process(format!("cannot read {}: {}", self.root.display(), e))
        })?;
        let mut pids: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| *pid > 0)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn read_command_name(&self, pid: i32) -> Option<String> {
        let comm = std::fs::read_to_string(self.root.join(pid.to_string()).join("comm")).ok()?;
        Some(comm.trim_end_matches('\n').to_string())
    }

    /// Zombies and exited processes have an empty command line.
    fn is_alive(&self, pid: i32) -> bool {
        let path = self.root.join(pid.to_string()).join("cmdline");
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut byte = [0u8; 1];
        matches!(file.read(&mut byte), Ok(1))
    }
}

pub struct KernelReaper;

impl Reaper for KernelReaper {
    fn wait_any(&mut self) -> Result<WaitEvent> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(WaitEvent::NothingYet),
            Ok(WaitStatus::Exited(pid, code)) => Ok(WaitEvent::Reaped {
                pid: pid.as_raw(),
                status: ChildStatus::Exited(code),
            }),
            Ok(WaitStatus::Signaled(pid, sig, _)) => Ok(WaitEvent::Reaped {
                pid: pid.as_raw(),
                status: ChildStatus::Signaled(sig as i32),
            }),
            Ok(other) => match other.pid() {
                Some(pid) => Ok(WaitEvent::Reaped {
                    pid: pid.as_raw(),
                    status: ChildStatus::Other,
                }),
                None => Ok(WaitEvent::NothingYet),
            },
            Err(Errno::ECHILD) => Ok(WaitEvent::NoChildren),
            Err(Errno::EINTR) => Ok(WaitEvent::Interrupted),
            Err(e) => Err(JailError::Process(format!("waitpid: {}", e))),
        }
    }
}

/// Who receives broadcast signals
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Every process in the namespace except the caller
    Namespace,
    /// The target's process group
    ProcessGroup(i32),
}

impl BroadcastTarget {
    pub fn for_current_process(target: i32) -> Self {
        if nix::unistd::getpid().as_raw() == 1 {
            BroadcastTarget::Namespace
        } else {
            BroadcastTarget::ProcessGroup(target)
        }
    }
}

pub struct KernelSignaller {
    target: BroadcastTarget,
}

impl KernelSignaller {
    pub fn new(target: BroadcastTarget) -> Self {
        Self { target }
    }
}

impl Signaller for KernelSignaller {
    fn broadcast(&mut self, signal: Signal) -> Result<()> {
        let result = match self.target {
            BroadcastTarget::Namespace => kill(Pid::from_raw(-1), signal),
            BroadcastTarget::ProcessGroup(pid) => kill(Pid::from_raw(-pid), signal)
                .or_else(|_| kill(Pid::from_raw(pid), signal)),
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(JailError::Process(format!("kill({}): {}", signal, e))),
        }
    }

    fn flush_stdin(&mut self) {
        // SAFETY: plain syscalls on fd 0 with no memory arguments.
        unsafe {
            if libc::isatty(libc::STDIN_FILENO) == 1 {
                libc::tcflush(libc::STDIN_FILENO, libc::TCIFLUSH);
            }
        }
    }
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, VecDeque};
    use std::rc::Rc;

    /// Pid to command name, shared between the fake table and reaper
    pub type FakeProcesses = Rc<RefCell<BTreeMap<i32, String>>>;

    /// Process table backed by a shared map of live processes
    #[derive(Default)]
    pub struct FakeTable {
        pub processes: FakeProcesses,
        /// Number of `list_live_pids` calls that fail before succeeding
        pub failing_scans: usize,
        pub scans: Cell<usize>,
    }

    impl FakeTable {
        pub fn with(processes: &[(i32, &str)]) -> Self {
            let map = processes
                .iter()
                .map(|(pid, name)| (*pid, name.to_string()))
                .collect();
            Self {
                processes: Rc::new(RefCell::new(map)),
                ..Self::default()
            }
        }

        pub fn remove(&self, pid: i32) {
            self.processes.borrow_mut().remove(&pid);
        }
    }

    impl ProcessTable for FakeTable {
        fn list_live_pids(&self) -> Result<Vec<i32>> {
            let scans = self.scans.get();
            self.scans.set(scans + 1);
            if scans < self.failing_scans {
                return Err(JailError::Process("proc unavailable".to_string()));
            }
            Ok(self.processes.borrow().keys().copied().collect())
        }

        fn read_command_name(&self, pid: i32) -> Option<String> {
            self.processes.borrow().get(&pid).cloned()
        }

        fn is_alive(&self, pid: i32) -> bool {
            self.processes.borrow().contains_key(&pid)
        }
    }

    /// Replays scripted wait results, then reports no children. Reaped pids
    /// disappear from the shared process map.
    #[derive(Default)]
    pub struct ScriptedReaper {
        pub events: VecDeque<WaitEvent>,
        pub calls: usize,
        processes: FakeProcesses,
    }

    impl ScriptedReaper {
        pub fn new(table: &FakeTable, events: Vec<WaitEvent>) -> Self {
            Self {
                events: events.into(),
                calls: 0,
                processes: Rc::clone(&table.processes),
            }
        }
    }

    impl Reaper for ScriptedReaper {
        fn wait_any(&mut self) -> Result<WaitEvent> {
            self.calls += 1;
            let event = self.events.pop_front().unwrap_or(WaitEvent::NoChildren);
            if let WaitEvent::Reaped { pid, .. } = event {
                self.processes.borrow_mut().remove(&pid);
            }
            Ok(event)
        }
    }

    #[derive(Default)]
    pub struct RecordingSignaller {
        pub sent: Vec<Signal>,
        pub flushes: usize,
    }

    impl Signaller for RecordingSignaller {
        fn broadcast(&mut self, signal: Signal) -> Result<()> {
            self.sent.push(signal);
            Ok(())
        }

        fn flush_stdin(&mut self) {
            self.flushes += 1;
        }
    }

    /// Advances a virtual clock instead of sleeping
    #[derive(Default)]
    pub struct FakeClock {
        pub elapsed: Duration,
        pub naps: Vec<Duration>,
    }

    impl Sleeper for FakeClock {
        fn sleep(&mut self, duration: Duration) {
            self.elapsed += duration;
            self.naps.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_proc(entries: &[(&str, &str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm, cmdline) in entries {
            let pdir = dir.path().join(pid);
            fs::create_dir(&pdir).unwrap();
            fs::write(pdir.join("comm"), format!("{}\n", comm)).unwrap();
            fs::write(pdir.join("cmdline"), cmdline).unwrap();
        }
        fs::create_dir(dir.path().join("self")).unwrap();
        fs::write(dir.path().join("uptime"), "1.0 1.0\n").unwrap();
        dir
    }

    #[test]
    fn procfs_lists_numeric_entries_sorted() {
        let dir = fake_proc(&[("42", "sh", "sh\0"), ("7", "dpid", "dpid\0"), ("1", "init", "x")]);
        let table = ProcfsTable::with_root(dir.path());

        assert_eq!(table.list_live_pids().unwrap(), vec![1, 7, 42]);
        assert_eq!(table.read_command_name(7).as_deref(), Some("dpid"));
        assert_eq!(table.read_command_name(99), None);
    }

    #[test]
    fn empty_cmdline_means_dead() {
        let dir = fake_proc(&[("5", "zombie", ""), ("6", "live", "live\0")]);
        let table = ProcfsTable::with_root(dir.path());

        assert!(!table.is_alive(5));
        assert!(table.is_alive(6));
        assert!(!table.is_alive(1234));
    }

    #[test]
    fn missing_proc_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = ProcfsTable::with_root(dir.path().join("nope"));
        assert!(table.list_live_pids().is_err());
    }
}
