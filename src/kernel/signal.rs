//! Async-safe shutdown signal capture.
//!
//! The handler only stores into atomics; the supervisor loop polls for the
//! request between non-blocking waits.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::config::types::{JailError, Result};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Pid that forwarded signals are relayed to, 0 when unset
static FORWARD_PID: AtomicI32 = AtomicI32::new(0);

/// Source of shutdown requests polled by the supervisor loop
pub trait ShutdownSource {
    /// Returns the pending signal number once, then `None`.
    fn take_request(&self) -> Option<i32>;
}

/// Shutdown requests delivered by real signals
pub struct ShutdownSignal;

impl ShutdownSignal {
    /// Install the handler for each of `signals`.
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in signals {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(*sig, &action) }.map_err(|e| {
                JailError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }
        log::debug!("Shutdown handler installed for {:?}", signals);
        Ok(Self)
    }

    /// Async-safe signal handler
    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }
}

impl ShutdownSource for ShutdownSignal {
    fn take_request(&self) -> Option<i32> {
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            Some(SIGNAL_RECEIVED.swap(0, Ordering::SeqCst))
        } else {
            None
        }
    }
}

/// Turn each of `signals` received by the controller into a SIGTERM for
/// `child`, the only signal the sandbox init handles.
///
/// Installed with SA_RESTART so the controller's blocking waitpid resumes.
pub fn forward_to(child: nix::unistd::Pid, signals: &[Signal]) -> Result<()> {
    FORWARD_PID.store(child.as_raw(), Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(forward_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in signals {
        // SAFETY: the handler only reads an atomic and calls kill(2).
        unsafe { signal::sigaction(*sig, &action) }.map_err(|e| {
            JailError::Process(format!("Failed to install {} forwarder: {}", sig, e))
        })?;
    }
    log::debug!("Forwarding {:?} to pid {}", signals, child);
    Ok(())
}

extern "C" fn forward_handler(_signal: libc::c_int) {
    let pid = FORWARD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

/// Restore the default disposition, used in the forked target before exec.
pub fn reset_to_default(signals: &[Signal]) {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in signals {
        // SAFETY: installing SIG_DFL is always safe.
        let _ = unsafe { signal::sigaction(*sig, &action) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_consumed_exactly_once() {
        let handler = ShutdownSignal::install(&[Signal::SIGUSR2]).unwrap();
        assert_eq!(handler.take_request(), None);

        signal::raise(Signal::SIGUSR2).unwrap();
        assert_eq!(handler.take_request(), Some(libc::SIGUSR2));
        assert_eq!(handler.take_request(), None);

        reset_to_default(&[Signal::SIGUSR2]);
    }

    #[test]
    fn forwarded_signals_arrive_as_sigterm() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        // SAFETY: the child only blocks in pause(2).
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                nix::unistd::pause();
            },
            ForkResult::Parent { child } => child,
        };

        forward_to(child, &[Signal::SIGUSR1]).unwrap();
        signal::raise(Signal::SIGUSR1).unwrap();
        reset_to_default(&[Signal::SIGUSR1]);

        assert!(matches!(
            waitpid(child, None).unwrap(),
            WaitStatus::Signaled(_, Signal::SIGTERM, _)
        ));
    }
}
