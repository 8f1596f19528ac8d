//! Two-phase rendezvous between the privileged controller and the sandbox
//! init across the clone boundary.
//!
//! Two one-directional pipes carry single bytes; the payload is ignored. Each
//! side keeps only the ends it uses, so the other ends are closed when the
//! split halves are dropped.

use crate::config::types::{JailError, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

const HANDSHAKE_BYTE: u8 = b'1';

fn pipe_pair(label: &str) -> Result<(File, File)> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| JailError::Protocol(format!("pipe({}): {}", label, e)))?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    let pair = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
    Ok(pair)
}

/// Write one byte, retrying on EINTR.
pub fn signal(end: &mut File) -> Result<()> {
    loop {
        match end.write(&[HANDSHAKE_BYTE]) {
            Ok(1) => return Ok(()),
            Ok(_) => {
                return Err(JailError::Protocol(
                    "short write on handshake pipe".to_string(),
                ))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(JailError::Protocol(format!("handshake write: {}", e))),
        }
    }
}

/// Block until one byte arrives. End-of-stream means the peer is gone.
pub fn await_signal(end: &mut File) -> Result<()> {
    let mut buf = [0u8; 1];
    loop {
        match end.read(&mut buf) {
            Ok(0) => {
                return Err(JailError::Protocol(
                    "peer closed the handshake channel".to_string(),
                ))
            }
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(JailError::Protocol(format!("handshake read: {}", e))),
        }
    }
}

/// Both pipes, before the fork splits them
pub struct HandshakeChannel {
    to_child_read: File,
    to_child_write: File,
    to_controller_read: File,
    to_controller_write: File,
}

impl HandshakeChannel {
    pub fn open() -> Result<Self> {
        let (to_child_read, to_child_write) = pipe_pair("controller->child")?;
        let (to_controller_read, to_controller_write) = pipe_pair("child->controller")?;
        Ok(Self {
            to_child_read,
            to_child_write,
            to_controller_read,
            to_controller_write,
        })
    }

    /// Split into the two halves. The caller moves `ChildEnds` into the
    /// cloned child and keeps `ControllerEnds`.
    pub fn split(self) -> (ControllerEnds, ChildEnds) {
        (
            ControllerEnds {
                to_child: Some(self.to_child_write),
                from_child: Some(self.to_controller_read),
            },
            ChildEnds {
                from_controller: Some(self.to_child_read),
                to_controller: Some(self.to_controller_write),
            },
        )
    }
}

/// Ends used by the privileged controller
pub struct ControllerEnds {
    to_child: Option<File>,
    from_child: Option<File>,
}

impl ControllerEnds {
    /// Raw descriptors of these ends; the cloned child closes them because it
    /// shares the controller's memory image but must not hold the pipes open.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.to_child
            .iter()
            .chain(self.from_child.iter())
            .map(|f| f.as_raw_fd())
            .collect()
    }

    pub fn signal_namespaces_ready(&mut self) -> Result<()> {
        let end = self
            .to_child
            .as_mut()
            .ok_or_else(|| JailError::Protocol("controller write end already closed".to_string()))?;
        signal(end)
    }

    pub fn await_ready_for_mapping(&mut self) -> Result<()> {
        let end = self
            .from_child
            .as_mut()
            .ok_or_else(|| JailError::Protocol("controller read end already closed".to_string()))?;
        let result = await_signal(end);
        self.from_child = None;
        result
    }

    pub fn signal_mapping_complete(&mut self) -> Result<()> {
        let end = self
            .to_child
            .as_mut()
            .ok_or_else(|| JailError::Protocol("controller write end already closed".to_string()))?;
        let result = signal(end);
        self.to_child = None;
        result
    }
}

/// Ends used by the sandbox init
pub struct ChildEnds {
    from_controller: Option<File>,
    to_controller: Option<File>,
}

impl ChildEnds {
    pub fn await_namespaces_ready(&mut self) -> Result<()> {
        let end = self
            .from_controller
            .as_mut()
            .ok_or_else(|| JailError::Protocol("child read end already closed".to_string()))?;
        await_signal(end)
    }

    /// Signal the controller and close the write end.
    pub fn signal_ready_for_mapping(&mut self) -> Result<()> {
        let mut end = self
            .to_controller
            .take()
            .ok_or_else(|| JailError::Protocol("child write end already closed".to_string()))?;
        signal(&mut end)
    }

    /// Wait for the id maps and close the read end.
    pub fn await_mapping_complete(&mut self) -> Result<()> {
        let mut end = self
            .from_controller
            .take()
            .ok_or_else(|| JailError::Protocol("child read end already closed".to_string()))?;
        await_signal(&mut end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_round_trip_in_one_process() {
        let (mut controller, mut child) = HandshakeChannel::open().unwrap().split();

        controller.signal_namespaces_ready().unwrap();
        child.await_namespaces_ready().unwrap();

        child.signal_ready_for_mapping().unwrap();
        controller.await_ready_for_mapping().unwrap();

        controller.signal_mapping_complete().unwrap();
        child.await_mapping_complete().unwrap();
    }

    #[test]
    fn eof_without_signal_is_a_protocol_error() {
        let (controller, mut child) = HandshakeChannel::open().unwrap().split();
        drop(controller);

        let err = child.await_namespaces_ready().unwrap_err();
        assert!(matches!(err, JailError::Protocol(_)));
    }

    #[test]
    fn controller_sees_child_death_before_mapping() {
        let (mut controller, child) = HandshakeChannel::open().unwrap().split();
        controller.signal_namespaces_ready().unwrap();
        drop(child);

        let err = controller.await_ready_for_mapping().unwrap_err();
        assert!(matches!(err, JailError::Protocol(_)));
    }

    #[test]
    fn ends_are_single_use() {
        let (mut controller, mut child) = HandshakeChannel::open().unwrap().split();
        controller.signal_namespaces_ready().unwrap();
        child.await_namespaces_ready().unwrap();
        child.signal_ready_for_mapping().unwrap();

        assert!(matches!(
            child.signal_ready_for_mapping(),
            Err(JailError::Protocol(_))
        ));
    }

    #[test]
    fn raw_fds_lists_both_controller_ends() {
        let (controller, _child) = HandshakeChannel::open().unwrap().split();
        let fds = controller.raw_fds();
        assert_eq!(fds.len(), 2);
        assert_ne!(fds[0], fds[1]);
    }
}
