//! Self-pipe plumbing: an async-signal-safe handler writes the signal number
//! into a non-blocking pipe whose read end the reactor polls like any other
//! fd. This turns signal delivery into ordinary readiness.

use crate::errors::{Result, RuntimeError};
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end of the live pipe, reachable from the signal handler. -1 when no
/// pipe exists.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // Only async-signal-safe calls allowed here; a full pipe drops the
        // byte, which collapses bursts the same way the kernel coalesces
        // pending signals.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

#[derive(Debug)]
pub(crate) struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    pub(crate) fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| RuntimeError::Reactor(format!("signal pipe: {e}")))?;
        SIGNAL_PIPE_WR.store(write.as_raw_fd(), Ordering::Relaxed);
        Ok(SignalPipe {
            read,
            _write: write,
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Reads out every pending signal number.
    pub(crate) fn drain(&self) -> SmallVec<[i32; 8]> {
        let mut out = SmallVec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            out.extend(buf[..n as usize].iter().map(|b| *b as i32));
        }
        out
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // Detach the handler's target before the fd closes.
        let _ = SIGNAL_PIPE_WR.compare_exchange(
            self._write.as_raw_fd(),
            -1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

pub(crate) fn install_handler(signal: Signal) -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }
        .map_err(|e| RuntimeError::Reactor(format!("sigaction({signal:?}): {e}")))?;
    Ok(())
}

pub(crate) fn restore_default(signal: Signal) {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { sigaction(signal, &action) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_via_handler_path() {
        let pipe = SignalPipe::new().unwrap();
        // Simulate a delivery without raising a real signal.
        on_signal(libc::SIGUSR1);
        on_signal(libc::SIGCHLD);
        let drained = pipe.drain();
        assert_eq!(drained.as_slice(), &[libc::SIGUSR1, libc::SIGCHLD]);
        assert!(pipe.drain().is_empty());
    }
}
