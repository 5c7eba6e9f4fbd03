/// Teardown of the isolated execution context
///
/// Every resource a discovery call creates (code region, Guarded Region,
/// granted blocks) lives inside the traced child, so killing and reaping the
/// child reclaims all of it. The guard makes that idempotent and also runs it
/// when a call unwinds or returns early.
use crate::config::types::{to_setup_error, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// What teardown had to do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub pid: Option<i32>,
    pub kill_sent: bool,
    pub reaped: bool,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
}

/// Owns the isolated context's process until it has been killed and reaped.
#[derive(Debug)]
pub struct TraceeGuard {
    pid: Option<Pid>,
    exited: Option<TeardownReport>,
}

impl TraceeGuard {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid: Some(pid),
            exited: None,
        }
    }

    /// Note a wait status collected elsewhere. Once the child has been
    /// reaped its pid may be reused, so teardown must not signal it again.
    /// Returns whether `status` was terminal.
    pub fn record_exit(&mut self, status: &WaitStatus) -> bool {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return false,
        };
        let mut report = TeardownReport {
            pid: Some(pid.as_raw()),
            reaped: true,
            ..TeardownReport::default()
        };
        match *status {
            WaitStatus::Exited(_, code) => report.exit_code = Some(code),
            WaitStatus::Signaled(_, signal, _) => report.term_signal = Some(signal as i32),
            _ => return false,
        }
        debug!("Tracee {} already reaped: {:?}", pid, report);
        self.pid = None;
        self.exited = Some(report);
        true
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Kill and reap the child. Safe to call repeatedly; later calls are no-ops.
    pub fn teardown(&mut self) -> Result<TeardownReport> {
        let pid = match self.pid.take() {
            Some(pid) => pid,
            None => return Ok(self.exited.take().unwrap_or_default()),
        };

        let mut report = TeardownReport {
            pid: Some(pid.as_raw()),
            ..TeardownReport::default()
        };

        match kill(pid, Signal::SIGKILL) {
            Ok(()) => report.kill_sent = true,
            // Already gone but maybe not reaped yet.
            Err(Errno::ESRCH) => {}
            Err(e) => {
                self.pid = Some(pid);
                return Err(to_setup_error("kill(tracee)", e));
            }
        }

        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    report.reaped = true;
                    report.exit_code = Some(code);
                    break;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    report.reaped = true;
                    report.term_signal = Some(signal as i32);
                    break;
                }
                // Stops that raced with SIGKILL; the exit follows.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    self.pid = Some(pid);
                    return Err(to_setup_error("waitpid(teardown)", e));
                }
            }
        }

        debug!("Tracee {} torn down: {:?}", pid, report);
        Ok(report)
    }
}

impl Drop for TraceeGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            if let Err(e) = self.teardown() {
                warn!("Tracee teardown on drop failed: {}", e);
            }
        }
    }
}

/// Closes a raw descriptor on drop.
#[derive(Debug)]
pub struct FdGuard(RawFd);

impl FdGuard {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0
    }

    /// Give up ownership without closing.
    pub fn into_raw_fd(mut self) -> RawFd {
        let fd = self.0;
        self.0 = -1;
        fd
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}
