//! Grant-and-resume drive loop
//!
//! Runs a launched block until the interceptor reaches a terminal state,
//! the wall clock runs out, or the caller cancels. Waiting is non-blocking
//! so the deadline and the cancel token are observed even while the block
//! spins without faulting.

use crate::config::types::{DiscoveryError, Result, TimeoutLimit};
use crate::core::interceptor::{Action, GrantMethod, Interceptor};
use crate::core::types::CancelToken;
use crate::exec::inject::RemoteSyscall;
use crate::exec::launcher::LaunchedSandbox;
use crate::kernel::fault;
use crate::kernel::ptrace::{self, ResumeMode};
use std::time::Duration;

const SPIN_YIELDS: u32 = 32;
const MIN_SLEEP: Duration = Duration::from_micros(50);
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Yield first, then sleep with doubling intervals.
#[derive(Debug)]
struct Backoff {
    spins: u32,
    sleep: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            spins: 0,
            sleep: MIN_SLEEP,
        }
    }

    fn snooze(&mut self) {
        if self.spins < SPIN_YIELDS {
            self.spins += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(MAX_SLEEP);
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Drive `sandbox` until it completes or fails. The caller owns teardown.
pub fn run_to_completion(
    sandbox: &mut LaunchedSandbox,
    interceptor: &mut Interceptor,
    wall_limit: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let pid = sandbox
        .tracee
        .pid()
        .ok_or_else(|| DiscoveryError::SandboxSetup("tracee already torn down".to_string()))?;
    let remote = RemoteSyscall::new(pid, sandbox.layout.stub_addr());
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            log::debug!("Discovery in {} cancelled", pid);
            return Err(interceptor.cancel());
        }
        if interceptor.elapsed() >= wall_limit {
            log::debug!("Discovery in {} exceeded {:?}", pid, wall_limit);
            return Err(interceptor.expire(TimeoutLimit::WallClock));
        }

        let status = match ptrace::poll_stop(pid)? {
            Some(status) => status,
            None => {
                backoff.snooze();
                continue;
            }
        };
        backoff.reset();
        // waitpid already reaped an exited tracee.
        sandbox.tracee.record_exit(&status);

        let event = fault::classify_stop(pid, status)?;
        log::trace!("Tracee {} stopped: {:?}", pid, event);

        match interceptor.observe(event) {
            Action::Finish => return Ok(()),
            Action::Abort(err) => return Err(err),
            Action::Grant(grant) => {
                let outcome = match grant.method {
                    GrantMethod::Map => remote.map_fixed(grant.block, grant.len)?,
                    GrantMethod::Unprotect => remote.protect_rw(grant.block, grant.len)?,
                };
                match outcome {
                    Ok(_) => {
                        log::debug!(
                            "Granted block {:#x} ({:?}) for access at {:#x}",
                            grant.block,
                            grant.method,
                            grant.addr
                        );
                        interceptor.grant_applied();
                    }
                    Err(errno) => return Err(interceptor.grant_refused(errno)),
                }
                ptrace::resume(pid, ResumeMode::UntilSyscall)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_sleep() {
        let mut backoff = Backoff::new();
        for _ in 0..SPIN_YIELDS {
            backoff.snooze();
        }
        assert_eq!(backoff.sleep, MIN_SLEEP);
        for _ in 0..8 {
            backoff.snooze();
        }
        assert_eq!(backoff.sleep, MAX_SLEEP);
        backoff.reset();
        assert_eq!(backoff.spins, 0);
        assert_eq!(backoff.sleep, MIN_SLEEP);
    }
}
