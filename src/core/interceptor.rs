//! Fault interceptor
//!
//! Decides what happens at every stop of a running block. The interceptor
//! never touches the tracee itself: the supervisor feeds it classified
//! [`StopEvent`]s and carries out the [`Action`] it returns.
//!
//! ```text
//! Running --access violation--> Faulted --in window, under caps--> Granting
//!    ^                             |                                  |
//!    +-------- grant applied ------+----------------------------------+
//!                                  |
//!                                  +--otherwise--> Aborted
//! Running --sentinel--> Trapped
//! Running --any other stop--> Aborted
//! ```

use crate::arch;
use crate::config::types::{AccessWindow, DiscoveryError, SandboxConfig, TimeoutLimit};
use crate::core::tracker::AddressTracker;
use crate::core::types::SandboxLayout;
use crate::kernel::fault::{describe_signal, AccessKind, StopEvent};
use nix::errno::Errno;
use std::time::{Duration, Instant};

/// How a block is made accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantMethod {
    /// Map fresh read/write memory where nothing is mapped.
    Map,
    /// Lift the protection of the Guarded Region.
    Unprotect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrant {
    /// The faulting address, before alignment
    pub addr: u64,
    pub block: u64,
    pub len: u64,
    pub method: GrantMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptorState {
    Running,
    Faulted { addr: u64, pc: u64 },
    Granting(BlockGrant),
    Trapped,
    Aborted,
}

/// What the supervisor must do next.
#[derive(Debug)]
pub enum Action {
    Grant(BlockGrant),
    Finish,
    Abort(DiscoveryError),
}

/// Bounds applied to one call.
#[derive(Debug, Clone, Copy)]
pub struct InterceptorLimits {
    pub access_window: AccessWindow,
    pub max_granted_blocks: usize,
    pub max_fault_iterations: u32,
}

impl From<&SandboxConfig> for InterceptorLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            access_window: config.access_window,
            max_granted_blocks: config.max_granted_blocks,
            max_fault_iterations: config.max_fault_iterations,
        }
    }
}

pub struct Interceptor {
    state: InterceptorState,
    layout: SandboxLayout,
    limits: InterceptorLimits,
    tracker: AddressTracker,
    iterations: u32,
    started: Instant,
}

impl Interceptor {
    pub fn new(layout: SandboxLayout, limits: InterceptorLimits) -> Self {
        Self {
            state: InterceptorState::Running,
            tracker: AddressTracker::new(layout.block_size),
            layout,
            limits,
            iterations: 0,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> &InterceptorState {
        &self.state
    }

    /// Grant-and-resume cycles completed so far.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn tracker(&self) -> &AddressTracker {
        &self.tracker
    }

    pub fn into_tracker(self) -> AddressTracker {
        self.tracker
    }

    /// React to one stop of the block.
    pub fn observe(&mut self, event: StopEvent) -> Action {
        if self.state != InterceptorState::Running {
            return self.abort(DiscoveryError::execution_fault(
                None,
                format!("stop {:?} observed in state {:?}", event, self.state),
            ));
        }

        match event {
            StopEvent::AccessViolation { addr, kind, pc } => {
                self.state = InterceptorState::Faulted { addr, pc };
                self.on_fault(addr, kind, pc)
            }
            StopEvent::Breakpoint { pc } => {
                if pc == self.layout.sentinel_addr() + arch::TRAP_PC_OFFSET {
                    self.state = InterceptorState::Trapped;
                    Action::Finish
                } else {
                    self.abort(DiscoveryError::execution_fault(
                        Some(pc.wrapping_sub(arch::TRAP_PC_OFFSET)),
                        "breakpoint outside the completion sentinel",
                    ))
                }
            }
            StopEvent::SyscallEntry { pc } => self.abort(DiscoveryError::execution_fault(
                Some(pc),
                "system call attempted by sandboxed code",
            )),
            StopEvent::Signal {
                signal,
                si_code,
                pc,
            } => self.abort(DiscoveryError::execution_fault(
                Some(pc),
                describe_signal(signal, si_code),
            )),
            StopEvent::Exited(code) => self.abort(DiscoveryError::execution_fault(
                None,
                format!("isolated context exited with status {}", code),
            )),
            StopEvent::Killed(signal) => self.abort(DiscoveryError::execution_fault(
                None,
                format!("isolated context killed by {}", signal),
            )),
        }
    }

    fn on_fault(&mut self, addr: u64, kind: AccessKind, pc: u64) -> Action {
        if self.iterations >= self.limits.max_fault_iterations {
            let err = self.timeout(TimeoutLimit::FaultIterations);
            return self.abort(err);
        }
        if !self.limits.access_window.contains(addr) {
            return self.abort(DiscoveryError::unresolvable(
                addr,
                "outside plausible-access window",
            ));
        }
        if self.layout.code_region.contains(addr) {
            return self.abort(DiscoveryError::unresolvable(addr, "access to the code region"));
        }
        if self.tracker.contains(addr) {
            return self.abort(DiscoveryError::execution_fault(
                Some(pc),
                format!("repeated fault on granted block {:#x}", self.tracker.block_of(addr)),
            ));
        }
        if self.tracker.len() >= self.limits.max_granted_blocks {
            return self.abort(DiscoveryError::unresolvable(
                addr,
                format!("grant cap of {} blocks reached", self.limits.max_granted_blocks),
            ));
        }

        let block = self.tracker.block_of(addr);
        let in_guard = self.layout.guard_region.contains(block);
        let method = match (kind, in_guard) {
            (AccessKind::Protected, true) => GrantMethod::Unprotect,
            (AccessKind::Unmapped, _) => GrantMethod::Map,
            (AccessKind::Protected, false) => {
                return self.abort(DiscoveryError::unresolvable(
                    addr,
                    "protected mapping outside the sandbox's regions",
                ))
            }
        };

        let grant = BlockGrant {
            addr,
            block,
            len: self.layout.block_size,
            method,
        };
        self.state = InterceptorState::Granting(grant);
        Action::Grant(grant)
    }

    /// The pending grant took effect; record it and go back to running.
    pub fn grant_applied(&mut self) {
        if let InterceptorState::Granting(grant) = self.state {
            self.tracker.record(grant.block);
            self.iterations += 1;
            self.state = InterceptorState::Running;
        }
    }

    /// The kernel refused the pending grant.
    pub fn grant_refused(&mut self, errno: Errno) -> DiscoveryError {
        let addr = match self.state {
            InterceptorState::Granting(grant) => grant.addr,
            _ => 0,
        };
        self.state = InterceptorState::Aborted;
        DiscoveryError::unresolvable(addr, format!("kernel refused grant: {}", errno))
    }

    /// The call ran out of time on `limit`.
    pub fn expire(&mut self, limit: TimeoutLimit) -> DiscoveryError {
        self.state = InterceptorState::Aborted;
        self.timeout(limit)
    }

    pub fn cancel(&mut self) -> DiscoveryError {
        self.state = InterceptorState::Aborted;
        DiscoveryError::Cancelled
    }

    fn timeout(&self, limit: TimeoutLimit) -> DiscoveryError {
        DiscoveryError::Timeout {
            limit,
            iterations: self.iterations,
            elapsed: self.elapsed(),
        }
    }

    fn abort(&mut self, err: DiscoveryError) -> Action {
        self.state = InterceptorState::Aborted;
        Action::Abort(err)
    }
}
