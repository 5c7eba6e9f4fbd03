//! addrprobe: memory-access discovery for raw basic blocks
//!
//! Executes one straight-line block of machine code in an isolated, traced
//! child process and reports which memory blocks it touched, in the order it
//! first touched them. Memory is granted on demand: every access outside what
//! has been granted so far faults, is recorded, and is mapped before the
//! block resumes.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`], [`arch`])
//! - [`kernel::ptrace`]: tracing and wait wrappers
//! - [`kernel::memory`]: page size, `mmap_min_addr`, `/proc/<pid>/maps`
//! - [`kernel::fault`]: classification of tracee stops
//! - [`kernel::host`]: explicitly owned host facts
//! - [`arch`]: sentinel and stub encodings, register file access
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: type-state Launcher (Forked -> Stopped -> Scrubbed -> Primed)
//! - [`exec::child`]: the isolated context's post-fork routine
//! - [`exec::inject`]: syscalls executed inside the stopped tracee
//!
//! ## Discovery Core ([`core`])
//! - [`core::interceptor`]: fault state machine
//! - [`core::tracker`]: ordered, de-duplicated block set
//! - [`core::assembler`]: result assembly with guaranteed teardown
//! - [`core::supervisor`]: grant-and-resume loop with deadline and cancel
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: idempotent kill-and-reap of the isolated context
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured audit events
//! - [`observability::metrics`]: per-service counters and latency
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: shared types and the error taxonomy
//! - [`config::loader`]: JSON configuration loading
//! - [`config::validator`]: startup validation against the host
//!
//! # Example
//!
//! ```no_run
//! use addrprobe::{DiscoveryService, SandboxConfig};
//!
//! let service = DiscoveryService::new(SandboxConfig::default())?;
//! // mov [rax], eax ; mov [r11 + r12], eax
//! let addrs = service.discover(&[0x89, 0x00, 0x43, 0x89, 0x04, 0x23])?;
//! assert_eq!(addrs.accessed_blocks, vec![0x10000, 0x20000]);
//! # Ok::<(), addrprobe::DiscoveryError>(())
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("addrprobe supports x86-64 Linux hosts only");

// Kernel Primitives
pub mod arch;
pub mod kernel;

// Execution Control
pub mod exec;

// Discovery core
pub mod core;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

pub mod service;

pub use config::types::*;
pub use service::{discover_accessed_addresses, CancelToken, DiscoveryService};
