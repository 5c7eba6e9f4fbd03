//! Thin wrappers around Linux kernel primitives.
//!
//! Dependency direction: memory -> host -> ptrace -> fault

pub mod fault;
pub mod host;
pub mod memory;
pub mod ptrace;
