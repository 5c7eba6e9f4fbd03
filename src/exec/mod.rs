//! Execution control
//!
//! Builds the isolated context (child side and tracer side) with type-state
//! enforced ordering, and injects syscalls into it on the tracer's behalf.

pub mod child;
pub mod inject;
pub mod launcher;
