//! Discovery core.
//!
//! The interceptor decides, the supervisor drives the tracee, the tracker
//! remembers what was touched and the assembler turns it into a result.

pub mod assembler;
pub mod interceptor;
pub mod supervisor;
pub mod tracker;
pub mod types;
