//! Host-architecture support.
//!
//! Everything that depends on the instruction set or the ptrace register
//! layout lives here: the completion sentinel, the grant stub, and the
//! general-purpose register file used for priming and syscall injection.

mod x86_64;

pub use self::x86_64::*;
