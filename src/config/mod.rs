//! Configuration
//!
//! Shared types, JSON loading, and startup validation against the host.

pub mod loader;
pub mod types;
pub mod validator;
