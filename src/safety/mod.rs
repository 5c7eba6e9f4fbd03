//! Safety & cleanup
//!
//! Teardown guards that reclaim every sandbox resource on all paths.

pub mod cleanup;
