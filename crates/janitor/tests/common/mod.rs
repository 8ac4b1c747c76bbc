//! Common test utilities for janitor integration tests.

pub mod git;
pub mod metadata;

#[allow(unused_imports)]
pub use git::*;
#[allow(unused_imports)]
pub use metadata::*;
