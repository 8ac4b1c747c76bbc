//! Common test utilities for metadata integration tests.

pub mod fixtures;
pub mod metadata;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use metadata::*;
