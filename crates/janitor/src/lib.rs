//! Background worker for Beacon.
//!
//! This crate runs the periodic maintenance of the upload store:
//! - Cleanup sweeps for stuck, orphaned, expired and soft-deleted uploads
//! - Visibility recomputation for dirty repositories
//! - Commit-date resolution through git
//! - Health and Prometheus endpoints

pub mod error;
pub mod gitserver;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{JanitorError, JanitorResult};
pub use gitserver::{CommitGraphSource, GitCli, GitError};
pub use routes::create_router;
pub use state::{JanitorState, JobTaskRegistry};
