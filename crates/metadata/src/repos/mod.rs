//! Repository traits for metadata operations.

pub mod jobs;
pub mod packages;
pub mod repositories;
pub mod retention;
pub mod uploads;
pub mod visibility;

pub use jobs::{JobRepo, JobState, JobStats, JobType};
pub use packages::PackageRepo;
pub use repositories::RepositoryRepo;
pub use retention::RetentionRepo;
pub use uploads::{InsertedUpload, UploadRepo};
pub use visibility::{VisibilityRepo, VisibilityUpdate};
