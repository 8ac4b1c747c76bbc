//! Core domain types and shared logic for Beacon.
//!
//! This crate defines the data model used across the workspace:
//! - Upload records and their processing state machine
//! - Package exports and references between uploads
//! - Commit graphs and ref descriptions
//! - The nearest-upload visibility algorithm
//! - Configuration

pub mod commit_graph;
pub mod config;
pub mod error;
pub mod package;
pub mod upload;
pub mod visibility;

pub use commit_graph::{CommitGraph, RefDescription, RefDescriptions, RefType};
pub use error::{Error, Result};
pub use package::{Package, PackageKey, PackageReference};
pub use upload::{CommitDate, MAX_UPLOAD_PARTS, NewUpload, Upload, UploadState};
pub use visibility::{NearestUpload, UploadMeta, VisibilityGraph, VisibilityOptions};
