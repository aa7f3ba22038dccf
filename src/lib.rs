//! Local, optionally encrypted store for job applications and everything
//! collected about them.

pub mod clip;
pub mod config;
pub mod crypto;
pub mod db;
pub mod envelope;
pub mod error;
pub mod models;
pub mod relations;
pub mod repository;
pub mod schema;
pub mod sections;
pub mod transfer;

pub use clip::{ClipOutcome, ClippedPage, canonicalize_url};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use models::{
    ApplicationStatus, CompleteJobApplication, Entity, JobApplication, NewJobApplication, Record,
};
pub use relations::DeleteSummary;
pub use repository::Store;
pub use schema::{SCHEMA_VERSION, Table};
pub use sections::Section;
pub use transfer::{DatabaseSnapshot, ImportSummary, SpaceUsage, TableUsage};

/// Shorthand matching the crate's error type.
pub type Error = StoreError;
