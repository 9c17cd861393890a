//! Error types for dandelion-core operations.
//!
//! Errors are categorized into:
//!
//! - **External errors**: wrapped errors from dependencies (libsql, git2,
//!   serde_json, io, zip, redis)
//! - **Internal errors**: generic failure modes (`NotFound`, `InvalidInput`)
//! - **Domain errors**: entity-specific failures carrying identifiers, which
//!   the HTTP layer maps onto status codes (404 for the not-found family,
//!   403 for `AppMismatch`, 400 for `BadPattern`)

use strum_macros::AsRefStr;
use thiserror::Error;

/// The error type for dandelion-core operations.
#[derive(Debug, Error, AsRefStr)]
pub enum Error {
    // -- External errors from dependencies
    /// Database error from libsql.
    #[error("Libsql Error: {0}")]
    Libsql(#[from] libsql::Error),

    /// Git repository error.
    #[error("Git Error: {0}")]
    Git2(#[from] git2::Error),

    /// JSON serialization/deserialization error.
    #[error("Serde JSON Error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Standard I/O error.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive encoding error.
    #[error("Zip Error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Event bus error.
    #[error("Bus Error: {0}")]
    Bus(#[from] redis::RedisError),

    // -- Internal errors for common failure modes
    /// Generic entity not found error.
    #[error("Entity not found")]
    NotFound,

    /// Input validation error.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A host or instance glob failed to compile.
    #[error("Invalid glob pattern: {0}")]
    BadPattern(#[from] glob::PatternError),

    // -- Domain errors
    /// Commit id not reachable in the repository.
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    /// No local branch with that name.
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// Path missing from the commit tree.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Release row missing or already rolled back.
    #[error("Release not found: {0}")]
    ReleaseNotFound(i64),

    /// No active release matched the (version, host, instance) triple.
    #[error("not found matched config")]
    NoMatchingRelease,

    /// Release belongs to a different app than the request path named.
    #[error("config id {id} does not belong to app {app_id}")]
    AppMismatch { app_id: String, id: i64 },
}

/// A specialized [`Result`] type for dandelion-core operations.
pub type Result<T> = core::result::Result<T, Error>;
