//! Library Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Dependency failures are wrapped as [`ErrorKind::Storage`],
//! [`ErrorKind::Archive`] or [`ErrorKind::Cache`] with the originating error
//! kept as the child frame.

use derive_more::{Display, Error};
use std::path::PathBuf;
use tellus_archive::{ArchiveId, Checksum, Interval};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// ### Request Errors
/// - [`ErrorKind::EmptyArchive`], [`ErrorKind::InvalidFragment`],
///   [`ErrorKind::InvalidRequest`], [`ErrorKind::UnknownLocation`]
/// - [`ErrorKind::ArchiveNotFound`], [`ErrorKind::MissingMember`],
///   [`ErrorKind::AlreadyRegistered`]
///
/// ### Content Errors
/// - [`ErrorKind::UnresolvedPath`], [`ErrorKind::ChecksumMismatch`],
///   [`ErrorKind::ExtractionConflict`]
/// - [`ErrorKind::FragmentConflict`], [`ErrorKind::IncompleteCoverage`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Storage`], [`ErrorKind::Archive`], [`ErrorKind::Cache`],
///   [`ErrorKind::Config`], [`ErrorKind::Task`]
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No path mapping rule matched the logical path for this location.
    #[display("no path mapping for {} in location {location}", path.display())]
    UnresolvedPath { path: PathBuf, location: String },
    /// The creation filter rejected every source file.
    #[display("no files matched the archive filter")]
    EmptyArchive,
    #[display("fragment coverage does not match member size: {}", _0.display())]
    InvalidFragment(#[error(not(source))] PathBuf),
    #[display("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: Checksum,
        actual: Checksum,
    },
    /// The destination exists and the conflict policy is `Fail`.
    #[display("destination already exists: {}", _0.display())]
    ExtractionConflict(#[error(not(source))] PathBuf),
    #[display("fragments from {existing} and {incoming} disagree over {overlap}")]
    FragmentConflict {
        existing: ArchiveId,
        incoming: ArchiveId,
        overlap: Interval,
    },
    #[display("incomplete coverage of {}: {} gap(s)", dataset.display(), gaps.len())]
    IncompleteCoverage { dataset: PathBuf, gaps: Vec<Interval> },
    #[display("archive not found: {_0}")]
    ArchiveNotFound(#[error(not(source))] ArchiveId),
    #[display("{archive_id} has no member {}", path.display())]
    MissingMember { archive_id: ArchiveId, path: PathBuf },
    /// An archive with this id is registered with different contents.
    #[display("archive {_0} is already registered with different contents")]
    AlreadyRegistered(#[error(not(source))] ArchiveId),
    #[display("unknown location: {_0}")]
    UnknownLocation(#[error(not(source))] String),
    #[display("invalid request: {_0}")]
    InvalidRequest(#[error(not(source))] String),
    /// Cancelled through the token or the progress callback. `partial`
    /// names output that was left in place.
    #[display("operation cancelled")]
    Cancelled { partial: Option<PathBuf> },
    #[display("storage operation failed")]
    Storage,
    #[display("archive format error")]
    Archive,
    #[display("cache operation failed")]
    Cache,
    #[display("invalid configuration")]
    Config,
    /// A blocking task panicked or was aborted.
    #[display("background task failed")]
    Task,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Cache | Self::Task)
    }
}
