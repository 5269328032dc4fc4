//! Archive Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An archive model error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive model operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Archive identifiers are restricted to ASCII alphanumerics, `-` and `_`.
    #[display("invalid archive id: {_0:?}")]
    InvalidArchiveId(#[error(not(source))] String),
    #[display("invalid checksum: {_0:?}")]
    InvalidChecksum(#[error(not(source))] String),
    #[display("invalid pattern: {_0}")]
    InvalidPattern(#[error(not(source))] String),
    #[display("invalid path template")]
    Template,
    /// No path mapping rule matched the logical path for this location.
    #[display("no path mapping for {} in location {location}", path.display())]
    UnresolvedPath { path: PathBuf, location: String },
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("invalid manifest: {_0}")]
    InvalidManifest(#[error(not(source))] String),
    #[display("unsupported manifest format version {_0}")]
    UnsupportedVersion(#[error(not(source))] u32),
    /// Fragment coverage must be exactly as long as the member.
    #[display("fragment coverage does not match member size: {}", _0.display())]
    InvalidFragment(#[error(not(source))] PathBuf),
    #[display("{}: expected {expected} bytes, read {actual}", path.display())]
    SizeMismatch { path: PathBuf, expected: u64, actual: u64 },
    #[display("member not found: {}", _0.display())]
    MemberNotFound(#[error(not(source))] PathBuf),
    #[display("manifest serialization failed")]
    Serialization,
    #[display("container compression failed")]
    Compression,
    #[display("container I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }
}
