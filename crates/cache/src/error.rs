//! Cache Error Types

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("cache index error")]
    Database,
    #[display("cache index migration error")]
    Migration,
    #[display("invalid cache configuration: {_0}")]
    InvalidConfig(#[error(not(source))] String),
    /// A stored value could not be converted back into its model.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The producer failed to materialize an entry; nothing was recorded.
    #[display("failed to materialize {_0}")]
    Producer(#[error(not(source))] String),
    /// Pinned entries kept the cache above its budget. Recorded in
    /// statistics; never returned from an insertion.
    #[display("cannot evict below budget: {used} bytes in use, {max} allowed")]
    Eviction { used: u64, max: u64 },
    #[display("cache I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Io | Self::Producer(_))
    }
}
