//! Streaming compression for archive containers.
//!
//! This crate wraps several compression libraries behind a unified
//! [`Compression`] enum, providing:
//!
//! - **Format detection** from magic bytes ([`Compression::from_magic_bytes`])
//! - **Streaming** via wrapped readers ([`Compression::wrap_reader`]) and
//!   finishable encoders ([`Compression::encoder`])
//! - **Levels** chosen per archive through [`CompressionLevel`], mapped onto
//!   each codec's native scale
//!
//! Bzip2 and Gzip are always available. XZ and Zstd are behind (default)
//! feature flags.

mod construct;
pub mod error;
mod level;
mod ops;
mod util;

pub use crate::level::CompressionLevel;
pub use crate::ops::Encoder;

/// A supported compression format.
///
/// Variants gated behind feature flags (`xz`, `zstd`) are only available when
/// the corresponding feature is enabled. Defaults to [`None`](Self::None)
/// (uncompressed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    #[cfg(feature = "xz")]
    Xz,
    /// Zstd compression (.zst)
    #[cfg(feature = "zstd")]
    Zstd,
}
