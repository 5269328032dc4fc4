use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// How hard the encoder should work.
///
/// Each codec has its own numeric scale; the level is mapped onto it at
/// encoder construction time. [`None`](Self::None) bypasses compression
/// entirely, regardless of the chosen format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    None,
    Fast,
    #[default]
    Balanced,
    Max,
}

impl CompressionLevel {
    pub(crate) fn gzip(self) -> flate2::Compression {
        match self {
            Self::None => flate2::Compression::none(),
            Self::Fast => flate2::Compression::fast(),
            Self::Balanced => flate2::Compression::new(6),
            Self::Max => flate2::Compression::best(),
        }
    }

    pub(crate) fn bzip2(self) -> bzip2::Compression {
        match self {
            // Bzip2 has no "store" level; the encoder is bypassed instead.
            Self::None | Self::Fast => bzip2::Compression::fast(),
            Self::Balanced => bzip2::Compression::new(6),
            Self::Max => bzip2::Compression::best(),
        }
    }

    #[cfg(feature = "xz")]
    pub(crate) fn xz(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fast => 1,
            Self::Balanced => 6,
            Self::Max => 9,
        }
    }

    #[cfg(feature = "zstd")]
    pub(crate) fn zstd(self) -> i32 {
        match self {
            Self::None | Self::Fast => 1,
            Self::Balanced => 3,
            Self::Max => 19,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Max => "max",
        }
    }
}

impl Display for CompressionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionLevel {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "store" => Ok(Self::None),
            "fast" => Ok(Self::Fast),
            "balanced" | "default" => Ok(Self::Balanced),
            "max" | "best" => Ok(Self::Max),
            _ => exn::bail!(ErrorKind::UnsupportedLevel(s.to_string())),
        }
    }
}
