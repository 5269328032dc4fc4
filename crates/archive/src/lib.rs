//! Archive domain model.
//!
//! Everything here is synchronous and free of storage I/O: classification
//! ([`TagSystem`]), logical to physical path resolution ([`PathMapper`]),
//! the [`ArchiveManifest`] with its JSON sidecar, and the deterministic tar
//! container format read and written through plain [`std::io`] streams.

pub mod container;
mod entry;
pub mod error;
pub mod hash;
mod interval;
mod manifest;
mod model;
mod paths;
mod pattern;
mod tags;

pub use crate::container::{CompressedArchive, ContainerWriter, container_name};
pub use crate::entry::{FileEntry, FragmentRef};
pub use crate::interval::{DateRange, Interval};
pub use crate::manifest::{ArchiveManifest, MANIFEST_FORMAT_VERSION, ManifestSummary};
pub use crate::model::{ArchiveId, Checksum, Tag};
pub use crate::paths::{PathMapper, PathMapping};
pub use crate::pattern::Pattern;
pub use crate::tags::{FileImportance, TagRule, TagSystem};
