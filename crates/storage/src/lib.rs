//! Byte-level access to named storage locations.
//!
//! Every storage tier (shared disk, compute-attached scratch, tape) is
//! reached through the [`StorageBackend`] capability. Concrete backends are
//! selected per [`LocationKind`] through an explicit [`LocationRegistry`].

pub mod backend;
pub mod error;
mod location;
mod models;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::location::{BackendFactory, Location, LocationConfig, LocationKind, LocationRegistry};
pub use crate::models::FileInfo;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
