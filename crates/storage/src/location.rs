//! Named storage locations and the kind → backend table.

use crate::backend::{LocalBackend, ReadOnlyBackend};
use crate::error::{ErrorKind, Result};
use crate::BackendHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::sync::Arc;

/// The closed set of storage tiers a dataset can live on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    /// Shared disk (project or work filesystems).
    Disk,
    /// Storage attached to a compute system (scratch).
    Compute,
    /// Tape-backed hierarchical storage.
    Tape,
}

impl LocationKind {
    /// Containers on this tier are copied into the local cache before reads.
    #[must_use]
    pub fn requires_staging(self) -> bool {
        matches!(self, Self::Tape)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Compute => "compute",
            Self::Tape => "tape",
        }
    }
}

impl Display for LocationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Static description of one named location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub name: String,
    pub kind: LocationKind,
    /// Absolute root of the location as seen by this process.
    pub root: PathBuf,
    /// Prefix made available to path templates as `prefix`.
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl LocationConfig {
    pub fn new(name: impl Into<String>, kind: LocationKind, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            root: root.into(),
            path_prefix: None,
            read_only: false,
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Builds a backend for a location.
pub type BackendFactory = fn(&LocationConfig) -> Result<BackendHandle>;

fn local_factory(config: &LocationConfig) -> Result<BackendHandle> {
    Ok(Arc::new(LocalBackend::new(&config.name, &config.root)?))
}

/// An opened location: its configuration plus a live backend.
#[derive(Clone)]
pub struct Location {
    config: LocationConfig,
    backend: BackendHandle,
}

impl Location {
    /// Pair a configuration with an already-constructed backend.
    pub fn new(config: LocationConfig, backend: BackendHandle) -> Self {
        Self { config, backend }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> LocationKind {
        self.config.kind
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Location")
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Table mapping each [`LocationKind`] to the factory that builds its backend.
///
/// Transports are added by explicit registration; nothing is discovered at
/// runtime. [`with_defaults`](Self::with_defaults) maps every kind to the
/// local filesystem backend, which is correct whenever the tier is mounted.
pub struct LocationRegistry {
    factories: HashMap<LocationKind, BackendFactory>,
}

impl LocationRegistry {
    pub fn empty() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(LocationKind::Disk, local_factory);
        registry.register(LocationKind::Compute, local_factory);
        registry.register(LocationKind::Tape, local_factory);
        registry
    }

    /// Register (or replace) the factory for a kind, returning the previous one.
    pub fn register(&mut self, kind: LocationKind, factory: BackendFactory) -> Option<BackendFactory> {
        self.factories.insert(kind, factory)
    }

    /// Build the backend for `config`, wrapping it read-only when requested.
    pub fn open(&self, config: &LocationConfig) -> Result<Location> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| exn::Exn::from(ErrorKind::UnsupportedKind(config.kind)))?;
        let mut backend = factory(config)?;
        if config.read_only {
            backend = Arc::new(ReadOnlyBackend::new(backend));
        }
        tracing::debug!(location = %config.name, kind = %config.kind, read_only = config.read_only, "Opened location");
        Ok(Location::new(config.clone(), backend))
    }
}

impl Default for LocationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_kind_serde_lowercase() {
        assert_eq!(serde_json::to_string(&LocationKind::Tape).unwrap(), "\"tape\"");
        let kind: LocationKind = serde_json::from_str("\"compute\"").unwrap();
        assert_eq!(kind, LocationKind::Compute);
        assert!(LocationKind::Tape.requires_staging());
        assert!(!LocationKind::Disk.requires_staging());
    }

    #[test]
    fn test_open_unregistered_kind() {
        let registry = LocationRegistry::empty();
        let config = LocationConfig::new("hsm", LocationKind::Tape, "/tmp/hsm");
        let err = registry.open(&config).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedKind(LocationKind::Tape)));
    }

    #[tokio::test]
    async fn test_open_read_only_refuses_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = LocationConfig::new("work", LocationKind::Disk, temp_dir.path()).read_only();
        let location = LocationRegistry::with_defaults().open(&config).unwrap();
        assert_eq!(location.name(), "work");
        let err = location.backend().write(Path::new("a.txt"), b"data").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_register_replaces_factory() {
        fn failing(_: &LocationConfig) -> Result<BackendHandle> {
            exn::bail!(ErrorKind::BackendError("offline".to_string()))
        }
        let temp_dir = tempfile::tempdir().unwrap();
        let mut registry = LocationRegistry::with_defaults();
        assert!(registry.register(LocationKind::Tape, failing).is_some());
        let config = LocationConfig::new("hsm", LocationKind::Tape, temp_dir.path());
        assert!(registry.open(&config).is_err());
        let disk = LocationConfig::new("work", LocationKind::Disk, temp_dir.path());
        assert!(registry.open(&disk).is_ok());
    }
}
