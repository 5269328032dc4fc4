//! Catalog of registered archives.
//!
//! Reads run concurrently; registration and deregistration take the single
//! writer lock. The registry also owns one mutex per archive so that at most
//! one extraction or range read touches a container at a time.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::TryStreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tellus_archive::{ArchiveId, ArchiveManifest, CompressedArchive, DateRange, ManifestSummary, Tag, container_name};
use tellus_storage::Location;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

/// Catalog view of one archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    pub summary: ManifestSummary,
    pub location: String,
    pub container: PathBuf,
    /// Union of member tags.
    pub tags: BTreeSet<Tag>,
    /// Span of member modification times.
    pub date_range: Option<DateRange>,
}

impl RegistryEntry {
    fn of(archive: &CompressedArchive) -> Self {
        Self {
            summary: archive.manifest.summary(),
            location: archive.location.clone(),
            container: archive.container.clone(),
            tags: archive.manifest.tags(),
            date_range: archive.manifest.date_range(),
        }
    }
}

struct Registered {
    archive: Arc<CompressedArchive>,
    entry: RegistryEntry,
}

#[derive(Default)]
pub struct ArchiveRegistry {
    archives: RwLock<BTreeMap<ArchiveId, Registered>>,
    locks: Mutex<HashMap<ArchiveId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an archive, returning the registered copy and whether it was
    /// newly added.
    ///
    /// Registering a manifest with the same id and content digest again is a
    /// no-op that returns the first registration, even when member metadata
    /// such as modification times differs. The same id with a different
    /// digest fails with [`ErrorKind::AlreadyRegistered`].
    #[instrument(skip_all, fields(archive_id = %archive.archive_id()))]
    pub async fn register(&self, archive: CompressedArchive) -> Result<(Arc<CompressedArchive>, bool)> {
        let mut archives = self.archives.write().await;
        if let Some(existing) = archives.get(archive.archive_id()) {
            if existing.archive.manifest.digest() != archive.manifest.digest() {
                exn::bail!(ErrorKind::AlreadyRegistered(archive.archive_id().clone()));
            }
            debug!("Archive already registered");
            return Ok((existing.archive.clone(), false));
        }
        let id = archive.archive_id().clone();
        let entry = RegistryEntry::of(&archive);
        let archive = Arc::new(archive);
        archives.insert(
            id,
            Registered {
                archive: archive.clone(),
                entry,
            },
        );
        info!(location = %archive.location, members = archive.manifest.members().len(), "Registered archive");
        Ok((archive, true))
    }

    pub async fn deregister(&self, archive_id: &ArchiveId) -> Option<Arc<CompressedArchive>> {
        let removed = self.archives.write().await.remove(archive_id).map(|r| r.archive);
        if removed.is_some() {
            self.locks.lock().unwrap_or_else(PoisonError::into_inner).remove(archive_id);
            info!(%archive_id, "Deregistered archive");
        }
        removed
    }

    pub async fn get(&self, archive_id: &ArchiveId) -> Option<Arc<CompressedArchive>> {
        self.archives.read().await.get(archive_id).map(|r| r.archive.clone())
    }

    /// Like [`get`](Self::get), failing with [`ErrorKind::ArchiveNotFound`].
    pub async fn require(&self, archive_id: &ArchiveId) -> Result<Arc<CompressedArchive>> {
        match self.get(archive_id).await {
            Some(archive) => Ok(archive),
            None => exn::bail!(ErrorKind::ArchiveNotFound(archive_id.clone())),
        }
    }

    pub async fn entry(&self, archive_id: &ArchiveId) -> Option<RegistryEntry> {
        self.archives.read().await.get(archive_id).map(|r| r.entry.clone())
    }

    /// Every entry, ordered by archive id.
    pub async fn list(&self) -> Vec<RegistryEntry> {
        self.archives.read().await.values().map(|r| r.entry.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.archives.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.archives.read().await.is_empty()
    }

    pub async fn find_by_tag(&self, tag: &Tag) -> Vec<RegistryEntry> {
        self.filter_entries(|entry| entry.tags.contains(tag)).await
    }

    /// Archives carrying all of `tags` (`match_all`) or any of them.
    pub async fn find_by_tags(&self, tags: &BTreeSet<Tag>, match_all: bool) -> Vec<RegistryEntry> {
        self.filter_entries(|entry| match match_all {
            true => tags.is_subset(&entry.tags),
            false => !tags.is_disjoint(&entry.tags),
        })
        .await
    }

    /// Archives whose member modification times overlap `range`.
    pub async fn find_by_date_range(&self, range: &DateRange) -> Vec<RegistryEntry> {
        self.filter_entries(|entry| entry.date_range.is_some_and(|span| span.overlaps(range)))
            .await
    }

    /// Archives holding a member at `logical_path`.
    pub async fn find_by_path(&self, logical_path: &Path) -> Vec<RegistryEntry> {
        self.archives
            .read()
            .await
            .values()
            .filter(|r| r.archive.manifest.member(logical_path).is_some())
            .map(|r| r.entry.clone())
            .collect()
    }

    /// Archives holding at least one fragment of `dataset`.
    pub async fn fragments_of(&self, dataset: &Path) -> Vec<Arc<CompressedArchive>> {
        self.archives
            .read()
            .await
            .values()
            .filter(|r| r.archive.manifest.fragments_of(dataset).next().is_some())
            .map(|r| r.archive.clone())
            .collect()
    }

    /// Archives holding fragments whose members carry all of `tags`.
    pub async fn fragments_tagged(&self, tags: &BTreeSet<Tag>) -> Vec<Arc<CompressedArchive>> {
        self.archives
            .read()
            .await
            .values()
            .filter(|r| {
                r.archive
                    .manifest
                    .members()
                    .iter()
                    .any(|m| m.fragment.is_some() && tags.is_subset(&m.tags))
            })
            .map(|r| r.archive.clone())
            .collect()
    }

    async fn filter_entries(&self, keep: impl Fn(&RegistryEntry) -> bool) -> Vec<RegistryEntry> {
        self.archives
            .read()
            .await
            .values()
            .filter(|r| keep(&r.entry))
            .map(|r| r.entry.clone())
            .collect()
    }

    /// Wait for exclusive access to one archive's container.
    pub async fn lock_archive(&self, archive_id: &ArchiveId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(archive_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Register every valid sidecar found in `location`, returning how many
    /// archives were added. Unreadable or invalid sidecars are skipped.
    #[instrument(skip_all, fields(location = %location.name()))]
    pub async fn rebuild_from_sidecars(&self, location: &Location) -> Result<usize> {
        let backend = location.backend();
        let files: Vec<_> = backend.list_stream(None).try_collect().await.or_raise(|| ErrorKind::Storage)?;
        let mut added = 0;
        for file in files {
            let Some(name) = file.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(archive_id) = ArchiveManifest::archive_id_from_sidecar(name) else {
                continue;
            };
            let manifest = match backend.read(&file.path).await {
                Ok(bytes) => match ArchiveManifest::from_json(&bytes) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!(path = %file.path.display(), error = ?err, "Skipping invalid sidecar");
                        continue;
                    },
                },
                Err(err) => {
                    warn!(path = %file.path.display(), error = ?err, "Skipping unreadable sidecar");
                    continue;
                },
            };
            if manifest.archive_id() != &archive_id {
                warn!(path = %file.path.display(), "Sidecar name does not match its archive id");
                continue;
            }
            let container = file.path.with_file_name(container_name(&archive_id, manifest.compression()));
            let archive = CompressedArchive {
                manifest,
                location: location.name().to_string(),
                container,
            };
            match self.register(archive).await {
                Ok((_, true)) => added += 1,
                Ok((_, false)) => {},
                Err(err) => warn!(%archive_id, error = ?err, "Skipping conflicting sidecar"),
            }
        }
        info!(added, "Rebuilt registry from sidecars");
        Ok(added)
    }
}
