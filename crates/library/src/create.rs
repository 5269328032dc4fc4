//! Archive creation.
//!
//! Source files are filtered, sorted by logical path and streamed one at a
//! time into a tar container inside the chosen codec, hashing on the way.
//! The container is written under a temporary name, renamed to
//! `<archive_id>.tar<ext>` once the manifest is built, described by a JSON
//! sidecar and registered.

use crate::error::{ErrorKind, Result};
use crate::locations::Locations;
use crate::progress::OperationContext;
use crate::registry::ArchiveRegistry;
use exn::ResultExt;
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tellus_archive::hash::HashingWriter;
use tellus_archive::{
    ArchiveId, ArchiveManifest, Checksum, CompressedArchive, ContainerWriter, DateRange, FileEntry, FragmentRef, Pattern, Tag,
    TagSystem, container_name,
};
use tellus_compress::{Compression, CompressionLevel};
use tellus_storage::{BackendHandle, FileInfo, validate_path};
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

/// One file to archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Path of the file within its dataset; becomes the member name.
    pub logical_path: PathBuf,
    /// Name of the location holding the file.
    pub location: String,
    /// Path of the file relative to the location root.
    pub physical_path: PathBuf,
    pub fragment: Option<FragmentRef>,
}

impl SourceFile {
    pub fn new(logical_path: impl Into<PathBuf>, location: impl Into<String>, physical_path: impl Into<PathBuf>) -> Self {
        Self {
            logical_path: logical_path.into(),
            location: location.into(),
            physical_path: physical_path.into(),
            fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: FragmentRef) -> Self {
        self.fragment = Some(fragment);
        self
    }
}

/// Which source files go into the archive. The default accepts everything.
#[derive(Clone, Debug, Default)]
pub struct ArchiveCreationFilter {
    /// Keep files carrying any of these tags (ignored when empty).
    pub include_tags: BTreeSet<Tag>,
    /// Drop files carrying any of these tags.
    pub exclude_tags: BTreeSet<Tag>,
    /// Keep files modified within this range.
    pub date_range: Option<DateRange>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Keep files whose logical path matches any of these (ignored when empty).
    pub include_globs: Vec<Pattern>,
    pub exclude_globs: Vec<Pattern>,
}

impl ArchiveCreationFilter {
    pub fn accepts(&self, logical_path: &Path, size: u64, modified: OffsetDateTime, tags: &BTreeSet<Tag>) -> bool {
        if !self.include_tags.is_empty() && self.include_tags.is_disjoint(tags) {
            return false;
        }
        if !self.exclude_tags.is_disjoint(tags) {
            return false;
        }
        if self.date_range.is_some_and(|range| !range.contains(modified)) {
            return false;
        }
        if self.min_size.is_some_and(|min| size < min) || self.max_size.is_some_and(|max| size > max) {
            return false;
        }
        if !self.include_globs.is_empty() && !self.include_globs.iter().any(|p| p.matches(logical_path)) {
            return false;
        }
        !self.exclude_globs.iter().any(|p| p.matches(logical_path))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveCreationConfig {
    /// Human-readable prefix of the archive id.
    pub name: String,
    pub compression: Compression,
    pub level: CompressionLevel,
    pub description: Option<String>,
    /// Location the container is written to.
    pub destination: String,
    /// Directory inside the destination holding the container.
    pub directory: PathBuf,
    pub write_sidecar: bool,
}

impl ArchiveCreationConfig {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compression: Compression::Gzip,
            level: CompressionLevel::Balanced,
            description: None,
            destination: destination.into(),
            directory: PathBuf::new(),
            write_sidecar: true,
        }
    }

    pub fn with_compression(mut self, compression: Compression, level: CompressionLevel) -> Self {
        self.compression = compression;
        self.level = level;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn in_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveCreationResult {
    pub archive: Arc<CompressedArchive>,
    pub files_archived: usize,
    pub files_skipped: usize,
    /// Sum of member sizes.
    pub total_size: u64,
    /// Size of the container as written.
    pub compressed_size: u64,
}

impl ArchiveCreationResult {
    pub fn archive_id(&self) -> &ArchiveId {
        self.archive.archive_id()
    }
}

struct Candidate {
    source: SourceFile,
    info: FileInfo,
    tags: BTreeSet<Tag>,
}

type Sink = ContainerWriter<HashingWriter<tellus_storage::backend::BoxSyncWrite>>;

pub struct ArchiveCreationService {
    locations: Arc<Locations>,
    tags: Arc<TagSystem>,
    registry: Arc<ArchiveRegistry>,
}

impl ArchiveCreationService {
    pub fn new(locations: Arc<Locations>, tags: Arc<TagSystem>, registry: Arc<ArchiveRegistry>) -> Self {
        Self { locations, tags, registry }
    }

    /// Archive every source file accepted by `filter`.
    ///
    /// Cancellation is checked before each member. A cancelled creation
    /// registers nothing and reports the partial container through
    /// [`ErrorKind::Cancelled`]; any other failure deletes it.
    ///
    /// When an archive with the resulting id is already registered, the new
    /// container is discarded and the registered archive returned, provided
    /// both share a content digest.
    #[instrument(skip_all, fields(name = %config.name, destination = %config.destination))]
    pub async fn create(
        &self,
        sources: Vec<SourceFile>,
        filter: &ArchiveCreationFilter,
        config: &ArchiveCreationConfig,
        ctx: &OperationContext,
    ) -> Result<ArchiveCreationResult> {
        let (candidates, files_skipped) = self.select(sources, filter).await?;
        if candidates.is_empty() {
            exn::bail!(ErrorKind::EmptyArchive);
        }
        for candidate in &candidates {
            if let Some(fragment) = &candidate.source.fragment
                && fragment.coverage.len() != candidate.info.size
            {
                exn::bail!(ErrorKind::InvalidFragment(candidate.source.logical_path.clone()));
            }
        }

        let destination = self.locations.get(&config.destination)?;
        let backend = destination.backend();
        let partial = config.directory.join(format!(
            ".{}-{}-{}.partial",
            config.name,
            std::process::id(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        let (manifest, compressed_size) = match self.write_container(candidates, config, backend, &partial, ctx).await {
            Ok(built) => built,
            Err(err) => {
                if !matches!(&*err, ErrorKind::Cancelled { .. }) {
                    discard(backend, &partial).await;
                }
                return Err(err);
            },
        };
        let archive_id = manifest.archive_id().clone();
        let files_archived = manifest.members().len();
        let total_size = manifest.total_uncompressed_size();

        // A registered archive keeps its container and sidecar.
        if let Some(existing) = self.registry.get(&archive_id).await {
            discard(backend, &partial).await;
            if existing.manifest.digest() != manifest.digest() {
                exn::bail!(ErrorKind::AlreadyRegistered(archive_id));
            }
            info!(%archive_id, "Archive already exists");
            return Ok(ArchiveCreationResult {
                archive: existing,
                files_archived,
                files_skipped,
                total_size,
                compressed_size,
            });
        }

        let container = config.directory.join(container_name(&archive_id, manifest.compression()));
        if let Err(err) = backend.rename(&partial, &container).await {
            discard(backend, &partial).await;
            return Err(err).or_raise(|| ErrorKind::Storage);
        }
        let (archive, added) = self
            .registry
            .register(CompressedArchive {
                manifest,
                location: destination.name().to_string(),
                container,
            })
            .await?;
        if config.write_sidecar && added {
            let json = archive.manifest.to_json().or_raise(|| ErrorKind::Archive)?;
            backend.write(&archive.sidecar(), &json).await.or_raise(|| ErrorKind::Storage)?;
        }
        info!(%archive_id, files_archived, files_skipped, total_size, compressed_size, "Created archive");
        Ok(ArchiveCreationResult {
            archive,
            files_archived,
            files_skipped,
            total_size,
            compressed_size,
        })
    }

    /// Stream every candidate into a new container at `partial` and build
    /// its manifest. Returns the manifest and the compressed size.
    async fn write_container(
        &self,
        candidates: Vec<Candidate>,
        config: &ArchiveCreationConfig,
        backend: &BackendHandle,
        partial: &Path,
        ctx: &OperationContext,
    ) -> Result<(ArchiveManifest, u64)> {
        let writer = backend.writer(partial).await.or_raise(|| ErrorKind::Storage)?;
        let mut container: Sink =
            ContainerWriter::new(HashingWriter::new(writer), config.compression, config.level)
                .or_raise(|| ErrorKind::Archive)?;

        let total = candidates.len() as u64;
        let mut members = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            if ctx.is_cancelled() {
                info!(partial = %partial.display(), "Archive creation cancelled");
                exn::bail!(ErrorKind::Cancelled {
                    partial: Some(partial.to_path_buf())
                });
            }
            let source_backend = self.locations.get(&candidate.source.location)?.backend();
            let reader = source_backend
                .reader(&candidate.source.physical_path)
                .await
                .or_raise(|| ErrorKind::Storage)?;
            let logical_path = candidate.source.logical_path.clone();
            let size = candidate.info.size;
            let (returned, checksum) = spawn_blocking(move || -> Result<(Sink, Checksum)> {
                let checksum = container.append(&logical_path, size, reader).or_raise(|| ErrorKind::Archive)?;
                Ok((container, checksum))
            })
            .await
            .or_raise(|| ErrorKind::Task)??;
            container = returned;
            debug!(path = %candidate.source.logical_path.display(), size, "Archived member");
            ctx.report(index as u64 + 1, total, &candidate.source.logical_path.to_string_lossy());
            members.push(FileEntry {
                logical_path: candidate.source.logical_path,
                size,
                checksum,
                modified_time: candidate.info.modified,
                tags: candidate.tags,
                fragment: candidate.source.fragment,
            });
        }

        let compressed_size = spawn_blocking(move || -> Result<u64> {
            let hashing = container.finish().or_raise(|| ErrorKind::Archive)?;
            let (mut writer, _, written) = hashing.into_parts();
            writer.flush().or_raise(|| ErrorKind::Storage)?;
            Ok(written)
        })
        .await
        .or_raise(|| ErrorKind::Task)??;

        let compression = config.compression.effective(config.level);
        let digest = ArchiveManifest::content_digest(&members, compression, config.level);
        let archive_id = ArchiveId::derive(&config.name, &digest).or_raise(|| ErrorKind::Archive)?;
        let manifest = ArchiveManifest::new(
            archive_id,
            OffsetDateTime::now_utc(),
            compression,
            config.level,
            config.description.clone(),
            members,
        )
        .or_raise(|| ErrorKind::Archive)?;
        Ok((manifest, compressed_size))
    }

    /// Stat and tag every source, keeping those the filter accepts, sorted by
    /// logical path.
    async fn select(&self, sources: Vec<SourceFile>, filter: &ArchiveCreationFilter) -> Result<(Vec<Candidate>, usize)> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut skipped = 0;
        for mut source in sources {
            source.logical_path = validate_path(&source.logical_path)
                .or_raise(|| ErrorKind::InvalidRequest(format!("invalid logical path {}", source.logical_path.display())))?;
            if !seen.insert(source.logical_path.clone()) {
                exn::bail!(ErrorKind::InvalidRequest(format!(
                    "duplicate logical path {}",
                    source.logical_path.display()
                )));
            }
            let backend = self.locations.get(&source.location)?.backend();
            let info = backend.stat(&source.physical_path).await.or_raise(|| ErrorKind::Storage)?;
            let tags = self.tags.tag_file(&source.logical_path);
            match filter.accepts(&source.logical_path, info.size, info.modified, &tags) {
                true => candidates.push(Candidate { source, info, tags }),
                false => {
                    debug!(path = %source.logical_path.display(), "Filtered out");
                    skipped += 1;
                },
            }
        }
        candidates.sort_by(|a, b| a.source.logical_path.cmp(&b.source.logical_path));
        Ok((candidates, skipped))
    }
}

/// Remove an unfinished container, logging when that fails.
async fn discard(backend: &BackendHandle, partial: &Path) {
    if let Err(err) = backend.delete(partial).await {
        warn!(path = %partial.display(), error = ?err, "Failed to remove partial container");
    }
}
