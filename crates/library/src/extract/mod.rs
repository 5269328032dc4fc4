//! Archive extraction.
//!
//! Members are streamed out of a container one at a time, placed through the
//! [`PathMapper`] in the destination location and verified against the
//! manifest. Containers on locations that require staging (tape) are copied
//! into the cache first and pinned while they are read.

mod conflict;
mod job;

pub use self::conflict::ConflictResolution;

use self::job::{ExtractJob, Stop, copy_range, verify_members};
use crate::error::{ErrorKind, Result};
use crate::locations::Locations;
use crate::progress::OperationContext;
use crate::registry::ArchiveRegistry;
use exn::ResultExt;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tellus_archive::{ArchiveId, Checksum, CompressedArchive, DateRange, FileEntry, Interval, PathMapper, Pattern, Tag};
use tellus_cache::{CacheKey, CacheManager};
use tellus_storage::backend::BoxSyncRead;
use tellus_storage::{BackendHandle, Location};
use tokio::runtime::Handle;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

/// Which members to extract. The default selects every member.
#[derive(Clone, Debug, Default)]
pub struct ArchiveExtractionFilter {
    pub include_tags: BTreeSet<Tag>,
    pub exclude_tags: BTreeSet<Tag>,
    /// Keep members whose logical path matches any of these (ignored when empty).
    pub path_globs: Vec<Pattern>,
    pub date_range: Option<DateRange>,
    /// Explicit logical paths. When set, only these members are selected and
    /// each must exist in the archive.
    pub paths: Vec<PathBuf>,
}

impl ArchiveExtractionFilter {
    pub fn paths(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn selects(&self, entry: &FileEntry) -> bool {
        if !self.paths.is_empty() && !self.paths.contains(&entry.logical_path) {
            return false;
        }
        if !self.include_tags.is_empty() && !entry.has_any_tag(&self.include_tags) {
            return false;
        }
        if entry.has_any_tag(&self.exclude_tags) {
            return false;
        }
        if !self.path_globs.is_empty() && !self.path_globs.iter().any(|glob| glob.matches(&entry.logical_path)) {
            return false;
        }
        self.date_range.is_none_or(|range| range.contains(entry.modified_time))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Any failed or missing member aborts the extraction.
    #[default]
    Full,
    /// Failed and missing members are recorded and extraction continues.
    BestEffort,
}

#[derive(Clone, Debug)]
pub struct ExtractionConfig {
    pub mode: ExtractionMode,
    pub conflict_resolution: ConflictResolution,
    pub verify_checksums: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Full,
            conflict_resolution: ConflictResolution::Fail,
            verify_checksums: true,
        }
    }
}

impl ExtractionConfig {
    pub fn best_effort(mut self) -> Self {
        self.mode = ExtractionMode::BestEffort;
        self
    }

    pub fn on_conflict(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }
}

/// Where extracted members are written.
#[derive(Clone, Debug)]
pub struct ExtractionDestination {
    pub location: Location,
}

impl ExtractionDestination {
    pub fn backend(&self) -> &BackendHandle {
        self.location.backend()
    }
}

impl From<Location> for ExtractionDestination {
    fn from(location: Location) -> Self {
        Self { location }
    }
}

/// Outcome of one extraction. Paths in `extracted`, `skipped` and `renamed`
/// are physical paths in the destination; the others are logical paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionResult {
    pub archive_id: ArchiveId,
    pub extracted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    /// `(intended, written)` for members renamed around an existing file.
    pub renamed: Vec<(PathBuf, PathBuf)>,
    /// Members that failed, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Explicitly requested paths the archive does not contain.
    pub missing: Vec<PathBuf>,
    pub bytes_written: u64,
    pub cancelled: bool,
    pub partial: bool,
}

impl ExtractionResult {
    fn new(archive_id: ArchiveId) -> Self {
        Self {
            archive_id,
            extracted: Vec::new(),
            skipped: Vec::new(),
            renamed: Vec::new(),
            failed: Vec::new(),
            missing: Vec::new(),
            bytes_written: 0,
            cancelled: false,
            partial: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberVerification {
    pub path: PathBuf,
    pub expected: Checksum,
    /// `None` when the member is absent from the container.
    pub actual: Option<Checksum>,
    pub size_matches: bool,
}

impl MemberVerification {
    pub fn is_valid(&self) -> bool {
        self.size_matches && self.actual.as_ref() == Some(&self.expected)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationReport {
    pub archive_id: ArchiveId,
    pub members: Vec<MemberVerification>,
    /// Container members the manifest does not list.
    pub unexpected: Vec<PathBuf>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.unexpected.is_empty() && self.members.iter().all(MemberVerification::is_valid)
    }
}

/// An open container, and the cache entry pinned for it if it was staged.
struct OpenContainer {
    reader: BoxSyncRead,
    pinned: Option<CacheKey>,
}

pub struct ArchiveExtractionService {
    registry: Arc<ArchiveRegistry>,
    locations: Arc<Locations>,
    mapper: Arc<PathMapper>,
    cache: Arc<CacheManager>,
}

impl ArchiveExtractionService {
    pub fn new(
        registry: Arc<ArchiveRegistry>,
        locations: Arc<Locations>,
        mapper: Arc<PathMapper>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            registry,
            locations,
            mapper,
            cache,
        }
    }

    /// Extract the members selected by `filter` into `destination`.
    ///
    /// Runs under the archive's extraction lock. In [`ExtractionMode::Full`]
    /// the first failed member aborts with its error; files already written
    /// stay in place.
    #[instrument(skip_all, fields(%archive_id, destination = %destination.location.name()))]
    pub async fn extract(
        &self,
        archive_id: &ArchiveId,
        filter: &ArchiveExtractionFilter,
        destination: &ExtractionDestination,
        config: &ExtractionConfig,
        ctx: &OperationContext,
    ) -> Result<ExtractionResult> {
        let archive = self.registry.require(archive_id).await?;
        let mut result = ExtractionResult::new(archive_id.clone());
        for path in &filter.paths {
            if archive.manifest.member(path).is_some() {
                continue;
            }
            if config.mode == ExtractionMode::Full {
                exn::bail!(ErrorKind::MissingMember {
                    archive_id: archive_id.clone(),
                    path: path.clone(),
                });
            }
            warn!(path = %path.display(), "Requested member is not in the archive");
            result.missing.push(path.clone());
        }

        let selected: BTreeMap<PathBuf, FileEntry> = archive
            .manifest
            .members()
            .iter()
            .filter(|entry| filter.selects(entry))
            .map(|entry| (entry.logical_path.clone(), entry.clone()))
            .collect();
        if selected.is_empty() {
            info!("No members selected");
            result.partial = !result.missing.is_empty();
            return Ok(result);
        }

        let _guard = self.registry.lock_archive(archive_id).await;
        let container = self.open_container(&archive).await?;
        let job = ExtractJob {
            handle: Handle::current(),
            backend: destination.backend().clone(),
            location: destination.location.config().clone(),
            mapper: self.mapper.clone(),
            config: config.clone(),
            ctx: ctx.clone(),
            total: selected.len() as u64,
            selected,
            result,
        };
        let compression = archive.manifest.compression();
        let reader = container.reader;
        let outcome = spawn_blocking(move || {
            let mut job = job;
            let stop = job.run(reader, compression);
            (job, stop)
        })
        .await
        .or_raise(|| ErrorKind::Task);
        self.release(container.pinned).await;
        let (job, stop) = outcome?;

        let mut result = job.result;
        match stop? {
            Some(Stop::Abort(err)) => return Err(err),
            Some(Stop::Cancelled) => {
                info!(extracted = result.extracted.len(), "Extraction cancelled");
                result.cancelled = true;
            },
            None => {
                for path in job.selected.into_keys() {
                    if config.mode == ExtractionMode::Full {
                        exn::bail!(ErrorKind::MissingMember {
                            archive_id: archive_id.clone(),
                            path,
                        });
                    }
                    warn!(path = %path.display(), "Manifest member is absent from the container");
                    result.failed.push((path, "member absent from container".to_string()));
                }
            },
        }
        result.partial = result.cancelled || !result.failed.is_empty() || !result.missing.is_empty();
        info!(
            extracted = result.extracted.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            bytes_written = result.bytes_written,
            "Extracted archive"
        );
        Ok(result)
    }

    /// Stream `range` (relative to the start of `member`) into `sink`,
    /// returning the sink and the number of bytes copied.
    ///
    /// With `verify`, the whole member is hashed and a corrupt member fails
    /// with [`ErrorKind::ChecksumMismatch`].
    #[instrument(skip(self, sink), fields(member = %member.display()))]
    pub async fn extract_range<W: Write + Send + 'static>(
        &self,
        archive_id: &ArchiveId,
        member: &Path,
        range: Interval,
        sink: W,
        verify: bool,
    ) -> Result<(W, u64)> {
        let archive = self.registry.require(archive_id).await?;
        let Some(entry) = archive.manifest.member(member).cloned() else {
            exn::bail!(ErrorKind::MissingMember {
                archive_id: archive_id.clone(),
                path: member.to_path_buf(),
            });
        };
        if range.end > entry.size {
            exn::bail!(ErrorKind::InvalidRequest(format!(
                "range {range} exceeds {} ({} bytes)",
                member.display(),
                entry.size
            )));
        }
        if range.is_empty() && !verify {
            return Ok((sink, 0));
        }

        let _guard = self.registry.lock_archive(archive_id).await;
        let container = self.open_container(&archive).await?;
        let compression = archive.manifest.compression();
        let reader = container.reader;
        let outcome = spawn_blocking(move || -> Result<(W, u64)> {
            let mut sink = sink;
            let copied = copy_range(reader, compression, &entry, range, &mut sink, verify)?;
            Ok((sink, copied))
        })
        .await
        .or_raise(|| ErrorKind::Task);
        self.release(container.pinned).await;
        let (sink, copied) = outcome??;
        debug!(copied, "Read member range");
        Ok((sink, copied))
    }

    /// Decompress every member and compare it with the manifest.
    #[instrument(skip(self))]
    pub async fn verify_archive(&self, archive_id: &ArchiveId) -> Result<VerificationReport> {
        let archive = self.registry.require(archive_id).await?;
        let _guard = self.registry.lock_archive(archive_id).await;
        let container = self.open_container(&archive).await?;
        let compression = archive.manifest.compression();
        let members = archive.manifest.members().to_vec();
        let reader = container.reader;
        let outcome = spawn_blocking(move || verify_members(reader, compression, &members))
            .await
            .or_raise(|| ErrorKind::Task);
        self.release(container.pinned).await;
        let (members, unexpected) = outcome??;
        let report = VerificationReport {
            archive_id: archive_id.clone(),
            members,
            unexpected,
        };
        match report.is_valid() {
            true => info!("Archive verified"),
            false => warn!(
                invalid = report.members.iter().filter(|m| !m.is_valid()).count(),
                unexpected = report.unexpected.len(),
                "Archive failed verification"
            ),
        }
        Ok(report)
    }

    /// Manifest entries selected by `filter`, in manifest order.
    pub async fn list_members(
        &self,
        archive_id: &ArchiveId,
        filter: &ArchiveExtractionFilter,
        limit: Option<usize>,
    ) -> Result<Vec<FileEntry>> {
        let archive = self.registry.require(archive_id).await?;
        Ok(archive
            .manifest
            .members()
            .iter()
            .filter(|entry| filter.selects(entry))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn open_container(&self, archive: &CompressedArchive) -> Result<OpenContainer> {
        let location = self.locations.get(&archive.location)?;
        if !location.kind().requires_staging() {
            let reader = location
                .backend()
                .reader(&archive.container)
                .await
                .or_raise(|| ErrorKind::Storage)?;
            return Ok(OpenContainer { reader, pinned: None });
        }

        let key = staging_key(archive);
        let path = self.stage(location, archive, &key).await?;
        let file = tokio::fs::File::open(&path).await.or_raise(|| ErrorKind::Cache)?;
        Ok(OpenContainer {
            reader: Box::new(file.into_std().await),
            pinned: Some(key),
        })
    }

    /// Copy a container into the cache and pin it.
    async fn stage(&self, location: &Location, archive: &CompressedArchive, key: &CacheKey) -> Result<PathBuf> {
        // The entry can be evicted between materializing and pinning.
        for _ in 0..2 {
            let backend = location.backend().clone();
            let container = archive.container.clone();
            let path = self
                .cache
                .get_or_materialize(key, |staging| copy_to_staging(backend, container, staging))
                .await
                .or_raise(|| ErrorKind::Cache)?;
            if self.cache.pin(key).await.or_raise(|| ErrorKind::Cache)? {
                debug!(key = %key, path = %path.display(), "Staged container");
                return Ok(path);
            }
        }
        exn::bail!(ErrorKind::Cache)
    }

    async fn release(&self, pinned: Option<CacheKey>) {
        if let Some(key) = pinned
            && let Err(err) = self.cache.unpin(&key).await
        {
            warn!(key = %key, error = ?err, "Failed to unpin staged container");
        }
    }
}

fn staging_key(archive: &CompressedArchive) -> CacheKey {
    let label = archive
        .container
        .file_name()
        .map_or_else(|| archive.archive_id().to_string(), |name| name.to_string_lossy().into_owned());
    let container = archive.container.to_string_lossy();
    CacheKey::new(
        &label,
        [
            ("location", archive.location.as_str()),
            ("container", &*container),
            ("archive", archive.archive_id().as_str()),
        ],
    )
}

async fn copy_to_staging(backend: BackendHandle, container: PathBuf, staging: PathBuf) -> Result<()> {
    let reader = backend.reader(&container).await.or_raise(|| ErrorKind::Storage)?;
    spawn_blocking(move || -> Result<()> {
        let mut reader = reader;
        let mut file = std::fs::File::create(&staging).or_raise(|| ErrorKind::Cache)?;
        io::copy(&mut reader, &mut file).or_raise(|| ErrorKind::Storage)?;
        file.sync_all().or_raise(|| ErrorKind::Cache)?;
        Ok(())
    })
    .await
    .or_raise(|| ErrorKind::Task)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::tests::{FILES, Fixture, all_sources, fixture};
    use crate::create::{ArchiveCreationConfig, ArchiveCreationFilter};
    use crate::progress::testing::Recorder;
    use crate::registry::tests::{archive, entry};
    use rstest::rstest;
    use std::fs;
    use tellus_archive::{ContainerWriter, PathMapping};
    use tellus_cache::CacheConfig;
    use tellus_compress::{Compression, CompressionLevel};
    use time::macros::datetime;

    struct Harness {
        fx: Fixture,
        service: ArchiveExtractionService,
        cache: Arc<CacheManager>,
        out: ExtractionDestination,
    }

    impl Harness {
        fn out(&self, path: &str) -> PathBuf {
            self.fx.base.join("out").join(path)
        }
    }

    async fn harness() -> Harness {
        let fx = fixture(FILES);
        let mut mapper = PathMapper::new();
        mapper.register_mapping(PathMapping::identity("out"), 0).unwrap();
        let cache = Arc::new(
            CacheManager::open_in_memory(CacheConfig::new(fx.base.join("cache")))
                .await
                .unwrap(),
        );
        let service = ArchiveExtractionService::new(
            fx.registry.clone(),
            fx.locations.clone(),
            Arc::new(mapper),
            cache.clone(),
        );
        let out = ExtractionDestination::from(fx.locations.get("out").unwrap().clone());
        Harness {
            fx,
            service,
            cache,
            out,
        }
    }

    async fn archive_in(h: &Harness, location: &str) -> ArchiveId {
        let config = ArchiveCreationConfig::new("exp01", location);
        let result = h
            .fx
            .service
            .create(all_sources(), &ArchiveCreationFilter::default(), &config, &OperationContext::new())
            .await
            .unwrap();
        result.archive_id().clone()
    }

    /// An archive whose manifest claims different (same-sized) content for
    /// `exp01/outdata/ocean.nc` than its container holds.
    async fn corrupt_archive(h: &Harness) -> ArchiveId {
        let modified = datetime!(2024-01-01 0:00 UTC);
        let members = vec![
            entry("exp01/namelist.nml", b"&run nyears=10 /", &[], modified),
            entry("exp01/outdata/ocean.nc", b"ocean outpuT", &[], modified),
        ];
        let corrupt = archive("exp01-corrupt", members);
        let file = fs::File::create(h.fx.root.join(&corrupt.container)).unwrap();
        let mut writer = ContainerWriter::new(file, Compression::Gzip, CompressionLevel::Balanced).unwrap();
        let contents: [(&str, &[u8]); 2] = [
            ("exp01/namelist.nml", b"&run nyears=10 /"),
            ("exp01/outdata/ocean.nc", b"ocean output"),
        ];
        for (path, bytes) in contents {
            writer.append(Path::new(path), bytes.len() as u64, bytes).unwrap();
        }
        writer.finish().unwrap();
        let (registered, _) = h.fx.registry.register(corrupt).await.unwrap();
        registered.archive_id().clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_extract_everything() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let result = h
            .service
            .extract(
                &id,
                &ArchiveExtractionFilter::default(),
                &h.out,
                &ExtractionConfig::default(),
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.extracted.len(), 4);
        assert!(!result.partial);
        assert_eq!(result.bytes_written, FILES.iter().map(|(_, b)| b.len() as u64).sum::<u64>());
        for (path, bytes) in FILES {
            assert_eq!(fs::read(h.out(path)).unwrap(), *bytes);
        }
    }

    #[rstest]
    #[case::skip(ConflictResolution::SkipExisting, 3, 1, 0, b"old".as_slice())]
    #[case::overwrite(ConflictResolution::Overwrite, 4, 0, 0, b"&run nyears=10 /".as_slice())]
    #[case::rename(ConflictResolution::Rename, 4, 0, 0, b"old".as_slice())]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_policies(
        #[case] resolution: ConflictResolution,
        #[case] extracted: usize,
        #[case] skipped: usize,
        #[case] failed: usize,
        #[case] existing: &[u8],
    ) {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        fs::create_dir_all(h.out("exp01")).unwrap();
        fs::write(h.out("exp01/namelist.nml"), b"old").unwrap();

        let config = ExtractionConfig::default().best_effort().on_conflict(resolution);
        let result = h
            .service
            .extract(&id, &ArchiveExtractionFilter::default(), &h.out, &config, &OperationContext::new())
            .await
            .unwrap();

        assert_eq!(result.extracted.len(), extracted);
        assert_eq!(result.skipped.len(), skipped);
        assert_eq!(result.failed.len(), failed);
        assert_eq!(fs::read(h.out("exp01/namelist.nml")).unwrap(), existing);
        assert_eq!(result.partial, failed > 0);
    }

    #[rstest]
    #[case::full(ExtractionConfig::default())]
    #[case::best_effort(ExtractionConfig::default().best_effort())]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_policy_stops_at_first_collision(#[case] config: ExtractionConfig) {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        fs::create_dir_all(h.out("exp01")).unwrap();
        fs::write(h.out("exp01/namelist.nml"), b"old").unwrap();

        let config = config.on_conflict(ConflictResolution::Fail);
        let err = h
            .service
            .extract(&id, &ArchiveExtractionFilter::default(), &h.out, &config, &OperationContext::new())
            .await
            .unwrap_err();
        assert_eq!(*err, ErrorKind::ExtractionConflict(PathBuf::from("exp01/namelist.nml")));
        assert_eq!(fs::read(h.out("exp01/namelist.nml")).unwrap(), b"old");
        // Members sort after the collision and are never reached.
        assert!(!h.out("exp01/outdata/ocean.nc").exists());
        assert!(!h.out("exp01/restart/fesom.rst").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_picks_first_free_name() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        fs::create_dir_all(h.out("exp01")).unwrap();
        fs::write(h.out("exp01/namelist.nml"), b"old").unwrap();
        fs::write(h.out("exp01/namelist_1.nml"), b"older").unwrap();

        let config = ExtractionConfig::default().on_conflict(ConflictResolution::Rename);
        let filter = ArchiveExtractionFilter::paths(["exp01/namelist.nml"]);
        let result = h
            .service
            .extract(&id, &filter, &h.out, &config, &OperationContext::new())
            .await
            .unwrap();

        assert_eq!(
            result.renamed,
            vec![(PathBuf::from("exp01/namelist.nml"), PathBuf::from("exp01/namelist_2.nml"))]
        );
        assert_eq!(fs::read(h.out("exp01/namelist_2.nml")).unwrap(), b"&run nyears=10 /");
        assert_eq!(fs::read(h.out("exp01/namelist_1.nml")).unwrap(), b"older");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_aborts_full_extraction() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        fs::create_dir_all(h.out("exp01")).unwrap();
        fs::write(h.out("exp01/namelist.nml"), b"old").unwrap();

        let err = h
            .service
            .extract(
                &id,
                &ArchiveExtractionFilter::default(),
                &h.out,
                &ExtractionConfig::default(),
                &OperationContext::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(*err, ErrorKind::ExtractionConflict(PathBuf::from("exp01/namelist.nml")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checksum_mismatch_aborts_full_extraction() {
        let h = harness().await;
        let id = corrupt_archive(&h).await;
        let err = h
            .service
            .extract(
                &id,
                &ArchiveExtractionFilter::default(),
                &h.out,
                &ExtractionConfig::default(),
                &OperationContext::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(&*err, ErrorKind::ChecksumMismatch { path, .. } if path == Path::new("exp01/outdata/ocean.nc")));
        assert!(!h.out("exp01/outdata/ocean.nc").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checksum_mismatch_recorded_in_best_effort() {
        let h = harness().await;
        let id = corrupt_archive(&h).await;
        let result = h
            .service
            .extract(
                &id,
                &ArchiveExtractionFilter::default(),
                &h.out,
                &ExtractionConfig::default().best_effort(),
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.extracted, vec![PathBuf::from("exp01/namelist.nml")]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, PathBuf::from("exp01/outdata/ocean.nc"));
        assert!(result.partial);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unverified_extraction_accepts_same_sized_content() {
        let h = harness().await;
        let id = corrupt_archive(&h).await;
        let config = ExtractionConfig {
            verify_checksums: false,
            ..ExtractionConfig::default()
        };
        let result = h
            .service
            .extract(&id, &ArchiveExtractionFilter::default(), &h.out, &config, &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(result.extracted.len(), 2);
        assert_eq!(fs::read(h.out("exp01/outdata/ocean.nc")).unwrap(), b"ocean output");
    }

    #[rstest]
    #[case::full(ExtractionConfig::default(), true)]
    #[case::best_effort(ExtractionConfig::default().best_effort(), false)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_explicit_path(#[case] config: ExtractionConfig, #[case] fails: bool) {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let filter = ArchiveExtractionFilter::paths(["exp01/namelist.nml", "exp01/outdata/missing.nc"]);
        let outcome = h
            .service
            .extract(&id, &filter, &h.out, &config, &OperationContext::new())
            .await;

        match fails {
            true => assert!(matches!(&*outcome.unwrap_err(), ErrorKind::MissingMember { .. })),
            false => {
                let result = outcome.unwrap();
                assert_eq!(result.extracted, vec![PathBuf::from("exp01/namelist.nml")]);
                assert_eq!(result.missing, vec![PathBuf::from("exp01/outdata/missing.nc")]);
                assert!(result.partial);
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_stops_between_members() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let recorder = Arc::new(Recorder::cancelling_after(2));
        let ctx = OperationContext::new().with_progress(recorder.clone());
        let result = h
            .service
            .extract(&id, &ArchiveExtractionFilter::default(), &h.out, &ExtractionConfig::default(), &ctx)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(result.partial);
        assert_eq!(
            result.extracted,
            vec![PathBuf::from("exp01/log/run.log"), PathBuf::from("exp01/namelist.nml")]
        );
        assert_eq!(recorder.count(), 2);
        assert!(!h.out("exp01/outdata/ocean.nc").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tape_containers_are_staged_and_unpinned() {
        let h = harness().await;
        let id = archive_in(&h, "hsm").await;
        let filter = ArchiveExtractionFilter::paths(["exp01/outdata/ocean.nc"]);
        let config = ExtractionConfig::default().on_conflict(ConflictResolution::Overwrite);
        for _ in 0..2 {
            h.service
                .extract(&id, &filter, &h.out, &config, &OperationContext::new())
                .await
                .unwrap();
        }

        let stats = h.cache.get_cache_stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.pinned_size, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(fs::read(h.out("exp01/outdata/ocean.nc")).unwrap(), b"ocean output");
    }

    #[rstest]
    #[case::plain(false)]
    #[case::verified(true)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_extract_range(#[case] verify: bool) {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let (sink, copied) = h
            .service
            .extract_range(&id, Path::new("exp01/outdata/ocean.nc"), Interval::new(6, 12), Vec::new(), verify)
            .await
            .unwrap();
        assert_eq!(copied, 6);
        assert_eq!(sink, b"output");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_extract_range_rejects_out_of_bounds() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let err = h
            .service
            .extract_range(&id, Path::new("exp01/outdata/ocean.nc"), Interval::new(6, 13), Vec::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_verified_range_detects_corruption() {
        let h = harness().await;
        let id = corrupt_archive(&h).await;
        let member = Path::new("exp01/outdata/ocean.nc");
        let (sink, _) = h
            .service
            .extract_range(&id, member, Interval::new(0, 5), Vec::new(), false)
            .await
            .unwrap();
        assert_eq!(sink, b"ocean");

        let err = h
            .service
            .extract_range(&id, member, Interval::new(0, 5), Vec::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::ChecksumMismatch { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_verify_archive() {
        let h = harness().await;
        let good = archive_in(&h, "work").await;
        let report = h.service.verify_archive(&good).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.members.len(), 4);

        let bad = corrupt_archive(&h).await;
        let report = h.service.verify_archive(&bad).await.unwrap();
        assert!(!report.is_valid());
        let invalid: Vec<_> = report.members.iter().filter(|m| !m.is_valid()).map(|m| m.path.clone()).collect();
        assert_eq!(invalid, vec![PathBuf::from("exp01/outdata/ocean.nc")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_members() {
        let h = harness().await;
        let id = archive_in(&h, "work").await;
        let all = h
            .service
            .list_members(&id, &ArchiveExtractionFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let filter = ArchiveExtractionFilter {
            path_globs: vec![Pattern::parse("*.nc").unwrap(), Pattern::parse("*.nml").unwrap()],
            ..ArchiveExtractionFilter::default()
        };
        let listed = h.service.list_members(&id, &filter, Some(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].logical_path, PathBuf::from("exp01/namelist.nml"));

        let restart = ArchiveExtractionFilter {
            include_tags: [Tag::new("restart")].into(),
            ..ArchiveExtractionFilter::default()
        };
        let listed = h.service.list_members(&id, &restart, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].logical_path, PathBuf::from("exp01/restart/fesom.rst"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_archive() {
        let h = harness().await;
        let id: ArchiveId = "exp01-nope".parse().unwrap();
        let err = h
            .service
            .list_members(&id, &ArchiveExtractionFilter::default(), None)
            .await
            .unwrap_err();
        assert_eq!(*err, ErrorKind::ArchiveNotFound(id));
    }
}
