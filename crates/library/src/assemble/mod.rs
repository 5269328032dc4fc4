//! Fragment assembly.
//!
//! A dataset may be split over several archives, each holding one fragment
//! member that covers part of the dataset's offsets. Fragments can overlap,
//! disagree or leave gaps. Assembly happens in two steps:
//!
//! 1. [`plan`](FragmentAssemblyService::plan) gathers the candidate fragments
//!    from the registry and sweeps them into non-overlapping segments,
//!    settling every conflict through the request's [`ConflictResolver`] or
//!    [`ConflictStrategy`]. Nothing is read.
//! 2. [`execute`](FragmentAssemblyService::execute) streams the segments in
//!    order through range reads into a single writer, zero-filling gaps so
//!    that offsets are preserved.
//!
//! [`materialize`](FragmentAssemblyService::materialize) runs both into the
//! cache, keyed by the plan.

mod plan;
mod resolve;

pub use self::plan::{AssemblyPlan, FragmentOverlap, OverlapResolution, PlanComplexity, PlanSegment};
pub use self::resolve::{ConflictResolver, ConflictStrategy, Resolution};

use self::plan::{PlanRequest, plan_assembly};
use crate::error::{ErrorKind, Result};
use crate::extract::ArchiveExtractionService;
use crate::progress::OperationContext;
use crate::registry::ArchiveRegistry;
use exn::ResultExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tellus_archive::hash::HashingWriter;
use tellus_archive::{ArchiveId, Checksum, CompressedArchive, FileEntry, FragmentRef, Interval, Tag};
use tellus_cache::{CacheKey, CacheManager};
use tellus_storage::validate_path;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument};

/// Which dataset to assemble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSelector {
    /// The dataset's logical path.
    Path(PathBuf),
    /// The dataset whose fragment members carry all of these tags. Exactly
    /// one dataset must match.
    Tags(BTreeSet<Tag>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssemblyMode {
    /// Fail with [`ErrorKind::IncompleteCoverage`] if any gap remains.
    #[default]
    Strict,
    /// Return the best coverage achievable and report the gaps.
    Partial,
}

/// What one fragment member supplies toward its dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub archive_id: ArchiveId,
    pub member: PathBuf,
    /// Offsets of the dataset held by the member.
    pub coverage: Interval,
    pub created_at: OffsetDateTime,
    pub priority: i32,
    pub checksum: Checksum,
    pub source_digest: Option<Checksum>,
}

impl FragmentDescriptor {
    pub fn new(archive: &CompressedArchive, entry: &FileEntry, fragment: &FragmentRef) -> Self {
        Self {
            archive_id: archive.archive_id().clone(),
            member: entry.logical_path.clone(),
            coverage: fragment.coverage,
            created_at: archive.manifest.created_at(),
            priority: 0,
            checksum: entry.checksum.clone(),
            source_digest: fragment.source_digest.clone(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_digest(mut self, digest: Checksum) -> Self {
        self.source_digest = Some(digest);
        self
    }

    /// Whether both fragments were cut from the same dataset version.
    pub fn agrees_with(&self, other: &FragmentDescriptor) -> bool {
        matches!((&self.source_digest, &other.source_digest), (Some(a), Some(b)) if a == b)
    }
}

#[derive(Clone)]
pub struct AssemblyRequest {
    pub dataset: DatasetSelector,
    pub interval: Interval,
    pub strategy: ConflictStrategy,
    pub mode: AssemblyMode,
    /// Per-archive priorities; archives not listed have priority 0.
    pub priorities: HashMap<ArchiveId, i32>,
    pub verify_checksums: bool,
    /// Consulted before `strategy` for every conflict.
    pub resolver: Option<Arc<dyn ConflictResolver>>,
}

impl AssemblyRequest {
    pub fn new(dataset: DatasetSelector, interval: Interval) -> Self {
        Self {
            dataset,
            interval,
            strategy: ConflictStrategy::default(),
            mode: AssemblyMode::default(),
            priorities: HashMap::new(),
            verify_checksums: true,
            resolver: None,
        }
    }

    pub fn path(dataset: impl Into<PathBuf>, interval: Interval) -> Self {
        Self::new(DatasetSelector::Path(dataset.into()), interval)
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn partial(mut self) -> Self {
        self.mode = AssemblyMode::Partial;
        self
    }

    pub fn with_priority(mut self, archive_id: ArchiveId, priority: i32) -> Self {
        self.priorities.insert(archive_id, priority);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

impl Debug for AssemblyRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("AssemblyRequest")
            .field("dataset", &self.dataset)
            .field("interval", &self.interval)
            .field("strategy", &self.strategy)
            .field("mode", &self.mode)
            .field("priorities", &self.priorities)
            .field("verify_checksums", &self.verify_checksums)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyResult {
    pub dataset: PathBuf,
    /// Intervals actually written from fragments.
    pub coverage: Vec<Interval>,
    pub fragments_used: Vec<(ArchiveId, PathBuf)>,
    /// Overlaps where the fragments disagreed, with their resolution.
    pub conflicts: Vec<FragmentOverlap>,
    /// Zero-filled intervals of the output.
    pub gaps: Vec<Interval>,
    pub bytes_written: u64,
    /// BLAKE3 of the output, present when every range read verified its
    /// fragment and the run completed.
    pub checksum: Option<Checksum>,
    pub complexity: PlanComplexity,
    pub cancelled: bool,
}

pub struct FragmentAssemblyService {
    registry: Arc<ArchiveRegistry>,
    extraction: Arc<ArchiveExtractionService>,
    cache: Arc<CacheManager>,
}

impl FragmentAssemblyService {
    pub fn new(
        registry: Arc<ArchiveRegistry>,
        extraction: Arc<ArchiveExtractionService>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            registry,
            extraction,
            cache,
        }
    }

    /// Resolve the selector to a dataset path and every fragment of it.
    pub async fn candidates(
        &self,
        selector: &DatasetSelector,
        priorities: &HashMap<ArchiveId, i32>,
    ) -> Result<(PathBuf, Vec<FragmentDescriptor>)> {
        let describe = |archive: &CompressedArchive, entry: &FileEntry, fragment: &FragmentRef| {
            let priority = priorities.get(archive.archive_id()).copied().unwrap_or_default();
            FragmentDescriptor::new(archive, entry, fragment).with_priority(priority)
        };
        match selector {
            DatasetSelector::Path(dataset) => {
                let dataset = validate_path(dataset)
                    .or_raise(|| ErrorKind::InvalidRequest(format!("invalid dataset path {}", dataset.display())))?;
                let mut fragments = Vec::new();
                for archive in self.registry.fragments_of(&dataset).await {
                    for entry in archive.manifest.fragments_of(&dataset) {
                        if let Some(fragment) = &entry.fragment {
                            fragments.push(describe(&*archive, entry, fragment));
                        }
                    }
                }
                Ok((dataset, fragments))
            },
            DatasetSelector::Tags(tags) => {
                let mut datasets = BTreeSet::new();
                let mut fragments = Vec::new();
                for archive in self.registry.fragments_tagged(tags).await {
                    for entry in archive.manifest.members() {
                        if let Some(fragment) = &entry.fragment
                            && tags.is_subset(&entry.tags)
                        {
                            datasets.insert(fragment.dataset.clone());
                            fragments.push(describe(&*archive, entry, fragment));
                        }
                    }
                }
                let mut datasets = datasets.into_iter();
                match (datasets.next(), datasets.next()) {
                    (Some(dataset), None) => Ok((dataset, fragments)),
                    (None, _) => exn::bail!(ErrorKind::InvalidRequest("no fragments carry the requested tags".to_string())),
                    (Some(first), Some(second)) => exn::bail!(ErrorKind::InvalidRequest(format!(
                        "tags select fragments of several datasets, including {} and {}",
                        first.display(),
                        second.display()
                    ))),
                }
            },
        }
    }

    /// Plan an assembly without reading any data.
    #[instrument(skip_all, fields(interval = %request.interval, strategy = ?request.strategy))]
    pub async fn plan(&self, request: &AssemblyRequest) -> Result<AssemblyPlan> {
        let (dataset, candidates) = self.candidates(&request.dataset, &request.priorities).await?;
        let plan = plan_assembly(
            &PlanRequest {
                dataset: &dataset,
                interval: request.interval,
                strategy: request.strategy,
                mode: request.mode,
                resolver: request.resolver.as_deref(),
            },
            candidates,
        )?;
        info!(
            dataset = %dataset.display(),
            segments = plan.segments.len(),
            overlaps = plan.overlaps.len(),
            gaps = plan.gaps.len(),
            complexity = ?plan.complexity,
            "Planned assembly"
        );
        Ok(plan)
    }

    /// Write `plan` into `sink`, returning the sink and what was written.
    ///
    /// Cancellation is checked before each segment. A cancelled run returns
    /// normally with [`AssemblyResult::cancelled`] set and the output cut
    /// short.
    #[instrument(skip_all, fields(dataset = %plan.dataset.display(), interval = %plan.interval))]
    pub async fn execute<W: Write + Send + 'static>(
        &self,
        plan: &AssemblyPlan,
        sink: W,
        verify: bool,
        ctx: &OperationContext,
    ) -> Result<(W, AssemblyResult)> {
        let mut sink = HashingWriter::new(sink);
        let mut cursor = plan.interval.start;
        let mut written = Vec::with_capacity(plan.segments.len());
        let mut cancelled = false;
        let total = plan.segments.len() as u64;
        for (index, segment) in plan.segments.iter().enumerate() {
            if ctx.is_cancelled() {
                info!(written = cursor - plan.interval.start, "Assembly cancelled");
                cancelled = true;
                break;
            }
            if segment.range.start > cursor {
                sink = zero_fill(sink, segment.range.start - cursor).await?;
            }
            let fragment = &segment.fragment;
            let (returned, copied) = self
                .extraction
                .extract_range(&fragment.archive_id, &fragment.member, segment.member_range(), sink, verify)
                .await?;
            sink = returned;
            debug!(archive_id = %fragment.archive_id, range = %segment.range, copied, "Wrote segment");
            written.push(segment.range);
            cursor = segment.range.end;
            ctx.report(index as u64 + 1, total, fragment.archive_id.as_str());
        }
        if !cancelled && cursor < plan.interval.end {
            sink = zero_fill(sink, plan.interval.end - cursor).await?;
        }

        let (sink, checksum, bytes_written) = sink.into_parts();
        let sink = spawn_blocking(move || -> Result<W> {
            let mut sink = sink;
            sink.flush().or_raise(|| ErrorKind::Storage)?;
            Ok(sink)
        })
        .await
        .or_raise(|| ErrorKind::Task)??;

        let result = AssemblyResult {
            dataset: plan.dataset.clone(),
            coverage: Interval::union(written),
            fragments_used: plan.fragments_used(),
            conflicts: plan.overlaps.iter().filter(|o| o.is_conflict()).cloned().collect(),
            gaps: plan.gaps.clone(),
            bytes_written,
            checksum: (verify && !cancelled).then_some(checksum),
            complexity: plan.complexity,
            cancelled,
        };
        info!(bytes_written, cancelled, "Assembled dataset");
        Ok((sink, result))
    }

    /// Plan and execute into `sink`.
    pub async fn assemble<W: Write + Send + 'static>(
        &self,
        request: &AssemblyRequest,
        sink: W,
        ctx: &OperationContext,
    ) -> Result<(W, AssemblyResult)> {
        let plan = self.plan(request).await?;
        self.execute(&plan, sink, request.verify_checksums, ctx).await
    }

    /// Assemble into the cache and return the cached file's path.
    ///
    /// The cache key covers the dataset, the interval and the plan
    /// fingerprint, so requests settling conflicts differently never share
    /// an entry. A cancelled run caches nothing and fails with
    /// [`ErrorKind::Cancelled`].
    #[instrument(skip_all, fields(interval = %request.interval))]
    pub async fn materialize(&self, request: &AssemblyRequest, ctx: &OperationContext) -> Result<PathBuf> {
        let plan = self.plan(request).await?;
        let key = assembly_key(&plan);
        let plan = &plan;
        let outcome = self
            .cache
            .get_or_materialize(&key, |staging| self.produce(plan, staging, request.verify_checksums, ctx))
            .await;
        match outcome {
            Ok(path) => {
                info!(key = %key, path = %path.display(), "Materialized dataset");
                Ok(path)
            },
            Err(err) if ctx.is_cancelled() => Err(err).or_raise(|| ErrorKind::Cancelled { partial: None }),
            Err(err) => Err(err).or_raise(|| ErrorKind::Cache),
        }
    }

    async fn produce(&self, plan: &AssemblyPlan, staging: PathBuf, verify: bool, ctx: &OperationContext) -> Result<()> {
        let file = tokio::fs::File::create(&staging).await.or_raise(|| ErrorKind::Cache)?;
        let (file, result) = self.execute(plan, file.into_std().await, verify, ctx).await?;
        if result.cancelled {
            exn::bail!(ErrorKind::Cancelled { partial: None });
        }
        spawn_blocking(move || file.sync_all())
            .await
            .or_raise(|| ErrorKind::Task)?
            .or_raise(|| ErrorKind::Cache)
    }
}

fn assembly_key(plan: &AssemblyPlan) -> CacheKey {
    let label = plan
        .dataset
        .file_name()
        .map_or_else(|| "dataset".to_string(), |name| name.to_string_lossy().into_owned());
    let dataset = plan.dataset.to_string_lossy();
    let interval = format!("{}-{}", plan.interval.start, plan.interval.end);
    let fingerprint = plan.fingerprint();
    CacheKey::new(
        &label,
        [
            ("dataset", &*dataset),
            ("interval", interval.as_str()),
            ("plan", fingerprint.as_str()),
        ],
    )
}

async fn zero_fill<W: Write + Send + 'static>(sink: W, len: u64) -> Result<W> {
    spawn_blocking(move || -> Result<W> {
        let mut sink = sink;
        io::copy(&mut io::repeat(0).take(len), &mut sink).or_raise(|| ErrorKind::Storage)?;
        Ok(sink)
    })
    .await
    .or_raise(|| ErrorKind::Task)?
}
