//! Blocking halves of extraction, run inside `spawn_blocking`.

use crate::error::{Error, ErrorKind, Result};
use crate::extract::conflict::{ConflictResolution, MAX_RENAME_ATTEMPTS, numbered};
use crate::extract::{ExtractionConfig, ExtractionMode, ExtractionResult, MemberVerification};
use crate::progress::OperationContext;
use exn::ResultExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tellus_archive::error::ErrorKind as ArchiveErrorKind;
use tellus_archive::hash::{HashingReader, HashingWriter};
use tellus_archive::{FileEntry, Interval, PathMapper, container};
use tellus_compress::Compression;
use tellus_storage::{BackendHandle, LocationConfig};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Why a member walk stopped early.
pub(crate) enum Stop {
    Cancelled,
    Abort(Error),
}

/// Writes selected members of one container to a destination location.
pub(crate) struct ExtractJob {
    pub(crate) handle: Handle,
    pub(crate) backend: BackendHandle,
    pub(crate) location: LocationConfig,
    pub(crate) mapper: Arc<PathMapper>,
    pub(crate) config: ExtractionConfig,
    pub(crate) ctx: OperationContext,
    /// Members still to extract; whatever remains after the walk was not in
    /// the container.
    pub(crate) selected: BTreeMap<PathBuf, FileEntry>,
    pub(crate) result: ExtractionResult,
    pub(crate) total: u64,
}

impl ExtractJob {
    pub(crate) fn run(&mut self, reader: impl Read, compression: Compression) -> Result<Option<Stop>> {
        container::read_members(reader, compression, |path, _size, data| self.visit(path, data))
            .or_raise(|| ErrorKind::Archive)
    }

    fn visit(&mut self, path: &Path, data: &mut dyn Read) -> ControlFlow<Stop> {
        if !self.selected.contains_key(path) {
            return ControlFlow::Continue(());
        }
        if self.ctx.is_cancelled() {
            return ControlFlow::Break(Stop::Cancelled);
        }
        let Some(entry) = self.selected.remove(path) else {
            return ControlFlow::Continue(());
        };
        if let Err(err) = self.extract_member(&entry, data) {
            self.result.failed.push((entry.logical_path.clone(), (*err).to_string()));
            // `Fail` stops at the first collision whatever the mode.
            let collision = self.config.conflict_resolution == ConflictResolution::Fail
                && matches!(&*err, ErrorKind::ExtractionConflict(_));
            if collision || self.config.mode == ExtractionMode::Full {
                return ControlFlow::Break(Stop::Abort(err));
            }
        }
        let done = self.total - self.selected.len() as u64;
        self.ctx.report(done, self.total, &entry.logical_path.to_string_lossy());
        ControlFlow::Continue(())
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    fn extract_member(&mut self, entry: &FileEntry, data: &mut dyn Read) -> Result<()> {
        let target = match self.mapper.resolve(&entry.logical_path, &self.location) {
            Ok(target) => target,
            Err(err) => {
                let kind = match &*err {
                    ArchiveErrorKind::UnresolvedPath { path, location } => ErrorKind::UnresolvedPath {
                        path: path.clone(),
                        location: location.clone(),
                    },
                    _ => ErrorKind::Archive,
                };
                return Err(err).or_raise(|| kind);
            },
        };

        let exists = self.block_on(self.backend.exists(&target)).or_raise(|| ErrorKind::Storage)?;
        let (target, renamed_from) = match (exists, self.config.conflict_resolution) {
            (false, _) | (true, ConflictResolution::Overwrite) => (target, None),
            (true, ConflictResolution::Fail) => exn::bail!(ErrorKind::ExtractionConflict(target)),
            (true, ConflictResolution::SkipExisting) => {
                debug!(path = %target.display(), "Destination exists, skipping");
                self.result.skipped.push(target);
                return Ok(());
            },
            (true, ConflictResolution::Rename) => (self.free_name(&target)?, Some(target)),
        };

        let writer = self.block_on(self.backend.writer(&target)).or_raise(|| ErrorKind::Storage)?;
        let mut hashing = HashingWriter::new(writer);
        io::copy(data, &mut hashing).or_raise(|| ErrorKind::Archive)?;
        hashing.flush().or_raise(|| ErrorKind::Storage)?;
        let (_, actual, written) = hashing.into_parts();
        self.result.bytes_written += written;

        let corrupt = written != entry.size || (self.config.verify_checksums && actual != entry.checksum);
        if corrupt {
            if let Err(err) = self.block_on(self.backend.delete(&target)) {
                warn!(path = %target.display(), error = ?err, "Failed to remove corrupt output");
            }
            exn::bail!(ErrorKind::ChecksumMismatch {
                path: entry.logical_path.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }
        debug!(path = %target.display(), size = written, "Extracted member");
        if let Some(from) = renamed_from {
            self.result.renamed.push((from, target.clone()));
        }
        self.result.extracted.push(target);
        Ok(())
    }

    /// First `_N` variant of `target` that does not exist yet.
    fn free_name(&self, target: &Path) -> Result<PathBuf> {
        for n in 1..=MAX_RENAME_ATTEMPTS {
            let candidate = numbered(target, n);
            if !self.block_on(self.backend.exists(&candidate)).or_raise(|| ErrorKind::Storage)? {
                return Ok(candidate);
            }
        }
        exn::bail!(ErrorKind::ExtractionConflict(target.to_path_buf()))
    }
}

/// Copy `range` of `entry` into `sink`.
///
/// With `verify`, the whole member is read and hashed so that a corrupt
/// member fails with [`ErrorKind::ChecksumMismatch`] even when the range
/// itself is intact.
pub(crate) fn copy_range<R: Read, W: Write>(
    reader: R,
    compression: Compression,
    entry: &FileEntry,
    range: Interval,
    sink: &mut W,
    verify: bool,
) -> Result<u64> {
    let copied = match verify {
        false => container::read_range(reader, compression, &entry.logical_path, range, &mut *sink)
            .or_raise(|| ErrorKind::Archive)?,
        true => {
            let found = container::read_members(reader, compression, |path, _size, data| {
                if path != entry.logical_path.as_path() {
                    return ControlFlow::Continue(());
                }
                ControlFlow::Break(hash_through(data, entry, range, &mut *sink))
            })
            .or_raise(|| ErrorKind::Archive)?;
            match found {
                Some(copied) => copied?,
                None => exn::bail!(ErrorKind::Archive),
            }
        },
    };
    sink.flush().or_raise(|| ErrorKind::Storage)?;
    Ok(copied)
}

fn hash_through<W: Write>(data: &mut dyn Read, entry: &FileEntry, range: Interval, sink: &mut W) -> Result<u64> {
    let mut hashing = HashingReader::new(data);
    io::copy(&mut (&mut hashing).take(range.start), &mut io::sink()).or_raise(|| ErrorKind::Archive)?;
    let copied = io::copy(&mut (&mut hashing).take(range.len()), sink).or_raise(|| ErrorKind::Storage)?;
    io::copy(&mut hashing, &mut io::sink()).or_raise(|| ErrorKind::Archive)?;
    let (_, actual, read) = hashing.into_parts();
    if read != entry.size || actual != entry.checksum || copied != range.len() {
        exn::bail!(ErrorKind::ChecksumMismatch {
            path: entry.logical_path.clone(),
            expected: entry.checksum.clone(),
            actual,
        });
    }
    Ok(copied)
}

/// Hash every member of a container against the manifest entries.
pub(crate) fn verify_members(
    reader: impl Read,
    compression: Compression,
    members: &[FileEntry],
) -> Result<(Vec<MemberVerification>, Vec<PathBuf>)> {
    let mut expected: BTreeMap<&Path, &FileEntry> = members.iter().map(|m| (m.logical_path.as_path(), m)).collect();
    let mut checked = Vec::with_capacity(members.len());
    let mut unexpected = Vec::new();
    let failure = container::read_members(reader, compression, |path, _size, data| {
        let Some(entry) = expected.remove(path) else {
            unexpected.push(path.to_path_buf());
            return ControlFlow::Continue(());
        };
        let mut hashing = HashingReader::new(data);
        if let Err(err) = io::copy(&mut hashing, &mut io::sink()) {
            return ControlFlow::Break(err);
        }
        let (_, actual, read) = hashing.into_parts();
        checked.push(MemberVerification {
            path: entry.logical_path.clone(),
            expected: entry.checksum.clone(),
            actual: Some(actual),
            size_matches: read == entry.size,
        });
        ControlFlow::Continue(())
    })
    .or_raise(|| ErrorKind::Archive)?;
    if let Some(err) = failure {
        return Err(err).or_raise(|| ErrorKind::Archive);
    }
    checked.extend(expected.into_values().map(|entry| MemberVerification {
        path: entry.logical_path.clone(),
        expected: entry.checksum.clone(),
        actual: None,
        size_matches: false,
    }));
    checked.sort_by(|a, b| a.path.cmp(&b.path));
    Ok((checked, unexpected))
}
