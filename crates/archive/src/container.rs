//! Tar containers inside a compression stream.
//!
//! Headers are written deterministically (GNU format, mtime 0, uid/gid 0,
//! mode 0644) so that the same members always produce the same bytes.

use crate::error::{ErrorKind, Result};
use crate::hash::HashingReader;
use crate::interval::Interval;
use crate::manifest::ArchiveManifest;
use crate::model::{ArchiveId, Checksum};
use exn::ResultExt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tellus_compress::{Compression, CompressionLevel, Encoder};
use tracing::instrument;

const MEMBER_MODE: u32 = 0o644;

/// File name of the container for `archive_id`: `<id>.tar<ext>`.
pub fn container_name(archive_id: &ArchiveId, compression: Compression) -> String {
    format!("{archive_id}.tar{}", compression.extension())
}

/// A written archive: its manifest plus where the container lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedArchive {
    pub manifest: ArchiveManifest,
    /// Name of the location holding the container.
    pub location: String,
    /// Container path relative to the location root.
    pub container: PathBuf,
}

impl CompressedArchive {
    pub fn archive_id(&self) -> &ArchiveId {
        self.manifest.archive_id()
    }

    /// Sidecar path next to the container.
    pub fn sidecar(&self) -> PathBuf {
        self.container.with_file_name(ArchiveManifest::sidecar_name(self.archive_id()))
    }
}

pub struct ContainerWriter<W: Write> {
    builder: Builder<Encoder<W>>,
    members: usize,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(writer: W, compression: Compression, level: CompressionLevel) -> Result<Self> {
        let encoder = compression.encoder(writer, level).or_raise(|| ErrorKind::Compression)?;
        Ok(Self {
            builder: Builder::new(encoder),
            members: 0,
        })
    }

    /// Stream one member into the container, returning its digest.
    ///
    /// `reader` must yield exactly `size` bytes. A short or long reader fails
    /// with [`ErrorKind::SizeMismatch`] and leaves the container unusable.
    #[instrument(level = "debug", skip_all, fields(path = %logical_path.display(), size))]
    pub fn append(&mut self, logical_path: &Path, size: u64, reader: impl Read) -> Result<Checksum> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(MEMBER_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        let mut hashing = HashingReader::new(reader.take(size));
        self.builder
            .append_data(&mut header, logical_path, &mut hashing)
            .or_raise(|| ErrorKind::Io)?;
        let (limited, checksum, read) = hashing.into_parts();
        let excess = io::copy(&mut limited.into_inner(), &mut io::sink()).or_raise(|| ErrorKind::Io)?;
        if read != size || excess > 0 {
            exn::bail!(ErrorKind::SizeMismatch {
                path: logical_path.to_path_buf(),
                expected: size,
                actual: read + excess,
            });
        }
        self.members += 1;
        Ok(checksum)
    }

    pub fn members(&self) -> usize {
        self.members
    }

    /// Write the tar trailer, finish the codec and return the inner writer.
    pub fn finish(self) -> Result<W> {
        let encoder = self.builder.into_inner().or_raise(|| ErrorKind::Io)?;
        encoder.finish().or_raise(|| ErrorKind::Compression)
    }
}

/// Walk the members of a container in order.
///
/// `visit` receives each member's path, its size and a reader over its bytes.
/// Returning [`ControlFlow::Break`] stops the walk and hands the value back.
/// A stream whose leading bytes belong to another codec fails with
/// [`ErrorKind::Compression`] before anything is decoded.
pub fn read_members<R, T, F>(reader: R, compression: Compression, mut visit: F) -> Result<Option<T>>
where
    R: Read,
    F: FnMut(&Path, u64, &mut dyn Read) -> ControlFlow<T>,
{
    let mut reader = BufReader::new(reader);
    let head = reader.fill_buf().or_raise(|| ErrorKind::Io)?;
    if !compression.check_magic_bytes(head) {
        exn::bail!(ErrorKind::Compression);
    }
    let decoded = compression.wrap_reader(reader).or_raise(|| ErrorKind::Compression)?;
    let mut archive = Archive::new(decoded);
    for entry in archive.entries().or_raise(|| ErrorKind::Io)? {
        let mut entry = entry.or_raise(|| ErrorKind::Io)?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let path = entry.path().or_raise(|| ErrorKind::Io)?.into_owned();
        let size = entry.size();
        if let ControlFlow::Break(value) = visit(&path, size, &mut entry) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Copy `range` (relative to the start of the member) of one member into
/// `sink`, returning the number of bytes copied.
#[instrument(level = "debug", skip_all, fields(member = %member.display(), %range))]
pub fn read_range<R: Read, W: Write>(
    reader: R,
    compression: Compression,
    member: &Path,
    range: Interval,
    sink: &mut W,
) -> Result<u64> {
    let copied = read_members(reader, compression, |path, size, data| {
        if path != member {
            return ControlFlow::Continue(());
        }
        let outcome = (|| -> Result<u64> {
            if range.end > size {
                exn::bail!(ErrorKind::SizeMismatch {
                    path: member.to_path_buf(),
                    expected: range.end,
                    actual: size,
                });
            }
            io::copy(&mut (&mut *data).take(range.start), &mut io::sink()).or_raise(|| ErrorKind::Io)?;
            let copied = io::copy(&mut (&mut *data).take(range.len()), &mut *sink).or_raise(|| ErrorKind::Io)?;
            if copied != range.len() {
                exn::bail!(ErrorKind::SizeMismatch {
                    path: member.to_path_buf(),
                    expected: range.len(),
                    actual: copied,
                });
            }
            Ok(copied)
        })();
        ControlFlow::Break(outcome)
    })?;
    match copied {
        Some(outcome) => outcome,
        None => exn::bail!(ErrorKind::MemberNotFound(member.to_path_buf())),
    }
}
