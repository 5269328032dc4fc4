//! What to do when an extracted member's destination already exists.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Give up looking for a free name after this many attempts.
pub(crate) const MAX_RENAME_ATTEMPTS: u32 = 10_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConflictResolution {
    /// Fail the member with [`ExtractionConflict`](crate::error::ErrorKind::ExtractionConflict).
    #[default]
    Fail,
    /// Leave the existing file and record the member as skipped.
    SkipExisting,
    /// Replace the existing file.
    Overwrite,
    /// Write next to the existing file under the first free `_N` name.
    Rename,
}

/// `path` with `_n` inserted before the first `.` of its file name.
///
/// A leading dot is part of the name, so `.hidden` becomes `.hidden_1` and
/// `ocean.tar.gz` becomes `ocean_1.tar.gz`.
pub(crate) fn numbered(path: &Path, n: u32) -> PathBuf {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return path.to_path_buf();
    };
    let split = name
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '.')
        .map_or(name.len(), |(i, _)| i);
    let (stem, rest) = name.split_at(split);
    path.with_file_name(OsString::from(format!("{stem}_{n}{rest}")))
}
