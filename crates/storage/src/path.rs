//! Relative path normalization shared by every backend.

use crate::error::{ErrorKind, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Normalize a path relative to a location root.
///
/// Logical dataset paths and physical paths inside a location go through the
/// same normalization, so one member always maps to one key. `.` segments,
/// repeated separators and leading or trailing slashes disappear; `..` is
/// resolved lexically and must never climb above the root. Null bytes,
/// drive prefixes and paths that normalize to nothing are rejected with
/// [`ErrorKind::InvalidPath`].
///
/// ```
/// use std::path::Path;
/// use tellus_storage::validate_path;
///
/// assert_eq!(
///     validate_path("/exp01//outdata/./ocean_1990.nc").unwrap(),
///     Path::new("exp01/outdata/ocean_1990.nc")
/// );
/// assert_eq!(validate_path("exp01/log/../restart").unwrap(), Path::new("exp01/restart"));
/// assert!(validate_path("exp01/../../etc/passwd").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(path.to_path_buf());
    let mut segments: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) if segment.as_encoded_bytes().contains(&0) => exn::bail!(invalid()),
            Component::Normal(segment) => segments.push(segment),
            Component::ParentDir if segments.pop().is_none() => exn::bail!(invalid()),
            Component::CurDir | Component::RootDir | Component::ParentDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
        }
    }
    if segments.is_empty() {
        exn::bail!(invalid());
    }
    Ok(segments.iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_within_root() {
        for (input, expected) in [
            ("exp01/outdata/ocean_1990.nc", "exp01/outdata/ocean_1990.nc"),
            ("/exp01/namelist.nml", "exp01/namelist.nml"),
            ("exp01//log///run.log", "exp01/log/run.log"),
            ("./exp01/./restart/fesom.rst", "exp01/restart/fesom.rst"),
            ("exp01/outdata/../restart", "exp01/restart"),
            ("exp01/restart/..", "exp01"),
            ("exp01///", "exp01"),
        ] {
            assert_eq!(validate(input).unwrap(), Path::new(expected), "{input}");
        }
    }

    #[test]
    fn test_rejects_escaping_and_empty_paths() {
        for input in ["../etc/passwd", "exp01/../../exp02", "..", "", ".", "./.", "//", "exp01/\0/ocean.nc"] {
            assert!(validate(input).is_err(), "{input:?}");
        }
    }

    #[test]
    fn test_error_names_the_input() {
        let err = validate("exp01/../..").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(path) if path == Path::new("exp01/../..")));
    }

    #[cfg(windows)]
    #[test]
    fn test_backslashes_are_separators_on_windows() {
        assert_eq!(validate("exp01\\outdata/ocean.nc").unwrap(), Path::new("exp01/outdata/ocean.nc"));
    }
}
