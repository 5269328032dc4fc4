//! In-memory storage backend for testing.

use super::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::models::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use time::UtcDateTime;

type Files = Arc<RwLock<HashMap<PathBuf, (UtcDateTime, Vec<u8>)>>>;

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a synchronous [`RwLock`] (never
/// held across an await), so the streaming writer can commit from inside
/// [`spawn_blocking`](tokio::task::spawn_blocking).
///
/// # Examples
///
/// ```
/// use tellus_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("exp01/namelist.nml", b"&run nyears=10 /"),
/// ]);
/// assert!(backend.exists(Path::new("exp01/namelist.nml")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: Files,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // Deliberate: MockBackend only exists for tests.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: Arc::new(RwLock::new(map)),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn file_info(path: &Path, size: u64, inserted: UtcDateTime) -> FileInfo {
        FileInfo::new(path, size, inserted)
    }

    fn get(&self, path: &Path) -> Result<(UtcDateTime, Vec<u8>)> {
        let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

/// Buffers writes and commits them to the map on `flush()`.
struct MockWriter {
    path: PathBuf,
    buffer: Vec<u8>,
    storage: Files,
}
impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(self.path.clone(), (UtcDateTime::now(), self.buffer.clone()));
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        // Snapshot matching entries before yielding anything.
        let entries: Vec<FileInfo> = {
            let guard = self.storage.read().unwrap_or_else(PoisonError::into_inner);
            guard
                .iter()
                .filter(|(path, _)| match &validated_prefix {
                    Some(pfx) => path.starts_with(pfx),
                    None => true,
                })
                .map(|(path, (inserted, data))| Self::file_info(path, data.len() as u64, *inserted))
                .collect()
        };
        Box::pin(stream! {
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().unwrap_or_else(PoisonError::into_inner).contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        Ok(self.get(&path)?.1)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let data = self.read(path).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(path, (UtcDateTime::now(), data.to_vec()));
        Ok(())
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        let path = validate_path(path)?;
        Ok(Box::new(MockWriter {
            path,
            buffer: Vec::new(),
            storage: Arc::clone(&self.storage),
        }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        let mut guard = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        let data = guard.remove(&from).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(from)))?;
        guard.insert(to, data);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let (inserted, data) = self.get(&path)?;
        Ok(Self::file_info(&path, data.len() as u64, inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_with_files() {
        let backend = MockBackend::with_files([
            ("exp01/input/forcing.nc", Vec::from(*b"forcing")),
            ("exp01/namelist.nml", Vec::from(*b"&run /")),
        ]);
        assert!(backend.exists(Path::new("exp01/input/forcing.nc")).await.unwrap());
        assert!(!backend.exists(Path::new("exp02/namelist.nml")).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read(Path::new("missing.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_writer_commits_on_flush() {
        let backend = MockBackend::default();
        let mut writer = backend.writer(Path::new("out/ocean.nc")).await.unwrap();
        writer.write_all(b"partial").unwrap();
        assert!(!backend.exists(Path::new("out/ocean.nc")).await.unwrap());
        writer.flush().unwrap();
        assert_eq!(backend.read(Path::new("out/ocean.nc")).await.unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_reader() {
        let backend = MockBackend::with_files([("a.log", Vec::from(*b"line one"))]);
        let mut reader = backend.reader(Path::new("a.log")).await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "line one");
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let backend = MockBackend::default();
        backend.write(Path::new("old.txt"), b"data").await.unwrap();
        backend.rename(Path::new("old.txt"), Path::new("new.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("old.txt")).await.unwrap());
        backend.delete(Path::new("new.txt")).await.unwrap();
        let err = backend.delete(Path::new("new.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let err = backend.rename(Path::new("missing.txt"), Path::new("x.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat() {
        let backend = MockBackend::default();
        backend.write(Path::new("exp01.tar.bz2"), b"12345").await.unwrap();
        let info = backend.stat(Path::new("exp01.tar.bz2")).await.unwrap();
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MockBackend::with_files([
            ("exp01/a.nc", Vec::from(*b"a")),
            ("exp01/b.nc", Vec::from(*b"b")),
            ("exp02/c.nc", Vec::from(*b"c")),
        ]);
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
        let files = backend.list(Some(Path::new("exp01"))).await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../escape"), b"bad").await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
