//! Read-only storage backend.
//!
//! Wraps another backend and refuses every mutating operation. Used for
//! locations that the current process must never modify (e.g. a shared
//! tape archive owned by another project).

use crate::backend::{BoxSyncRead, BoxSyncWrite, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::{BackendHandle, FileInfo, StorageBackend};
use async_trait::async_trait;
use std::path::Path;

/// Read-only storage backend.
///
/// Reads pass through; writes, renames and deletes fail with
/// [`ReadOnly`](ErrorKind::ReadOnly) after logging a warning.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }

    fn refuse(&self, operation: &str, path: &Path) -> exn::Exn<ErrorKind> {
        tracing::warn!(location = self.inner.name(), path = %path.display(), operation, "Refusing write to read-only location");
        exn::Exn::from(ErrorKind::ReadOnly(self.inner.name().to_string()))
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        self.inner.reader(path).await
    }

    async fn write(&self, path: &Path, _data: &[u8]) -> Result<()> {
        Err(self.refuse("write", path))
    }

    async fn writer(&self, path: &Path) -> Result<BoxSyncWrite> {
        Err(self.refuse("writer", path))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        Err(self.refuse("delete", path))
    }

    async fn rename(&self, from: &Path, _to: &Path) -> Result<()> {
        Err(self.refuse("rename", from))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path).await
    }
}
