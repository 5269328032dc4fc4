use crate::error::{Error, ErrorKind};
use crate::key::CacheKey;
use exn::ResultExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

#[derive(Clone, Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) digest: String,
    pub(crate) label: String,
    pub(crate) size: i64,
    pub(crate) created_at: i64,
    pub(crate) last_access: i64,
    pub(crate) pinned: bool,
}

impl EntryRow {
    pub(crate) fn size(&self) -> u64 {
        u64::try_from(self.size).unwrap_or_default()
    }

    pub(crate) fn key(&self) -> CacheKey {
        CacheKey::from_stored(self.digest.clone(), self.label.clone())
    }
}

/// A materialized file tracked by the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: UtcDateTime,
    /// Monotonic access stamp; larger means more recent.
    pub last_access: i64,
    pub pinned: bool,
}

impl CacheEntry {
    pub(crate) fn from_row(row: EntryRow, root: &Path) -> Result<Self, Error> {
        let key = row.key();
        Ok(Self {
            path: root.join(key.relative_path()),
            key,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("entry size"))?,
            created_at: UtcDateTime::from_unix_timestamp(row.created_at)
                .or_raise(|| ErrorKind::InvalidData("creation date"))?,
            last_access: row.last_access,
            pinned: row.pinned,
        })
    }
}

/// Snapshot of cache occupancy and activity since the manager was opened.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_size: u64,
    pub pinned_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub max_size_bytes: u64,
    pub over_budget: bool,
    /// Most recent failure to evict down to budget.
    pub last_eviction_error: Option<String>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

/// What [`cleanup`](crate::CacheManager::cleanup) removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub stale_removed: u64,
    pub evicted: u64,
    pub bytes_freed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_model() {
        let key = CacheKey::new("ocean.nc", [("dataset", "exp01/ocean.nc")]);
        let created = UtcDateTime::now();
        let row = EntryRow {
            digest: key.digest().to_string(),
            label: key.label().to_string(),
            size: 1024,
            created_at: created.unix_timestamp(),
            last_access: 7,
            pinned: true,
        };
        let entry = CacheEntry::from_row(row, Path::new("/cache")).unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(entry.path, Path::new("/cache").join(key.relative_path()));
        assert_eq!(entry.size, 1024);
        // Unix timestamps drop the sub-second component.
        assert_eq!(entry.created_at, created.replace_nanosecond(0).unwrap());
        assert!(entry.pinned);
    }

    #[test]
    fn test_negative_size_rejected() {
        let row = EntryRow {
            digest: "ab".repeat(32),
            label: "x".to_string(),
            size: -1,
            created_at: 0,
            last_access: 0,
            pinned: false,
        };
        let err = CacheEntry::from_row(row, Path::new("/cache")).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("entry size"));
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
