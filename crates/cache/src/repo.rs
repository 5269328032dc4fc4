//! Queries over the `cache_entries` table.

use crate::config::EvictionPolicy;
use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::models::EntryRow;
use exn::ResultExt;
use sqlx::SqlitePool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    pub(crate) entries: u64,
    pub(crate) total_size: u64,
    pub(crate) pinned_size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct CacheIndex {
    pool: SqlitePool,
}

impl From<&Database> for CacheIndex {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

impl CacheIndex {
    pub(crate) async fn upsert(&self, row: &EntryRow) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(&row.digest)
            .bind(&row.label)
            .bind(row.size)
            .bind(row.created_at)
            .bind(row.last_access)
            .bind(row.pinned)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub(crate) async fn get(&self, digest: &str) -> Result<Option<EntryRow>> {
        sqlx::query_as(include_str!("../queries/get_entry.sql"))
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn touch(&self, digest: &str, stamp: i64) -> Result<()> {
        sqlx::query(include_str!("../queries/touch_entry.sql"))
            .bind(stamp)
            .bind(digest)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Returns `false` when no entry has this digest.
    pub(crate) async fn set_pinned(&self, digest: &str, pinned: bool) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/set_pinned.sql"))
            .bind(pinned)
            .bind(digest)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn clear_pins(&self) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/clear_pins.sql"))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    pub(crate) async fn delete(&self, digest: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(digest)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Every entry, least recently accessed first.
    pub(crate) async fn list(&self) -> Result<Vec<EntryRow>> {
        sqlx::query_as(include_str!("../queries/list_entries.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Unpinned entries in eviction order. [`EvictionPolicy::Manual`] uses
    /// LRU order for forced cleanups.
    pub(crate) async fn eviction_candidates(&self, policy: EvictionPolicy) -> Result<Vec<EntryRow>> {
        let query = match policy {
            EvictionPolicy::Lru | EvictionPolicy::Manual => include_str!("../queries/eviction_candidates_lru.sql"),
            EvictionPolicy::LargestFirst => include_str!("../queries/eviction_candidates_largest.sql"),
        };
        sqlx::query_as(query)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn totals(&self) -> Result<Totals> {
        let (entries, total_size, pinned_size): (i64, i64, i64) = sqlx::query_as(include_str!("../queries/totals.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Totals {
            entries: u64::try_from(entries).or_raise(|| ErrorKind::InvalidData("entry count"))?,
            total_size: u64::try_from(total_size).or_raise(|| ErrorKind::InvalidData("total size"))?,
            pinned_size: u64::try_from(pinned_size).or_raise(|| ErrorKind::InvalidData("pinned size"))?,
        })
    }

    pub(crate) async fn max_last_access(&self) -> Result<i64> {
        sqlx::query_scalar(include_str!("../queries/max_last_access.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }
}
