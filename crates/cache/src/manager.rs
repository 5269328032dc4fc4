//! The bounded cache of materialized files.

use crate::config::{CacheConfig, EvictionPolicy};
use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::key::CacheKey;
use crate::models::{CacheEntry, CacheStats, CleanupReport, EntryRow};
use crate::repo::CacheIndex;
use exn::{Exn, ResultExt};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use time::{Duration, UtcDateTime};
use tracing::{debug, info, instrument, warn};

/// File name of the index inside the cache root.
pub const INDEX_FILE: &str = "cache.db";
const STAGING_PREFIX: &str = ".partial-";

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    last_eviction_error: Option<String>,
}

/// Local directory of materialized files, bounded by
/// [`CacheConfig::max_size_bytes`].
///
/// Files live at `<root>/<digest[0..2]>/<digest>/<label>`. Each key is
/// materialized at most once at a time: concurrent requests for the same key
/// wait for the first producer and then share its result.
pub struct CacheManager {
    config: CacheConfig,
    db: Database,
    index: CacheIndex,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    // Serializes eviction passes.
    budget: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
    clock: AtomicI64,
}

impl CacheManager {
    /// Open (or create) the cache at `config.root`.
    ///
    /// Pins belong to the process that set them and are cleared here.
    #[instrument(skip_all, fields(root = %config.root.display()))]
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.root).await.or_raise(|| ErrorKind::Io)?;
        let db = Database::connect(config.root.join(INDEX_FILE)).await?;
        let manager = Self::with_database(config, db).await?;
        let stats = manager.get_cache_stats().await?;
        info!(entries = stats.entries, total_size = stats.total_size, "Opened cache");
        Ok(manager)
    }

    /// Open a cache whose index lives in memory; files still go under
    /// `config.root`.
    pub async fn open_in_memory(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.root).await.or_raise(|| ErrorKind::Io)?;
        let db = Database::connect_in_memory().await?;
        Self::with_database(config, db).await
    }

    async fn with_database(config: CacheConfig, db: Database) -> Result<Self> {
        let index = CacheIndex::from(&db);
        let cleared = index.clear_pins().await?;
        if cleared > 0 {
            debug!(cleared, "Cleared pins left by a previous process");
        }
        let clock = AtomicI64::new(index.max_last_access().await?);
        Ok(Self {
            config,
            db,
            index,
            in_flight: Mutex::new(HashMap::new()),
            budget: tokio::sync::Mutex::new(()),
            counters: Mutex::new(Counters::default()),
            clock,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Absolute path an entry for `key` lives at, whether or not it exists.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.config.root.join(key.relative_path())
    }

    /// Return the cached file for `key`, materializing it with `producer` on
    /// a miss.
    ///
    /// The producer receives a staging path to write the file to; the
    /// manager moves it into place once the producer succeeds. A failed
    /// producer leaves nothing behind and records nothing.
    ///
    /// The new entry is never evicted by its own insertion. An entry larger
    /// than [`CacheConfig::max_size_bytes`] is therefore still returned and
    /// leaves the cache over budget, which [`get_cache_stats`](Self::get_cache_stats)
    /// reports until the next insertion or [`cleanup`](Self::cleanup) evicts it.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_or_materialize<F, Fut, E>(&self, key: &CacheKey, producer: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::result::Result<(), Exn<E>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(path) = self.lookup(key).await? {
            self.count(|c| c.hits += 1);
            return Ok(path);
        }
        // Declared before `flight` so that it drops after it.
        let _landing = Landing {
            cache: self,
            digest: key.digest(),
        };
        let flight = self.flight(key);
        let _guard = flight.lock().await;
        // Another task may have finished materializing while we waited.
        if let Some(path) = self.lookup(key).await? {
            self.count(|c| c.hits += 1);
            return Ok(path);
        }
        self.count(|c| c.misses += 1);
        self.materialize(key, producer).await
    }

    async fn materialize<F, Fut, E>(&self, key: &CacheKey, producer: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::result::Result<(), Exn<E>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let final_path = self.path_for(key);
        let dir = self.config.root.join(key.relative_dir());
        let staging = dir.join(format!("{STAGING_PREFIX}{}", key.label()));
        tokio::fs::create_dir_all(&dir).await.or_raise(|| ErrorKind::Io)?;
        remove_file_if_present(&staging).await?;

        debug!(staging = %staging.display(), "Materializing cache entry");
        if let Err(err) = producer(staging.clone()).await {
            remove_file_if_present(&staging).await?;
            return Err(err).or_raise(|| ErrorKind::Producer(key.to_string()));
        }
        let size = tokio::fs::metadata(&staging).await.or_raise(|| ErrorKind::Io)?.len();
        tokio::fs::rename(&staging, &final_path).await.or_raise(|| ErrorKind::Io)?;

        let row = EntryRow {
            digest: key.digest().to_string(),
            label: key.label().to_string(),
            size: i64::try_from(size).or_raise(|| ErrorKind::InvalidData("entry size"))?,
            created_at: UtcDateTime::now().unix_timestamp(),
            last_access: self.stamp(),
            pinned: false,
        };
        self.index.upsert(&row).await?;
        info!(size, path = %final_path.display(), "Cached entry");
        self.enforce_budget(Some(key), false).await?;
        Ok(final_path)
    }

    /// Path of a fresh entry, touching it. Stale entries are dropped.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<PathBuf>> {
        let Some(row) = self.index.get(key.digest()).await? else {
            return Ok(None);
        };
        if self.is_stale(&row).await {
            debug!(key = %key, "Dropping stale cache entry");
            self.discard(&row).await?;
            return Ok(None);
        }
        self.index.touch(&row.digest, self.stamp()).await?;
        Ok(Some(self.path_for(key)))
    }

    async fn is_stale(&self, row: &EntryRow) -> bool {
        let path = self.config.root.join(row.key().relative_path());
        let on_disk = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return true,
        };
        if on_disk != row.size() {
            return true;
        }
        let Some(max_age) = self.config.max_age_secs else {
            return false;
        };
        let max_age = Duration::seconds(i64::try_from(max_age).unwrap_or(i64::MAX));
        match UtcDateTime::from_unix_timestamp(row.created_at) {
            Ok(created) => UtcDateTime::now() - created > max_age,
            Err(_) => true,
        }
    }

    /// Fresh entry for `key`, counted as an access.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        if self.lookup(key).await?.is_none() {
            return Ok(None);
        }
        match self.index.get(key.digest()).await? {
            Some(row) => Ok(Some(CacheEntry::from_row(row, &self.config.root)?)),
            None => Ok(None),
        }
    }

    /// Whether an entry is recorded for `key`, without touching it.
    pub async fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.index.get(key.digest()).await?.is_some())
    }

    /// Exempt `key` from eviction. Returns `false` if it is not cached.
    pub async fn pin(&self, key: &CacheKey) -> Result<bool> {
        self.index.set_pinned(key.digest(), true).await
    }

    pub async fn unpin(&self, key: &CacheKey) -> Result<bool> {
        let found = self.index.set_pinned(key.digest(), false).await?;
        if found {
            // Pins may have been holding the cache over budget.
            self.enforce_budget(None, false).await?;
        }
        Ok(found)
    }

    /// Delete the entry for `key`, pinned or not.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        match self.index.get(key.digest()).await? {
            Some(row) => {
                self.discard(&row).await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Drop stale entries, then evict down to the target when over the
    /// threshold. `force` evicts down to the target regardless of threshold
    /// and policy.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for row in self.index.list().await? {
            if self.is_stale(&row).await {
                self.discard(&row).await?;
                report.stale_removed += 1;
            }
        }
        let (evicted, freed) = self.enforce_budget(None, force).await?;
        report.evicted = evicted;
        report.bytes_freed = freed;
        info!(
            stale_removed = report.stale_removed,
            evicted = report.evicted,
            bytes_freed = report.bytes_freed,
            "Cache cleanup finished"
        );
        Ok(report)
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        let totals = self.index.totals().await?;
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(CacheStats {
            entries: totals.entries,
            total_size: totals.total_size,
            pinned_size: totals.pinned_size,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            max_size_bytes: self.config.max_size_bytes,
            over_budget: totals.total_size > self.config.max_size_bytes,
            last_eviction_error: counters.last_eviction_error.clone(),
        })
    }

    /// Close the index. Files stay on disk for the next process.
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Evict unpinned entries (except `protect`) until the total drops to the
    /// target. Returns the number of entries evicted and bytes freed.
    ///
    /// Whatever pinned or protected entries keep above the maximum is
    /// recorded as the last eviction error rather than failing the caller.
    async fn enforce_budget(&self, protect: Option<&CacheKey>, force: bool) -> Result<(u64, u64)> {
        if self.config.policy == EvictionPolicy::Manual && !force {
            return Ok((0, 0));
        }
        let _budget = self.budget.lock().await;
        let mut total = self.index.totals().await?.total_size;
        if !force && total <= self.config.threshold_bytes() {
            return Ok((0, 0));
        }
        let target = self.config.target_bytes();
        let (mut evicted, mut freed) = (0, 0);
        for row in self.index.eviction_candidates(self.config.policy).await? {
            if total <= target {
                break;
            }
            if protect.is_some_and(|key| key.digest() == row.digest) {
                continue;
            }
            self.discard(&row).await?;
            total = total.saturating_sub(row.size());
            freed += row.size();
            evicted += 1;
        }
        self.count(|c| c.evictions += evicted);
        if total > self.config.max_size_bytes {
            let err = ErrorKind::Eviction {
                used: total,
                max: self.config.max_size_bytes,
            };
            warn!(used = total, max = self.config.max_size_bytes, "Cache remains over budget");
            self.count(|c| c.last_eviction_error = Some(err.to_string()));
        }
        if evicted > 0 {
            debug!(evicted, freed, "Evicted cache entries");
        }
        Ok((evicted, freed))
    }

    /// Remove an entry's files and its index row.
    async fn discard(&self, row: &EntryRow) -> Result<()> {
        let dir = self.config.root.join(row.key().relative_dir());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {},
            Err(err) if err.kind() == IoErrorKind::NotFound => {},
            Err(err) => return Err(err).or_raise(|| ErrorKind::Io),
        }
        self.index.delete(&row.digest).await?;
        Ok(())
    }

    fn flight(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.entry(key.digest().to_string()).or_default().clone()
    }

    /// Forget the flight lock for `digest` once only the map holds it.
    fn land(&self, digest: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if in_flight.get(digest).is_some_and(|flight| Arc::strong_count(flight) == 1) {
            in_flight.remove(digest);
        }
    }

    /// Strictly increasing access stamp.
    fn stamp(&self) -> i64 {
        let now = i64::try_from(UtcDateTime::now().unix_timestamp_nanos()).unwrap_or(i64::MAX);
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn count(&self, update: impl FnOnce(&mut Counters)) {
        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut counters);
    }
}

/// Lands a flight when its request finishes, fails or is dropped.
struct Landing<'a> {
    cache: &'a CacheManager,
    digest: &'a str,
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        self.cache.land(self.digest);
    }
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).or_raise(|| ErrorKind::Io),
    }
}
