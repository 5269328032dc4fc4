use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_THRESHOLD: f64 = 0.8;
const DEFAULT_TARGET: f64 = 0.7;

/// Which unpinned entries are evicted first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Largest first, least recently accessed among equals.
    LargestFirst,
    /// Never evict automatically; only [`cleanup`](crate::CacheManager::cleanup)
    /// with `force` frees space.
    Manual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub root: PathBuf,
    #[serde(default = "default_max_size")]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub policy: EvictionPolicy,
    /// Entries created longer ago than this are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    /// Fraction of `max_size_bytes` above which eviction starts.
    #[serde(default = "default_threshold")]
    pub cleanup_threshold: f64,
    /// Fraction of `max_size_bytes` eviction frees space down to.
    #[serde(default = "default_target")]
    pub cleanup_target: f64,
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_target() -> f64 {
    DEFAULT_TARGET
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size_bytes: DEFAULT_MAX_SIZE,
            policy: EvictionPolicy::default(),
            max_age_secs: None,
            cleanup_threshold: DEFAULT_THRESHOLD,
            cleanup_target: DEFAULT_TARGET,
        }
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn with_thresholds(mut self, threshold: f64, target: f64) -> Self {
        self.cleanup_threshold = threshold;
        self.cleanup_target = target;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            exn::bail!(ErrorKind::InvalidConfig("max_size_bytes must be positive".to_string()));
        }
        let valid = 0.0 < self.cleanup_target
            && self.cleanup_target <= self.cleanup_threshold
            && self.cleanup_threshold <= 1.0;
        if !valid {
            exn::bail!(ErrorKind::InvalidConfig(format!(
                "expected 0 < cleanup_target ({}) <= cleanup_threshold ({}) <= 1",
                self.cleanup_target, self.cleanup_threshold
            )));
        }
        Ok(())
    }

    /// Size above which eviction starts.
    pub(crate) fn threshold_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.cleanup_threshold) as u64
    }

    /// Size eviction frees space down to; never above the budget itself.
    pub(crate) fn target_bytes(&self) -> u64 {
        ((self.max_size_bytes as f64 * self.cleanup_target) as u64).min(self.max_size_bytes)
    }
}
