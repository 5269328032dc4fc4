use crate::interval::Interval;
use crate::model::{Checksum, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Marks a member as one fragment of a larger logical dataset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentRef {
    /// Logical path of the dataset this fragment belongs to.
    pub dataset: PathBuf,
    /// Offsets of the dataset supplied by this member; its length equals
    /// the member size.
    pub coverage: Interval,
    /// Digest identifying the dataset version the fragment was cut from.
    /// Fragments with equal digests agree on every shared byte.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<Checksum>,
}

impl FragmentRef {
    pub fn new(dataset: impl Into<PathBuf>, coverage: Interval) -> Self {
        Self {
            dataset: dataset.into(),
            coverage,
            source_digest: None,
        }
    }

    pub fn with_source_digest(mut self, digest: Checksum) -> Self {
        self.source_digest = Some(digest);
        self
    }

    /// Whether two fragments are known to hold identical bytes wherever
    /// they overlap.
    pub fn agrees_with(&self, other: &FragmentRef) -> bool {
        matches!((&self.source_digest, &other.source_digest), (Some(a), Some(b)) if a == b)
    }
}

/// One member of an archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub logical_path: PathBuf,
    pub size: u64,
    pub checksum: Checksum,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_time: OffsetDateTime,
    #[serde(default)]
    pub tags: BTreeSet<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentRef>,
}

impl FileEntry {
    pub fn has_any_tag(&self, tags: &BTreeSet<Tag>) -> bool {
        !self.tags.is_disjoint(tags)
    }
}
