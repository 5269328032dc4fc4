//! The authoritative description of one archive and its JSON sidecar.

use crate::entry::FileEntry;
use crate::error::{ErrorKind, Result};
use crate::interval::DateRange;
use crate::model::{ArchiveId, Checksum, Tag};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tellus_compress::{Compression, CompressionLevel};
use tellus_storage::validate_path;
use time::OffsetDateTime;

/// Sidecar format written by this version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const SIDECAR_SUFFIX: &str = ".manifest.json";

/// Members are kept sorted by logical path with no duplicates, and
/// `total_uncompressed_size` always equals the sum of member sizes. Both are
/// checked on construction and when reading a sidecar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    format_version: u32,
    archive_id: ArchiveId,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    compression: Compression,
    #[serde(default)]
    level: CompressionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    members: Vec<FileEntry>,
    total_uncompressed_size: u64,
}

/// Catalog view of a manifest, without the member list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub archive_id: ArchiveId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub compression: Compression,
    pub member_count: usize,
    pub total_uncompressed_size: u64,
    pub description: Option<String>,
}

#[derive(Deserialize)]
struct VersionHeader {
    format_version: u32,
}

impl ArchiveManifest {
    /// Build a manifest, sorting `members` by logical path.
    pub fn new(
        archive_id: ArchiveId,
        created_at: OffsetDateTime,
        compression: Compression,
        level: CompressionLevel,
        description: Option<String>,
        mut members: Vec<FileEntry>,
    ) -> Result<Self> {
        members.sort_by(|a, b| a.logical_path.cmp(&b.logical_path));
        let total_uncompressed_size = members
            .iter()
            .try_fold(0u64, |total, m| total.checked_add(m.size))
            .ok_or_else(|| ErrorKind::InvalidManifest("total size overflows".to_string()))?;
        let manifest = Self {
            format_version: MANIFEST_FORMAT_VERSION,
            archive_id,
            created_at,
            compression,
            level,
            description,
            members,
            total_uncompressed_size,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            exn::bail!(ErrorKind::UnsupportedVersion(self.format_version));
        }
        if self.members.is_empty() {
            exn::bail!(ErrorKind::InvalidManifest("archive has no members".to_string()));
        }
        let mut total = 0u64;
        let mut previous: Option<&Path> = None;
        for member in &self.members {
            let normalized =
                validate_path(&member.logical_path).or_raise(|| ErrorKind::InvalidPath(member.logical_path.clone()))?;
            if normalized.as_os_str() != member.logical_path.as_os_str() {
                exn::bail!(ErrorKind::InvalidPath(member.logical_path.clone()));
            }
            if let Some(previous) = previous
                && previous >= member.logical_path.as_path()
            {
                exn::bail!(ErrorKind::InvalidManifest(format!(
                    "members not sorted or duplicated at {}",
                    member.logical_path.display()
                )));
            }
            if let Some(fragment) = &member.fragment
                && fragment.coverage.len() != member.size
            {
                exn::bail!(ErrorKind::InvalidFragment(member.logical_path.clone()));
            }
            total = total
                .checked_add(member.size)
                .ok_or_else(|| ErrorKind::InvalidManifest("total size overflows".to_string()))?;
            previous = Some(member.logical_path.as_path());
        }
        if total != self.total_uncompressed_size {
            exn::bail!(ErrorKind::InvalidManifest(format!(
                "total size {} does not match member sizes {total}",
                self.total_uncompressed_size
            )));
        }
        Ok(())
    }

    /// Digest over everything that determines the container bytes. Archives
    /// built from the same members with the same codec share it.
    pub fn content_digest(members: &[FileEntry], compression: Compression, level: CompressionLevel) -> Checksum {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"compression\0");
        hasher.update(compression.effective(level).as_str().as_bytes());
        hasher.update(b"\0level\0");
        hasher.update(level.as_str().as_bytes());
        let mut sorted: Vec<&FileEntry> = members.iter().collect();
        sorted.sort_by(|a, b| a.logical_path.cmp(&b.logical_path));
        for member in sorted {
            hasher.update(b"\0member\0");
            hasher.update(member.logical_path.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(member.checksum.as_str().as_bytes());
            if let Some(fragment) = &member.fragment {
                hasher.update(b"\0fragment\0");
                hasher.update(fragment.dataset.to_string_lossy().as_bytes());
                hasher.update(&fragment.coverage.start.to_le_bytes());
                hasher.update(&fragment.coverage.end.to_le_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// [`content_digest`](Self::content_digest) of this manifest.
    pub fn digest(&self) -> Checksum {
        Self::content_digest(&self.members, self.compression, self.level)
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn archive_id(&self) -> &ArchiveId {
        &self.archive_id
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn members(&self) -> &[FileEntry] {
        &self.members
    }

    pub fn total_uncompressed_size(&self) -> u64 {
        self.total_uncompressed_size
    }

    pub fn member(&self, logical_path: &Path) -> Option<&FileEntry> {
        self.members
            .binary_search_by(|m| m.logical_path.as_path().cmp(logical_path))
            .ok()
            .map(|index| &self.members[index])
    }

    /// Members that are fragments of `dataset`.
    pub fn fragments_of<'a>(&'a self, dataset: &'a Path) -> impl Iterator<Item = &'a FileEntry> + 'a {
        self.members
            .iter()
            .filter(move |m| m.fragment.as_ref().is_some_and(|f| f.dataset.as_path() == dataset))
    }

    /// Union of member tags.
    pub fn tags(&self) -> BTreeSet<Tag> {
        self.members.iter().flat_map(|m| m.tags.iter().cloned()).collect()
    }

    /// Span of member modification times.
    pub fn date_range(&self) -> Option<DateRange> {
        DateRange::spanning(self.members.iter().map(|m| m.modified_time))
    }

    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            archive_id: self.archive_id.clone(),
            created_at: self.created_at,
            compression: self.compression,
            member_count: self.members.len(),
            total_uncompressed_size: self.total_uncompressed_size,
            description: self.description.clone(),
        }
    }

    /// File name of the sidecar stored next to the container.
    pub fn sidecar_name(archive_id: &ArchiveId) -> String {
        format!("{archive_id}{SIDECAR_SUFFIX}")
    }

    /// Archive id encoded in a sidecar file name, if it is one.
    pub fn archive_id_from_sidecar(file_name: &str) -> Option<ArchiveId> {
        file_name.strip_suffix(SIDECAR_SUFFIX)?.parse().ok()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::Serialization)
    }

    /// Parse and validate a sidecar.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let header: VersionHeader =
            serde_json::from_slice(bytes).or_raise(|| ErrorKind::InvalidManifest("malformed JSON".to_string()))?;
        if header.format_version != MANIFEST_FORMAT_VERSION {
            exn::bail!(ErrorKind::UnsupportedVersion(header.format_version));
        }
        let manifest: Self = serde_json::from_slice(bytes)
            .or_raise(|| ErrorKind::InvalidManifest("unexpected manifest structure".to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FragmentRef;
    use crate::interval::Interval;
    use std::path::PathBuf;
    use time::macros::datetime;

    fn entry(path: &str, contents: &[u8], tags: &[&str]) -> FileEntry {
        FileEntry {
            logical_path: PathBuf::from(path),
            size: contents.len() as u64,
            checksum: Checksum::of(contents),
            modified_time: datetime!(2024-01-01 0:00 UTC),
            tags: tags.iter().map(|t| Tag::new(t)).collect(),
            fragment: None,
        }
    }

    fn manifest(members: Vec<FileEntry>) -> Result<ArchiveManifest> {
        let digest = ArchiveManifest::content_digest(&members, Compression::Gzip, CompressionLevel::Balanced);
        ArchiveManifest::new(
            ArchiveId::derive("exp01", &digest)?,
            datetime!(2024-06-01 12:00 UTC),
            Compression::Gzip,
            CompressionLevel::Balanced,
            Some("spin-up output".to_string()),
            members,
        )
    }

    #[test]
    fn test_new_sorts_and_totals() {
        let manifest = manifest(vec![
            entry("exp01/restart/fesom.nc", b"restart", &["restart"]),
            entry("exp01/log/run.log", b"log line", &["log"]),
        ])
        .unwrap();
        let paths: Vec<_> = manifest.members().iter().map(|m| m.logical_path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("exp01/log/run.log"), PathBuf::from("exp01/restart/fesom.nc")]);
        assert_eq!(manifest.total_uncompressed_size(), 15);
        assert_eq!(manifest.tags().len(), 2);
        assert!(manifest.member(Path::new("exp01/log/run.log")).is_some());
        assert!(manifest.member(Path::new("exp01/log/other.log")).is_none());
    }

    #[test]
    fn test_duplicate_members_rejected() {
        let err = manifest(vec![entry("a.nc", b"1", &[]), entry("a.nc", b"2", &[])]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidManifest(_)));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let err = manifest(vec![]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidManifest(_)));
    }

    #[test]
    fn test_unnormalized_path_rejected() {
        let err = manifest(vec![entry("exp01/./a.nc", b"1", &[])]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_fragment_length_must_match_size() {
        let mut member = entry("exp01/ocean.part0", b"0123456789", &[]);
        member.fragment = Some(FragmentRef::new("exp01/ocean.nc", Interval::new(0, 9)));
        let err = manifest(vec![member.clone()]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFragment(_)));

        member.fragment = Some(FragmentRef::new("exp01/ocean.nc", Interval::new(0, 10)));
        let manifest = manifest(vec![member]).unwrap();
        assert_eq!(manifest.fragments_of(Path::new("exp01/ocean.nc")).count(), 1);
        assert_eq!(manifest.fragments_of(Path::new("exp01/atmos.nc")).count(), 0);
    }

    #[test]
    fn test_sidecar_roundtrip() {
        let mut member = entry("exp01/ocean.part0", b"0123456789", &["outdata"]);
        member.fragment = Some(
            FragmentRef::new("exp01/ocean.nc", Interval::new(100, 110)).with_source_digest(Checksum::of(b"v1")),
        );
        let manifest = manifest(vec![member, entry("exp01/namelist.oce", b"&oce /", &["config", "input"])]).unwrap();
        let json = manifest.to_json().unwrap();
        assert_eq!(ArchiveManifest::from_json(&json).unwrap(), manifest);
        let text = String::from_utf8(json).unwrap();
        assert!(text.contains("\"created_at\": \"2024-06-01T12:00:00Z\""));
        assert!(text.contains("\"compression\": \"gzip\""));
    }

    #[test]
    fn test_sidecar_tampered_total_rejected() {
        let manifest = manifest(vec![entry("a.nc", b"abc", &[])]).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        value["total_uncompressed_size"] = serde_json::json!(99);
        let err = ArchiveManifest::from_json(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidManifest(_)));
    }

    #[test]
    fn test_sidecar_unsupported_version() {
        let err = ArchiveManifest::from_json(br#"{"format_version": 7}"#).unwrap_err();
        assert_eq!(*err, ErrorKind::UnsupportedVersion(7));
    }

    #[test]
    fn test_content_digest_ignores_member_order_and_tracks_codec() {
        let a = entry("a.nc", b"a", &[]);
        let b = entry("b.nc", b"b", &[]);
        let forward = ArchiveManifest::content_digest(&[a.clone(), b.clone()], Compression::Gzip, CompressionLevel::Fast);
        let reverse = ArchiveManifest::content_digest(&[b.clone(), a.clone()], Compression::Gzip, CompressionLevel::Fast);
        let other = ArchiveManifest::content_digest(&[a, b], Compression::Bzip2, CompressionLevel::Fast);
        assert_eq!(forward, reverse);
        assert_ne!(forward, other);
    }

    #[test]
    fn test_sidecar_names() {
        let id: ArchiveId = "exp01-0123456789abcdef".parse().unwrap();
        let name = ArchiveManifest::sidecar_name(&id);
        assert_eq!(name, "exp01-0123456789abcdef.manifest.json");
        assert_eq!(ArchiveManifest::archive_id_from_sidecar(&name), Some(id));
        assert_eq!(ArchiveManifest::archive_id_from_sidecar("exp01.tar.gz"), None);
    }

    #[test]
    fn test_date_range_spans_members() {
        let mut early = entry("a.nc", b"a", &[]);
        early.modified_time = datetime!(2023-01-01 0:00 UTC);
        let manifest = manifest(vec![early, entry("b.nc", b"b", &[])]).unwrap();
        let range = manifest.date_range().unwrap();
        assert_eq!(range.start, Some(datetime!(2023-01-01 0:00 UTC)));
        assert_eq!(range.end, Some(datetime!(2024-01-01 0:00 UTC)));
    }
}
