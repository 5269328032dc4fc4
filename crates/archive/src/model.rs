//! Value types shared by every archive component.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// A semantic label attached to a file ("input", "restart", "ocean").
///
/// Tags are trimmed and lower-cased on construction so that rule tables and
/// filters compare case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
impl From<Tag> for String {
    fn from(value: Tag) -> Self {
        value.0
    }
}
impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// Lower-case hex BLAKE3 digest.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    pub const HEX_LEN: usize = 64;

    /// Digest a complete byte slice.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        blake3::hash(bytes.as_ref()).into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` hex characters, for display and identifiers.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(Self::HEX_LEN)]
    }
}
impl From<blake3::Hash> for Checksum {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }
}
impl TryFrom<String> for Checksum {
    type Error = ErrorKind;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == Self::HEX_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        match valid {
            true => Ok(Self(value)),
            false => Err(ErrorKind::InvalidChecksum(value)),
        }
    }
}
impl FromStr for Checksum {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::try_from(s.to_string())?)
    }
}
impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}
impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// Identifier of exactly one physical container.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveId(String);

impl ArchiveId {
    /// Length of the digest suffix appended by [`derive`](Self::derive).
    pub const DIGEST_LEN: usize = 16;

    /// Build `<name>-<digest prefix>`, replacing characters that are not
    /// allowed in identifiers with `_`.
    pub fn derive(name: &str, digest: &Checksum) -> Result<Self, Error> {
        let name: String = name
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let id = match name.is_empty() {
            true => digest.short(Self::DIGEST_LEN).to_string(),
            false => format!("{name}-{}", digest.short(Self::DIGEST_LEN)),
        };
        id.parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl TryFrom<String> for ArchiveId {
    type Error = ErrorKind;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        match valid {
            true => Ok(Self(value)),
            false => Err(ErrorKind::InvalidArchiveId(value)),
        }
    }
}
impl FromStr for ArchiveId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::try_from(s.to_string())?)
    }
}
impl From<ArchiveId> for String {
    fn from(value: ArchiveId) -> Self {
        value.0
    }
}
impl Display for ArchiveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}
impl AsRef<str> for ArchiveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_tag_normalized() {
        assert_eq!(Tag::new("  Restart "), Tag::from("restart"));
        let tag: Tag = serde_json::from_str("\"OCEAN\"").unwrap();
        assert_eq!(tag.as_str(), "ocean");
    }

    #[test]
    fn test_checksum_of() {
        let checksum = Checksum::of(b"restart");
        assert_eq!(checksum.as_str().len(), Checksum::HEX_LEN);
        assert_eq!(checksum, checksum.as_str().parse().unwrap());
        assert_eq!(checksum.short(8).len(), 8);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("G000000000000000000000000000000000000000000000000000000000000000")]
    fn test_checksum_invalid(#[case] input: &str) {
        let err = input.parse::<Checksum>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidChecksum(_)));
    }

    #[rstest]
    #[case("exp01-0123abcd", true)]
    #[case("run_2024", true)]
    #[case("", false)]
    #[case("exp 01", false)]
    #[case("exp/01", false)]
    #[case("exp.01", false)]
    fn test_archive_id_validation(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(input.parse::<ArchiveId>().is_ok(), valid);
    }

    #[test]
    fn test_archive_id_derive() {
        let digest = Checksum::of(b"content");
        let id = ArchiveId::derive("exp01 spinup", &digest).unwrap();
        assert_eq!(id.as_str(), format!("exp01_spinup-{}", digest.short(16)));
        let id = ArchiveId::derive("", &digest).unwrap();
        assert_eq!(id.as_str(), digest.short(16));
    }

    #[test]
    fn test_archive_id_rejected_during_deserialization() {
        assert!(serde_json::from_str::<ArchiveId>("\"../escape\"").is_err());
    }
}
