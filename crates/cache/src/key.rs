use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;

const DEFAULT_LABEL: &str = "data";

/// Identity of one cached file.
///
/// The digest is BLAKE3 over length-prefixed, tagged components, so that
/// `("a", "bc")` and `("ab", "c")` never collide. The label only names the
/// file on disk, but takes part in the digest as well.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
    label: String,
}

impl CacheKey {
    /// ```
    /// use tellus_cache::CacheKey;
    ///
    /// let key = CacheKey::new("ocean.nc", [("dataset", "exp01/ocean.nc"), ("range", "0-100")]);
    /// assert_eq!(key.digest().len(), 64);
    /// assert!(key.relative_path().ends_with("ocean.nc"));
    /// ```
    pub fn new<'a, I, B>(label: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, B)>,
        B: AsRef<[u8]>,
    {
        let label = sanitize_label(label);
        let mut hasher = blake3::Hasher::new();
        update_tagged(&mut hasher, "label", label.as_bytes());
        for (tag, bytes) in parts {
            update_tagged(&mut hasher, tag, bytes.as_ref());
        }
        Self {
            digest: hasher.finalize().to_hex().to_string(),
            label,
        }
    }

    pub(crate) fn from_stored(digest: String, label: String) -> Self {
        Self { digest, label }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Directory holding the entry, relative to the cache root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.digest[..2]).join(&self.digest)
    }

    /// `<digest[0..2]>/<digest>/<label>`, relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        self.relative_dir().join(&self.label)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", &self.digest[..12], self.label)
    }
}

fn update_tagged(hasher: &mut blake3::Hasher, tag: &str, bytes: &[u8]) {
    hasher.update(&(tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Reduce a label to a single safe file name component.
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| match c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            true => c,
            false => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    match cleaned.is_empty() {
        true => DEFAULT_LABEL.to_string(),
        false => cleaned.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ocean.nc", "ocean.nc")]
    #[case("exp01/ocean.nc", "exp01_ocean.nc")]
    #[case("../../etc/passwd", "_.._etc_passwd")]
    #[case("..", "data")]
    #[case("", "data")]
    fn test_sanitize_label(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_label(input), expected);
    }

    #[test]
    fn test_components_are_framed() {
        let a = CacheKey::new("x", [("a", "bc")]);
        let b = CacheKey::new("x", [("ab", "c")]);
        assert_ne!(a, b);
        assert_eq!(a, CacheKey::new("x", [("a", "bc")]));
    }

    #[test]
    fn test_layout() {
        let key = CacheKey::new("ocean.nc", [("dataset", "exp01/ocean.nc")]);
        let path = key.relative_path();
        let parts: Vec<_> = path.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts[0], key.digest()[..2]);
        assert_eq!(parts[1], key.digest());
        assert_eq!(parts[2], "ocean.nc");
    }
}
