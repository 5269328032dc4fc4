use crate::Compression;
use crate::error::{Error, ErrorKind};
use std::str::FromStr;

/// Leading bytes of each codec's stream, checked in order.
fn signatures() -> Vec<(&'static [u8], Compression)> {
    let mut table: Vec<(&'static [u8], Compression)> = Vec::new();
    table.push((b"BZh", Compression::Bzip2));
    table.push((&[0x1F, 0x8B], Compression::Gzip));
    #[cfg(feature = "xz")]
    table.push((&[0xFD, b'7', b'z', b'X', b'Z', 0x00], Compression::Xz));
    #[cfg(feature = "zstd")]
    table.push((&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd));
    table
}

impl FromStr for Compression {
    type Err = Error;

    /// Accepts the short names written to manifests and configuration files,
    /// plus the usual file-extension spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let compression = match name.as_str() {
            "none" => Compression::None,
            "bzip2" | "bz2" => Compression::Bzip2,
            "gzip" | "gz" => Compression::Gzip,
            "xz" | "lzma" | "zstd" | "zst" => return enabled(&name),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        };
        Ok(compression)
    }
}

/// Codecs that exist but may be compiled out.
fn enabled(name: &str) -> Result<Compression, Error> {
    match name {
        #[cfg(feature = "xz")]
        "xz" | "lzma" => Ok(Compression::Xz),
        #[cfg(feature = "zstd")]
        "zstd" | "zst" => Ok(Compression::Zstd),
        _ => exn::bail!(ErrorKind::DisabledFormat(name.to_string())),
    }
}

impl From<&[u8]> for Compression {
    fn from(value: &[u8]) -> Self {
        Compression::from_magic_bytes(value)
    }
}

impl Compression {
    /// Detect compression from the first bytes of a stream.
    ///
    /// Plain tar streams, unknown formats and inputs too short to carry a
    /// signature all come back as [`None`](Self::None).
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Self {
        signatures()
            .into_iter()
            .find(|(magic, _)| bytes.starts_with(magic))
            .map_or(Compression::None, |(_, compression)| compression)
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use crate::error::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case("none", Compression::None)]
    #[case("bzip2", Compression::Bzip2)]
    #[case(" GZIP ", Compression::Gzip)]
    #[case("gz", Compression::Gzip)]
    #[cfg_attr(feature = "xz", case("lzma", Compression::Xz))]
    #[cfg_attr(feature = "zstd", case("zst", Compression::Zstd))]
    fn test_from_str(#[case] name: &str, #[case] expected: Compression) {
        assert_eq!(name.parse::<Compression>().unwrap(), expected);
    }

    #[rstest]
    #[case("lz4")]
    #[case("brotli")]
    #[case("")]
    fn test_from_str_unsupported(#[case] name: &str) {
        let err = name.parse::<Compression>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[rstest]
    #[case(b"CDF\x01", Compression::None)]
    #[case(b"", Compression::None)]
    #[case(b"BZ", Compression::None)]
    #[case(b"BZh91AY&SY", Compression::Bzip2)]
    #[case(&[0x1F, 0x8B, 0x08, 0x00], Compression::Gzip)]
    #[cfg_attr(feature = "xz", case(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00], Compression::Xz))]
    #[cfg_attr(feature = "zstd", case(&[0x28, 0xB5, 0x2F, 0xFD, 0x00], Compression::Zstd))]
    fn test_from_magic_bytes(#[case] bytes: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::from_magic_bytes(bytes), expected);
        assert_eq!(Compression::from(bytes), expected);
    }

    #[test]
    fn test_detection_agrees_with_encoders() {
        for compression in [Compression::Bzip2, Compression::Gzip] {
            let mut encoder = compression.encoder(Vec::new(), crate::CompressionLevel::Fast).unwrap();
            std::io::Write::write_all(&mut encoder, b"ocean output").unwrap();
            let encoded = encoder.finish().unwrap();
            assert_eq!(Compression::from_magic_bytes(&encoded), compression);
        }
    }
}
