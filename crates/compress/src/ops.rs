//! Compression Operations

use crate::error::{ErrorKind, Result};
use crate::{Compression, CompressionLevel};
use bzip2::{read::BzDecoder, write::BzEncoder};
use exn::ResultExt;
use flate2::{read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
#[cfg(feature = "xz")]
use xz2::{read::XzDecoder, write::XzEncoder};
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

/// A streaming encoder that must be explicitly finished.
///
/// Unlike a boxed [`Write`], finishing hands back the inner writer so that
/// callers can flush or close it and observe any trailing error. Dropping an
/// unfinished encoder leaves a truncated stream behind.
pub enum Encoder<W: Write> {
    Plain(W),
    Bzip2(BzEncoder<W>),
    Gzip(GzEncoder<W>),
    #[cfg(feature = "xz")]
    Xz(XzEncoder<W>),
    #[cfg(feature = "zstd")]
    Zstd(ZstdEncoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    /// Write the codec trailer and return the inner writer.
    pub fn finish(self) -> Result<W> {
        match self {
            Encoder::Plain(writer) => Ok(writer),
            Encoder::Bzip2(encoder) => encoder.finish().or_raise(|| ErrorKind::Io),
            Encoder::Gzip(encoder) => encoder.finish().or_raise(|| ErrorKind::Io),
            #[cfg(feature = "xz")]
            Encoder::Xz(encoder) => encoder.finish().or_raise(|| ErrorKind::Io),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder.finish().or_raise(|| ErrorKind::Io),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encoder::Plain(writer) => writer.write(buf),
            Encoder::Bzip2(encoder) => encoder.write(buf),
            Encoder::Gzip(encoder) => encoder.write(buf),
            #[cfg(feature = "xz")]
            Encoder::Xz(encoder) => encoder.write(buf),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Plain(writer) => writer.flush(),
            Encoder::Bzip2(encoder) => encoder.flush(),
            Encoder::Gzip(encoder) => encoder.flush(),
            #[cfg(feature = "xz")]
            Encoder::Xz(encoder) => encoder.flush(),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder.flush(),
        }
    }
}

impl Compression {
    /// Wrap a reader with the appropriate decompression layer.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::io::{Cursor, Read, Write};
    /// use tellus_compress::{Compression, CompressionLevel};
    ///
    /// let mut encoder = Compression::Bzip2.encoder(Vec::new(), CompressionLevel::Max).unwrap();
    /// encoder.write_all(b"restart").unwrap();
    /// let compressed = encoder.finish().unwrap();
    /// let mut reader = Compression::Bzip2.wrap_reader(Cursor::new(compressed)).unwrap();
    /// let mut out = String::new();
    /// reader.read_to_string(&mut out).unwrap();
    /// assert_eq!(out, "restart");
    /// ```
    pub fn wrap_reader<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            #[cfg(feature = "xz")]
            Compression::Xz => Box::new(XzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::Encoder)?),
        })
    }

    /// Wrap a writer with the appropriate compression layer at `level`.
    ///
    /// [`CompressionLevel::None`] always produces a plain pass-through
    /// encoder, so the output is uncompressed regardless of `self`.
    pub fn encoder<W: Write>(&self, writer: W, level: CompressionLevel) -> Result<Encoder<W>> {
        if level == CompressionLevel::None {
            return Ok(Encoder::Plain(writer));
        }
        Ok(match self {
            Compression::None => Encoder::Plain(writer),
            Compression::Bzip2 => Encoder::Bzip2(BzEncoder::new(writer, level.bzip2())),
            Compression::Gzip => Encoder::Gzip(GzEncoder::new(writer, level.gzip())),
            #[cfg(feature = "xz")]
            Compression::Xz => Encoder::Xz(XzEncoder::new(writer, level.xz())),
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                Encoder::Zstd(ZstdEncoder::new(writer, level.zstd()).or_raise(|| ErrorKind::Encoder)?)
            },
        })
    }

    /// The format actually written for `level`.
    ///
    /// Archives written with [`CompressionLevel::None`] are recorded as
    /// uncompressed so that readers never try to decode them.
    #[must_use]
    pub fn effective(&self, level: CompressionLevel) -> Compression {
        match level {
            CompressionLevel::None => Compression::None,
            _ => *self,
        }
    }
}
