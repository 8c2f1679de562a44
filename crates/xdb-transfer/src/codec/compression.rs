//! Whole-stream compression with signature detection.

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::error::{DecodeError, DecodeErrorKind};
use crate::error::Result;

/// gzip member header.
pub const GZIP_SIGNATURE: &[u8] = &[0x1f, 0x8b];

/// bzip2 stream header.
pub const BZIP2_SIGNATURE: &[u8] = b"BZh";

/// Compression layer detected on (or applied to) a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    /// Detect the layer from the leading bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(GZIP_SIGNATURE) {
            Compression::Gzip
        } else if bytes.starts_with(BZIP2_SIGNATURE) {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// When the encoder compresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Compress frames larger than the threshold.
    #[default]
    Auto,
    Always,
    Never,
}

/// Compressor family used when compressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Gzip,
    Bzip2,
}

/// Encoder-side compression settings.
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub mode: CompressionMode,
    pub codec: Codec,
    /// Raw frame size above which `Auto` compresses.
    pub threshold_bytes: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            mode: CompressionMode::Auto,
            codec: Codec::Gzip,
            threshold_bytes: 1024 * 1024,
        }
    }
}

impl CompressionOptions {
    pub fn never() -> Self {
        Self {
            mode: CompressionMode::Never,
            ..Self::default()
        }
    }

    pub fn always(codec: Codec) -> Self {
        Self {
            mode: CompressionMode::Always,
            codec,
            ..Self::default()
        }
    }

    /// Which layer to apply to a raw frame of `raw_len` bytes.
    pub fn choose(&self, raw_len: usize) -> Compression {
        let compress = match self.mode {
            CompressionMode::Never => false,
            CompressionMode::Always => true,
            CompressionMode::Auto => raw_len > self.threshold_bytes,
        };
        match (compress, self.codec) {
            (false, _) => Compression::None,
            (true, Codec::Gzip) => Compression::Gzip,
            (true, Codec::Bzip2) => Compression::Bzip2,
        }
    }
}

/// Apply `layer` to a raw frame.
pub fn compress(raw: Vec<u8>, layer: Compression) -> Result<Vec<u8>> {
    match layer {
        Compression::None => Ok(raw),
        Compression::Gzip => {
            let mut enc = GzEncoder::new(
                Vec::with_capacity(raw.len() / 3),
                flate2::Compression::default(),
            );
            enc.write_all(&raw)?;
            Ok(enc.finish()?)
        }
        Compression::Bzip2 => {
            let mut enc = BzEncoder::new(
                Vec::with_capacity(raw.len() / 3),
                bzip2::Compression::default(),
            );
            enc.write_all(&raw)?;
            Ok(enc.finish()?)
        }
    }
}

/// Strip the compression layer, if any, returning the raw frame.
pub fn decompress(bytes: &[u8], layer: Compression) -> std::result::Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(bytes.len() * 3);
    let read = match layer {
        Compression::None => return Ok(bytes.to_vec()),
        Compression::Gzip => GzDecoder::new(bytes).read_to_end(&mut out),
        Compression::Bzip2 => BzDecoder::new(bytes).read_to_end(&mut out),
    };
    match read {
        Ok(_) => Ok(out),
        Err(e) => {
            let decompressed = out.len();
            Err(DecodeError::at(
                DecodeErrorKind::Decompression(e.to_string()),
                0,
                bytes,
            )
            .with_compression(layer, bytes.len(), Some(decompressed)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_signatures() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bzip2);
        assert_eq!(Compression::detect(b"XDB\x01"), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
    }

    #[test]
    fn test_choose_respects_mode_and_threshold() {
        let auto = CompressionOptions {
            threshold_bytes: 100,
            ..CompressionOptions::default()
        };
        assert_eq!(auto.choose(100), Compression::None);
        assert_eq!(auto.choose(101), Compression::Gzip);
        assert_eq!(CompressionOptions::never().choose(1 << 30), Compression::None);
        assert_eq!(
            CompressionOptions::always(Codec::Bzip2).choose(1),
            Compression::Bzip2
        );
    }

    #[test]
    fn test_compress_writes_signature() {
        let raw = b"XDB\x01hello hello hello".to_vec();
        let gz = compress(raw.clone(), Compression::Gzip).unwrap();
        assert_eq!(Compression::detect(&gz), Compression::Gzip);
        let bz = compress(raw.clone(), Compression::Bzip2).unwrap();
        assert_eq!(Compression::detect(&bz), Compression::Bzip2);
        assert_eq!(decompress(&gz, Compression::Gzip).unwrap(), raw);
        assert_eq!(decompress(&bz, Compression::Bzip2).unwrap(), raw);
    }

    #[test]
    fn test_corrupt_gzip_fails() {
        let raw = vec![7u8; 4096];
        let mut gz = compress(raw, Compression::Gzip).unwrap();
        let keep = gz.len() / 2;
        gz.truncate(keep);
        let err = decompress(&gz, Compression::Gzip).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::Decompression(_)));
        assert_eq!(err.compression, Compression::Gzip);
    }
}
