//! Typed decode failures with positional context.

use std::fmt;

use thiserror::Error;

use super::compression::Compression;

/// Bytes of raw input kept around the failing offset.
pub const SAMPLE_WINDOW: usize = 16;

/// What went wrong while decoding a batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Leading bytes are neither a compression signature nor the frame magic.
    BadMagic,
    UnsupportedVersion(u8),
    /// Needed more bytes than were left.
    Truncated { field: &'static str, needed: usize, available: usize },
    UnknownTypeTag(u8),
    UnknownValueTag(u8),
    InvalidUtf8 { field: &'static str },
    InvalidValue { field: &'static str, detail: String },
    /// Declared row count cannot be satisfied by the bytes present.
    RowCountMismatch { declared: u64, decoded: u64 },
    TrailingBytes(usize),
    Decompression(String),
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::BadMagic => write!(f, "unrecognized file signature"),
            DecodeErrorKind::UnsupportedVersion(v) => write!(f, "unsupported format version {}", v),
            DecodeErrorKind::Truncated {
                field,
                needed,
                available,
            } => write!(
                f,
                "truncated while reading {} (needed {} bytes, {} available)",
                field, needed, available
            ),
            DecodeErrorKind::UnknownTypeTag(t) => write!(f, "unknown column type tag 0x{:02x}", t),
            DecodeErrorKind::UnknownValueTag(t) => write!(f, "unknown value tag 0x{:02x}", t),
            DecodeErrorKind::InvalidUtf8 { field } => write!(f, "invalid UTF-8 in {}", field),
            DecodeErrorKind::InvalidValue { field, detail } => {
                write!(f, "invalid {}: {}", field, detail)
            }
            DecodeErrorKind::RowCountMismatch { declared, decoded } => write!(
                f,
                "row count mismatch: header declares {} rows, only {} present",
                declared, decoded
            ),
            DecodeErrorKind::TrailingBytes(n) => write!(f, "{} unexpected trailing bytes", n),
            DecodeErrorKind::Decompression(msg) => write!(f, "decompression failed: {}", msg),
        }
    }
}

/// A decode failure, carrying enough context to diagnose without rereading.
#[derive(Debug, Clone, Error)]
#[error("decode error at byte {offset}: {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,

    /// Offset into the (decompressed) frame.
    pub offset: usize,

    /// Up to [`SAMPLE_WINDOW`] bytes starting at `offset`, or the tail of the
    /// input when `offset` is at the end.
    pub sample: Vec<u8>,

    /// Size of the input as handed to the decoder.
    pub total_size: usize,

    pub compression: Compression,

    /// Size after decompression, when the input was compressed.
    pub decompressed_size: Option<usize>,
}

impl DecodeError {
    pub(crate) fn at(kind: DecodeErrorKind, offset: usize, frame: &[u8]) -> Self {
        Self {
            kind,
            offset,
            sample: sample_at(frame, offset),
            total_size: frame.len(),
            compression: Compression::None,
            decompressed_size: None,
        }
    }

    /// Record the outer compression layer once it is known.
    pub(crate) fn with_compression(
        mut self,
        compression: Compression,
        total_size: usize,
        decompressed_size: Option<usize>,
    ) -> Self {
        self.compression = compression;
        self.total_size = total_size;
        self.decompressed_size = decompressed_size;
        self
    }

    /// Hex rendering of the sample bytes, e.g. `58 44 42 01`.
    pub fn sample_hex(&self) -> String {
        self.sample
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn sample_at(frame: &[u8], offset: usize) -> Vec<u8> {
    if frame.is_empty() {
        return Vec::new();
    }
    let start = if offset >= frame.len() {
        frame.len().saturating_sub(SAMPLE_WINDOW)
    } else {
        offset
    };
    let end = (start + SAMPLE_WINDOW).min(frame.len());
    frame[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_at_offset() {
        let frame: Vec<u8> = (0u8..40).collect();
        let err = DecodeError::at(DecodeErrorKind::UnknownValueTag(9), 10, &frame);
        assert_eq!(err.sample, (10u8..26).collect::<Vec<_>>());
        assert_eq!(err.total_size, 40);
    }

    #[test]
    fn test_sample_at_end_shows_tail() {
        let frame: Vec<u8> = (0u8..20).collect();
        let err = DecodeError::at(
            DecodeErrorKind::Truncated {
                field: "row count",
                needed: 8,
                available: 0,
            },
            20,
            &frame,
        );
        assert_eq!(err.sample, (4u8..20).collect::<Vec<_>>());
        assert!(err.to_string().contains("byte 20"));
        assert!(err.to_string().contains("row count"));
    }

    #[test]
    fn test_sample_hex() {
        let err = DecodeError::at(DecodeErrorKind::BadMagic, 0, b"XDB\x01");
        assert_eq!(err.sample_hex(), "58 44 42 01");
    }
}
