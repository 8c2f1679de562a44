//! Batch codec: one table chunk to and from the `.bin` file format.
//!
//! The write path builds a raw frame ([`frame`]) and optionally passes it
//! through gzip or bzip2 ([`compression`]). The read path sniffs the leading
//! bytes, decompresses in memory when a signature is present, and parses the
//! frame. Decoding never returns partial rows: any inconsistency becomes a
//! [`DecodeError`] with the byte offset and a sample of the raw bytes.

pub mod compression;
pub mod error;
pub mod frame;

use std::path::Path;

pub use compression::{Codec, Compression, CompressionMode, CompressionOptions};
pub use error::{DecodeError, DecodeErrorKind};
pub use frame::{ColumnHeader, FrameHeader, FORMAT_VERSION};

use crate::core::schema::Table;
use crate::core::value::Row;
use crate::error::Result;

/// Output of [`encode_batch`].
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub bytes: Vec<u8>,
    /// Size of the raw frame before compression.
    pub raw_size: usize,
    pub compression: Compression,
}

/// Output of [`decode_batch`].
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    pub header: FrameHeader,
    pub rows: Vec<Row>,
    pub compression: Compression,
    /// Size of the input bytes.
    pub file_size: usize,
    /// Size of the raw frame when the input was compressed.
    pub decompressed_size: Option<usize>,
}

/// Encode one batch of `table`'s rows.
pub fn encode_batch(table: &Table, rows: &[Row], options: &CompressionOptions) -> Result<EncodedBatch> {
    let columns: Vec<ColumnHeader> = table.columns.iter().map(ColumnHeader::from).collect();
    encode_rows(&table.schema, &table.name, &columns, rows, options)
}

/// Encode rows against an explicit column list.
pub fn encode_rows(
    schema: &str,
    table: &str,
    columns: &[ColumnHeader],
    rows: &[Row],
    options: &CompressionOptions,
) -> Result<EncodedBatch> {
    let raw = frame::encode_frame(schema, table, columns, rows)?;
    let raw_size = raw.len();
    let compression = options.choose(raw_size);
    let bytes = compression::compress(raw, compression)?;
    Ok(EncodedBatch {
        bytes,
        raw_size,
        compression,
    })
}

/// Strip any compression layer, tagging decode errors with the layer info.
fn unwrap_layer(bytes: &[u8]) -> std::result::Result<(Vec<u8>, Compression), DecodeError> {
    let compression = Compression::detect(bytes);
    let raw = compression::decompress(bytes, compression)?;
    Ok((raw, compression))
}

fn annotate(err: DecodeError, bytes: &[u8], compression: Compression, raw_len: usize) -> DecodeError {
    let decompressed = compression.is_compressed().then_some(raw_len);
    err.with_compression(compression, bytes.len(), decompressed)
}

/// Decode a complete batch, detecting compression automatically.
pub fn decode_batch(bytes: &[u8]) -> std::result::Result<DecodedBatch, DecodeError> {
    let (raw, compression) = unwrap_layer(bytes)?;
    let (header, rows) =
        frame::decode_frame(&raw).map_err(|e| annotate(e, bytes, compression, raw.len()))?;
    Ok(DecodedBatch {
        header,
        rows,
        compression,
        file_size: bytes.len(),
        decompressed_size: compression.is_compressed().then_some(raw.len()),
    })
}

/// Decode only the header (schema, table, columns, row count).
pub fn read_header(
    bytes: &[u8],
) -> std::result::Result<(FrameHeader, Compression, Option<usize>), DecodeError> {
    let (raw, compression) = unwrap_layer(bytes)?;
    let header =
        frame::decode_header(&raw).map_err(|e| annotate(e, bytes, compression, raw.len()))?;
    Ok((
        header,
        compression,
        compression.is_compressed().then_some(raw.len()),
    ))
}

/// Read and decode a batch file.
pub fn read_batch_file(path: &Path) -> Result<DecodedBatch> {
    let bytes = std::fs::read(path)?;
    Ok(decode_batch(&bytes)?)
}

/// Write bytes atomically: `<path>.tmp` then rename.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Metadata serialization path shared by the manifest and `table_metadata/`.
pub fn encode_table_metadata(table: &Table) -> Result<String> {
    Ok(serde_json::to_string_pretty(table)?)
}

pub fn decode_table_metadata(json: &str) -> Result<Table> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{Column, ForeignKey, FkAction, Index, LogicalType};
    use crate::core::value::SqlValue;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn wide_table() -> Table {
        let mut t = Table::new("dbo", "Wide");
        let types = vec![
            LogicalType::Boolean,
            LogicalType::TinyInt,
            LogicalType::SmallInt,
            LogicalType::Int,
            LogicalType::BigInt,
            LogicalType::Real,
            LogicalType::Double,
            LogicalType::Decimal {
                precision: 38,
                scale: 10,
            },
            LogicalType::text(),
            LogicalType::Binary { max_length: Some(16) },
            LogicalType::Date,
            LogicalType::Guid,
            LogicalType::Other {
                name: "xml".into(),
            },
        ];
        t.columns = types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| Column::new(format!("c{}", i), ty, i as u32 + 1))
            .collect();
        t
    }

    fn boundary_rows() -> Vec<Row> {
        let max = vec![
            SqlValue::Bool(true),
            SqlValue::U8(u8::MAX),
            SqlValue::I16(i16::MIN),
            SqlValue::I32(i32::MAX),
            SqlValue::I64(i64::MIN),
            SqlValue::F32(f32::MAX),
            SqlValue::F64(-0.0),
            SqlValue::Decimal(Decimal::MAX),
            SqlValue::String("multi-byte: ß ☃ 𝄞".into()),
            SqlValue::Bytes(vec![0, 1, 2, 255]),
            SqlValue::Date(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()),
            SqlValue::Guid(Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)),
            SqlValue::String("<a/>".into()),
        ];
        let nulls = vec![SqlValue::Null; max.len()];
        let empties = vec![
            SqlValue::Bool(false),
            SqlValue::U8(0),
            SqlValue::I16(0),
            SqlValue::I32(i32::MIN),
            SqlValue::I64(0),
            SqlValue::F32(f32::MIN_POSITIVE),
            SqlValue::F64(f64::MAX),
            SqlValue::Decimal(Decimal::MIN),
            SqlValue::String(String::new()),
            SqlValue::Bytes(Vec::new()),
            SqlValue::Date(NaiveDate::from_ymd_opt(1, 1, 1).unwrap()),
            SqlValue::Guid(Uuid::nil()),
            SqlValue::String(String::new()),
        ];
        vec![max, nulls, empties]
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let table = wide_table();
        let rows = boundary_rows();
        let enc = encode_batch(&table, &rows, &CompressionOptions::never()).unwrap();
        assert_eq!(enc.compression, Compression::None);
        assert_eq!(enc.bytes.len(), enc.raw_size);

        let dec = decode_batch(&enc.bytes).unwrap();
        assert_eq!(dec.rows, rows);
        assert_eq!(dec.header.columns.len(), table.columns.len());
        assert_eq!(dec.compression, Compression::None);
        assert_eq!(dec.decompressed_size, None);
    }

    #[test]
    fn test_compression_is_transparent() {
        let table = wide_table();
        let rows: Vec<Row> = boundary_rows().into_iter().cycle().take(300).collect();

        let plain = decode_batch(&encode_batch(&table, &rows, &CompressionOptions::never()).unwrap().bytes)
            .unwrap();
        for codec in [Codec::Gzip, Codec::Bzip2] {
            let enc = encode_batch(&table, &rows, &CompressionOptions::always(codec)).unwrap();
            let dec = decode_batch(&enc.bytes).unwrap();
            assert!(dec.compression.is_compressed());
            assert_eq!(dec.decompressed_size, Some(enc.raw_size));
            assert_eq!(dec.rows, plain.rows);
            assert_eq!(dec.header, plain.header);
        }
    }

    #[test]
    fn test_auto_mode_uses_threshold() {
        let table = wide_table();
        let rows = boundary_rows();
        let small = CompressionOptions {
            threshold_bytes: 1 << 20,
            ..CompressionOptions::default()
        };
        assert_eq!(
            encode_batch(&table, &rows, &small).unwrap().compression,
            Compression::None
        );
        let tiny = CompressionOptions {
            threshold_bytes: 10,
            ..CompressionOptions::default()
        };
        assert_eq!(
            encode_batch(&table, &rows, &tiny).unwrap().compression,
            Compression::Gzip
        );
    }

    #[test]
    fn test_read_header_of_compressed_file() {
        let table = wide_table();
        let enc = encode_batch(&table, &boundary_rows(), &CompressionOptions::always(Codec::Gzip))
            .unwrap();
        let (header, compression, decompressed) = read_header(&enc.bytes).unwrap();
        assert_eq!(header.table, "Wide");
        assert_eq!(header.row_count, 3);
        assert_eq!(compression, Compression::Gzip);
        assert_eq!(decompressed, Some(enc.raw_size));
    }

    #[test]
    fn test_truncated_file_never_yields_zero_rows() {
        let table = wide_table();
        let enc = encode_batch(&table, &boundary_rows(), &CompressionOptions::never()).unwrap();
        let header_len = read_header(&enc.bytes).unwrap().0.header_len;
        for cut in [0, 1, 3, 4, 9, header_len - 8, header_len - 1] {
            let err = decode_batch(&enc.bytes[..cut]).unwrap_err();
            assert!(err.offset <= cut);
            assert_eq!(err.total_size, cut);
        }
    }

    #[test]
    fn test_file_helpers_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbo_Wide.bin");
        let table = wide_table();
        let enc = encode_batch(&table, &boundary_rows(), &CompressionOptions::default()).unwrap();
        write_file_atomic(&path, &enc.bytes).unwrap();
        assert!(!dir.path().join("dbo_Wide.bin.tmp").exists());
        let dec = read_batch_file(&path).unwrap();
        assert_eq!(dec.rows.len(), 3);
    }

    #[test]
    fn test_table_metadata_roundtrip() {
        let mut table = wide_table();
        table.primary_key = Some(vec!["c3".into()]);
        table.indexes.push(Index {
            name: "IX_c4".into(),
            columns: vec!["c4".into()],
            is_unique: true,
        });
        table.foreign_keys.push(ForeignKey {
            name: "FK_self".into(),
            columns: vec!["c4".into()],
            ref_schema: "dbo".into(),
            ref_table: "Wide".into(),
            ref_columns: vec!["c3".into()],
            on_delete: FkAction::SetNull,
            on_update: FkAction::Cascade,
        });
        table.columns[3].default_value = Some("((0))".into());
        let json = encode_table_metadata(&table).unwrap();
        assert_eq!(decode_table_metadata(&json).unwrap(), table);
    }
}
