//! Raw (uncompressed) batch frame.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! "XDB" version:u8
//! schema:str table:str
//! column_count:u32 { name:str type:tag+params nullable:u8 }*
//! row_count:u64
//! { value }* (row-major, column_count values per row)
//! ```
//!
//! `str` is a u32 byte length followed by UTF-8. Each value is a tag byte
//! (0 = NULL) followed by the tag's fixed-width or length-prefixed payload.
//!
//! Temporal values use one fixed policy in both directions: naive timestamps
//! are stored as their wall-clock reading interpreted as UTC, offset
//! timestamps as the UTC instant plus the original offset in seconds.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::error::{DecodeError, DecodeErrorKind};
use crate::core::schema::{Column, LogicalType};
use crate::core::value::{Row, SqlValue};
use crate::error::{MigrateError, Result};

/// Frame magic. Cannot collide with the gzip or bzip2 signatures.
pub const FRAME_MAGIC: &[u8] = b"XDB";

/// Current encoder version.
pub const FORMAT_VERSION: u8 = 1;

const NONE_LENGTH: u32 = u32::MAX;

// Column type tags
const T_BOOLEAN: u8 = 0x01;
const T_TINYINT: u8 = 0x02;
const T_SMALLINT: u8 = 0x03;
const T_INT: u8 = 0x04;
const T_BIGINT: u8 = 0x05;
const T_REAL: u8 = 0x06;
const T_DOUBLE: u8 = 0x07;
const T_DECIMAL: u8 = 0x08;
const T_STRING: u8 = 0x09;
const T_BINARY: u8 = 0x0A;
const T_DATE: u8 = 0x0B;
const T_TIME: u8 = 0x0C;
const T_DATETIME: u8 = 0x0D;
const T_DATETIMEOFFSET: u8 = 0x0E;
const T_GUID: u8 = 0x0F;
const T_OTHER: u8 = 0x10;

// Value tags
const V_NULL: u8 = 0x00;
const V_BOOL: u8 = 0x01;
const V_U8: u8 = 0x02;
const V_I16: u8 = 0x03;
const V_I32: u8 = 0x04;
const V_I64: u8 = 0x05;
const V_F32: u8 = 0x06;
const V_F64: u8 = 0x07;
const V_DECIMAL: u8 = 0x08;
const V_STRING: u8 = 0x09;
const V_BYTES: u8 = 0x0A;
const V_DATE: u8 = 0x0B;
const V_TIME: u8 = 0x0C;
const V_DATETIME: u8 = 0x0D;
const V_DATETIMEOFFSET: u8 = 0x0E;
const V_GUID: u8 = 0x0F;

/// Column entry stored in every frame so files are self-describing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl From<&Column> for ColumnHeader {
    fn from(col: &Column) -> Self {
        Self {
            name: col.name.clone(),
            logical_type: col.logical_type.clone(),
            nullable: col.is_nullable,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnHeader>,
    pub row_count: u64,
    /// Offset of the first row.
    pub header_len: usize,
}

/// Encode a batch into a raw frame.
pub fn encode_frame(
    schema: &str,
    table: &str,
    columns: &[ColumnHeader],
    rows: &[Row],
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(256 + rows.len() * columns.len().max(1) * 8);

    buf.put_slice(FRAME_MAGIC);
    buf.put_u8(FORMAT_VERSION);
    put_str(&mut buf, schema)?;
    put_str(&mut buf, table)?;

    buf.put_u32(len_u32(columns.len(), "column count")?);
    for col in columns {
        put_str(&mut buf, &col.name)?;
        put_type(&mut buf, &col.logical_type)?;
        buf.put_u8(col.nullable as u8);
    }

    buf.put_u64(rows.len() as u64);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(MigrateError::transfer(
                format!("{}.{}", schema, table),
                format!(
                    "row {} has {} values but {} columns are declared",
                    i,
                    row.len(),
                    columns.len()
                ),
            ));
        }
        for value in row {
            put_value(&mut buf, value)?;
        }
    }

    Ok(buf.to_vec())
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|n| *n != NONE_LENGTH)
        .ok_or_else(|| MigrateError::Validation(format!("{} too large to encode: {}", what, len)))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    buf.put_u32(len_u32(s.len(), "string")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_opt_len(buf: &mut BytesMut, len: Option<u32>) {
    buf.put_u32(len.unwrap_or(NONE_LENGTH));
}

fn put_type(buf: &mut BytesMut, ty: &LogicalType) -> Result<()> {
    match ty {
        LogicalType::Boolean => buf.put_u8(T_BOOLEAN),
        LogicalType::TinyInt => buf.put_u8(T_TINYINT),
        LogicalType::SmallInt => buf.put_u8(T_SMALLINT),
        LogicalType::Int => buf.put_u8(T_INT),
        LogicalType::BigInt => buf.put_u8(T_BIGINT),
        LogicalType::Real => buf.put_u8(T_REAL),
        LogicalType::Double => buf.put_u8(T_DOUBLE),
        LogicalType::Decimal { precision, scale } => {
            buf.put_u8(T_DECIMAL);
            buf.put_u8(*precision);
            buf.put_u8(*scale);
        }
        LogicalType::String {
            max_length,
            unicode,
        } => {
            buf.put_u8(T_STRING);
            put_opt_len(buf, *max_length);
            buf.put_u8(*unicode as u8);
        }
        LogicalType::Binary { max_length } => {
            buf.put_u8(T_BINARY);
            put_opt_len(buf, *max_length);
        }
        LogicalType::Date => buf.put_u8(T_DATE),
        LogicalType::Time => buf.put_u8(T_TIME),
        LogicalType::DateTime => buf.put_u8(T_DATETIME),
        LogicalType::DateTimeOffset => buf.put_u8(T_DATETIMEOFFSET),
        LogicalType::Guid => buf.put_u8(T_GUID),
        LogicalType::Other { name } => {
            buf.put_u8(T_OTHER);
            put_str(buf, name)?;
        }
    }
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &SqlValue) -> Result<()> {
    match value {
        SqlValue::Null => buf.put_u8(V_NULL),
        SqlValue::Bool(b) => {
            buf.put_u8(V_BOOL);
            buf.put_u8(*b as u8);
        }
        SqlValue::U8(v) => {
            buf.put_u8(V_U8);
            buf.put_u8(*v);
        }
        SqlValue::I16(v) => {
            buf.put_u8(V_I16);
            buf.put_i16(*v);
        }
        SqlValue::I32(v) => {
            buf.put_u8(V_I32);
            buf.put_i32(*v);
        }
        SqlValue::I64(v) => {
            buf.put_u8(V_I64);
            buf.put_i64(*v);
        }
        SqlValue::F32(v) => {
            buf.put_u8(V_F32);
            buf.put_u32(v.to_bits());
        }
        SqlValue::F64(v) => {
            buf.put_u8(V_F64);
            buf.put_u64(v.to_bits());
        }
        SqlValue::Decimal(d) => {
            buf.put_u8(V_DECIMAL);
            buf.put_slice(&d.serialize());
        }
        SqlValue::String(s) => {
            buf.put_u8(V_STRING);
            put_str(buf, s)?;
        }
        SqlValue::Bytes(b) => {
            buf.put_u8(V_BYTES);
            buf.put_u32(len_u32(b.len(), "binary value")?);
            buf.put_slice(b);
        }
        SqlValue::Date(d) => {
            buf.put_u8(V_DATE);
            buf.put_i32(d.num_days_from_ce());
        }
        SqlValue::Time(t) => {
            buf.put_u8(V_TIME);
            buf.put_u32(t.num_seconds_from_midnight());
            buf.put_u32(t.nanosecond());
        }
        SqlValue::DateTime(dt) => {
            let utc = dt.and_utc();
            buf.put_u8(V_DATETIME);
            buf.put_i64(utc.timestamp());
            buf.put_u32(utc.timestamp_subsec_nanos());
        }
        SqlValue::DateTimeOffset(dto) => {
            buf.put_u8(V_DATETIMEOFFSET);
            buf.put_i64(dto.timestamp());
            buf.put_u32(dto.timestamp_subsec_nanos());
            buf.put_i32(dto.offset().local_minus_utc());
        }
        SqlValue::Guid(u) => {
            buf.put_u8(V_GUID);
            buf.put_slice(u.as_bytes());
        }
    }
    Ok(())
}

/// Bounds-checked reader that always knows its offset.
struct FrameReader<'a> {
    frame: &'a [u8],
    buf: &'a [u8],
}

type DecodeResult<T> = std::result::Result<T, DecodeError>;

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self { frame, buf: frame }
    }

    fn offset(&self) -> usize {
        self.frame.len() - self.buf.remaining()
    }

    fn fail(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError::at(kind, self.offset(), self.frame)
    }

    fn need(&self, n: usize, field: &'static str) -> DecodeResult<()> {
        if self.buf.remaining() < n {
            return Err(self.fail(DecodeErrorKind::Truncated {
                field,
                needed: n,
                available: self.buf.remaining(),
            }));
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> DecodeResult<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> DecodeResult<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &'static str) -> DecodeResult<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, n: usize, field: &'static str) -> DecodeResult<&'a [u8]> {
        self.need(n, field)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self, field: &'static str) -> DecodeResult<String> {
        let len = self.u32(field)? as usize;
        let start = self.offset();
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| DecodeError::at(DecodeErrorKind::InvalidUtf8 { field }, start, self.frame))
    }

    fn opt_len(&mut self, field: &'static str) -> DecodeResult<Option<u32>> {
        let n = self.u32(field)?;
        Ok((n != NONE_LENGTH).then_some(n))
    }
}

fn read_type(r: &mut FrameReader<'_>) -> DecodeResult<LogicalType> {
    let at = r.offset();
    let tag = r.u8("column type")?;
    let ty = match tag {
        T_BOOLEAN => LogicalType::Boolean,
        T_TINYINT => LogicalType::TinyInt,
        T_SMALLINT => LogicalType::SmallInt,
        T_INT => LogicalType::Int,
        T_BIGINT => LogicalType::BigInt,
        T_REAL => LogicalType::Real,
        T_DOUBLE => LogicalType::Double,
        T_DECIMAL => LogicalType::Decimal {
            precision: r.u8("decimal precision")?,
            scale: r.u8("decimal scale")?,
        },
        T_STRING => LogicalType::String {
            max_length: r.opt_len("string length")?,
            unicode: r.u8("string unicode flag")? != 0,
        },
        T_BINARY => LogicalType::Binary {
            max_length: r.opt_len("binary length")?,
        },
        T_DATE => LogicalType::Date,
        T_TIME => LogicalType::Time,
        T_DATETIME => LogicalType::DateTime,
        T_DATETIMEOFFSET => LogicalType::DateTimeOffset,
        T_GUID => LogicalType::Guid,
        T_OTHER => LogicalType::Other {
            name: r.string("type name")?,
        },
        other => {
            return Err(DecodeError::at(
                DecodeErrorKind::UnknownTypeTag(other),
                at,
                r.frame,
            ))
        }
    };
    Ok(ty)
}

fn read_header_from(r: &mut FrameReader<'_>) -> DecodeResult<FrameHeader> {
    if r.buf.remaining() < FRAME_MAGIC.len() + 1 {
        if FRAME_MAGIC.starts_with(&r.buf[..r.buf.len().min(FRAME_MAGIC.len())]) {
            r.need(FRAME_MAGIC.len() + 1, "frame magic")?;
        }
        return Err(r.fail(DecodeErrorKind::BadMagic));
    }
    if &r.buf[..FRAME_MAGIC.len()] != FRAME_MAGIC {
        return Err(r.fail(DecodeErrorKind::BadMagic));
    }
    r.bytes(FRAME_MAGIC.len(), "frame magic")?;

    let version_at = r.offset();
    let version = r.u8("format version")?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::at(
            DecodeErrorKind::UnsupportedVersion(version),
            version_at,
            r.frame,
        ));
    }

    let schema = r.string("schema name")?;
    let table = r.string("table name")?;

    let column_count = r.u32("column count")? as usize;
    // Each column needs at least 6 bytes; reject absurd counts before allocating
    if column_count > r.buf.remaining() / 6 + 1 {
        return Err(r.fail(DecodeErrorKind::Truncated {
            field: "column list",
            needed: column_count.saturating_mul(6),
            available: r.buf.remaining(),
        }));
    }
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let name = r.string("column name")?;
        let logical_type = read_type(r)?;
        let nullable = r.u8("nullable flag")? != 0;
        columns.push(ColumnHeader {
            name,
            logical_type,
            nullable,
        });
    }

    let row_count = r.u64("row count")?;

    Ok(FrameHeader {
        version,
        schema,
        table,
        columns,
        row_count,
        header_len: r.offset(),
    })
}

/// Parse only the header of a raw frame.
pub fn decode_header(frame: &[u8]) -> DecodeResult<FrameHeader> {
    read_header_from(&mut FrameReader::new(frame))
}

/// Parse a complete raw frame. Fails closed on any inconsistency.
pub fn decode_frame(frame: &[u8]) -> DecodeResult<(FrameHeader, Vec<Row>)> {
    let mut r = FrameReader::new(frame);
    let header = read_header_from(&mut r)?;
    let width = header.columns.len();

    // Every value is at least one tag byte
    let min_bytes = header.row_count.saturating_mul(width as u64);
    if width > 0 && min_bytes > r.buf.remaining() as u64 {
        return Err(r.fail(DecodeErrorKind::RowCountMismatch {
            declared: header.row_count,
            decoded: r.buf.remaining() as u64 / width as u64,
        }));
    }

    let capacity = usize::try_from(header.row_count).unwrap_or(0).min(1 << 20);
    let mut rows = Vec::with_capacity(capacity);
    for decoded in 0..header.row_count {
        if width > 0 && !r.buf.has_remaining() {
            return Err(r.fail(DecodeErrorKind::RowCountMismatch {
                declared: header.row_count,
                decoded,
            }));
        }
        let mut row = Vec::with_capacity(width);
        for _ in 0..width {
            row.push(read_value(&mut r)?);
        }
        rows.push(row);
    }

    if r.buf.has_remaining() {
        return Err(r.fail(DecodeErrorKind::TrailingBytes(r.buf.remaining())));
    }

    Ok((header, rows))
}

fn invalid(r: &FrameReader<'_>, at: usize, field: &'static str, detail: String) -> DecodeError {
    DecodeError::at(DecodeErrorKind::InvalidValue { field, detail }, at, r.frame)
}

fn read_value(r: &mut FrameReader<'_>) -> DecodeResult<SqlValue> {
    let at = r.offset();
    let tag = r.u8("value tag")?;
    let value = match tag {
        V_NULL => SqlValue::Null,
        V_BOOL => match r.u8("bool")? {
            0 => SqlValue::Bool(false),
            1 => SqlValue::Bool(true),
            other => return Err(invalid(r, at, "bool", format!("byte {}", other))),
        },
        V_U8 => SqlValue::U8(r.u8("u8")?),
        V_I16 => {
            r.need(2, "i16")?;
            SqlValue::I16(r.buf.get_i16())
        }
        V_I32 => {
            r.need(4, "i32")?;
            SqlValue::I32(r.buf.get_i32())
        }
        V_I64 => {
            r.need(8, "i64")?;
            SqlValue::I64(r.buf.get_i64())
        }
        V_F32 => SqlValue::F32(f32::from_bits(r.u32("f32")?)),
        V_F64 => SqlValue::F64(f64::from_bits(r.u64("f64")?)),
        V_DECIMAL => {
            let raw = r.bytes(16, "decimal")?;
            let mut b = [0u8; 16];
            b.copy_from_slice(raw);
            // byte 2 holds the scale
            if b[2] > 28 {
                return Err(invalid(r, at, "decimal", format!("scale {}", b[2])));
            }
            SqlValue::Decimal(Decimal::deserialize(b))
        }
        V_STRING => SqlValue::String(r.string("string value")?),
        V_BYTES => {
            let len = r.u32("binary length")? as usize;
            SqlValue::Bytes(r.bytes(len, "binary value")?.to_vec())
        }
        V_DATE => {
            r.need(4, "date")?;
            let days = r.buf.get_i32();
            let d = NaiveDate::from_num_days_from_ce_opt(days)
                .ok_or_else(|| invalid(r, at, "date", format!("day {}", days)))?;
            SqlValue::Date(d)
        }
        V_TIME => {
            let secs = r.u32("time")?;
            let nanos = r.u32("time")?;
            let t = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .ok_or_else(|| invalid(r, at, "time", format!("{}s {}ns", secs, nanos)))?;
            SqlValue::Time(t)
        }
        V_DATETIME => {
            r.need(12, "datetime")?;
            let secs = r.buf.get_i64();
            let nanos = r.buf.get_u32();
            let dt = DateTime::from_timestamp(secs, nanos)
                .ok_or_else(|| invalid(r, at, "datetime", format!("{}s {}ns", secs, nanos)))?;
            SqlValue::DateTime(dt.naive_utc())
        }
        V_DATETIMEOFFSET => {
            r.need(16, "datetimeoffset")?;
            let secs = r.buf.get_i64();
            let nanos = r.buf.get_u32();
            let offset_secs = r.buf.get_i32();
            let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| {
                invalid(r, at, "datetimeoffset", format!("offset {}s", offset_secs))
            })?;
            let dt = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
                invalid(r, at, "datetimeoffset", format!("{}s {}ns", secs, nanos))
            })?;
            SqlValue::DateTimeOffset(dt.with_timezone(&offset))
        }
        V_GUID => {
            let raw = r.bytes(16, "guid")?;
            let mut b = [0u8; 16];
            b.copy_from_slice(raw);
            SqlValue::Guid(Uuid::from_bytes(b))
        }
        other => {
            return Err(DecodeError::at(
                DecodeErrorKind::UnknownValueTag(other),
                at,
                r.frame,
            ))
        }
    };
    Ok(value)
}
