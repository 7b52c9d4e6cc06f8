//! The row codec: a 2-byte column count, then one tag byte plus a
//! little-endian payload per value. Schema-aware decoding backfills columns
//! added after the row was written.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::schema::ColumnDesc;
use crate::value::Value;

const TAG_INTEGER: u8 = 0x01;
const TAG_REAL: u8 = 0x02;
const TAG_BOOLEAN: u8 = 0x03;
const TAG_TIMESTAMP: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BLOB: u8 = 0x06;
const TAG_DECIMAL: u8 = 0x07;
const TAG_NULL: u8 = 0xFF;

pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16_le(values.len() as u16);
    for value in values {
        match value {
            Value::Integer(v) => {
                buf.put_u8(TAG_INTEGER);
                buf.put_i64_le(*v);
            }
            Value::Real(v) => {
                buf.put_u8(TAG_REAL);
                buf.put_f64_le(*v);
            }
            Value::Boolean(v) => {
                buf.put_u8(TAG_BOOLEAN);
                buf.put_u8(*v as u8);
            }
            Value::Timestamp(v) => {
                buf.put_u8(TAG_TIMESTAMP);
                buf.put_i64_le(*v);
            }
            Value::Text(v) => {
                buf.put_u8(TAG_TEXT);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Value::Blob(v) => {
                buf.put_u8(TAG_BLOB);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v);
            }
            Value::Decimal(v) => {
                buf.put_u8(TAG_DECIMAL);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Value::Null => {
                buf.put_u8(TAG_NULL);
            }
        }
    }
    buf.to_vec()
}

pub fn decode_row(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut buf = bytes;
    let count = take_u16(&mut buf)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(&mut buf)?);
    }
    Ok(values)
}

/// Decodes a row against the current schema: rows written before an
/// `ADD COLUMN` are padded with the new column's default, rows written
/// before a `REMOVE COLUMN` lose their trailing extras.
pub fn decode_row_with_schema(bytes: &[u8], columns: &[ColumnDesc]) -> Result<Vec<Value>> {
    let mut values = decode_row(bytes)?;
    if values.len() > columns.len() {
        values.truncate(columns.len());
    }
    while values.len() < columns.len() {
        let column = &columns[values.len()];
        values.push(column.default.clone().unwrap_or(Value::Null));
    }
    Ok(values)
}

fn decode_value(buf: &mut &[u8]) -> Result<Value> {
    let tag = take_u8(buf)?;
    match tag {
        TAG_INTEGER => Ok(Value::Integer(take_i64(buf)?)),
        TAG_REAL => {
            ensure(buf, 8)?;
            Ok(Value::Real(buf.get_f64_le()))
        }
        TAG_BOOLEAN => match take_u8(buf)? {
            0 => Ok(Value::Boolean(false)),
            1 => Ok(Value::Boolean(true)),
            other => Err(corrupt(format!("boolean byte 0x{other:02x}"))),
        },
        TAG_TIMESTAMP => Ok(Value::Timestamp(take_i64(buf)?)),
        TAG_TEXT => {
            let raw = take_bytes(buf)?;
            String::from_utf8(raw)
                .map(Value::Text)
                .map_err(|_| corrupt("TEXT value is not UTF-8".into()))
        }
        TAG_BLOB => Ok(Value::Blob(take_bytes(buf)?)),
        TAG_DECIMAL => {
            let raw = take_bytes(buf)?;
            String::from_utf8(raw)
                .map(Value::Decimal)
                .map_err(|_| corrupt("DECIMAL value is not UTF-8".into()))
        }
        TAG_NULL => Ok(Value::Null),
        other => Err(corrupt(format!("unknown value tag 0x{other:02x}"))),
    }
}

fn corrupt(details: String) -> Error {
    Error::Corruption(format!("row decode: {details}"))
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(corrupt(format!(
            "need {needed} bytes, {} remain",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
