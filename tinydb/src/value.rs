//! Typed column values and the coercions applied at insert/update time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Declared column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Boolean,
    Timestamp,
    Blob,
    Decimal,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Blob => "BLOB",
            ColumnType::Decimal => "DECIMAL",
        };
        f.write_str(name)
    }
}

/// A single column value. TIMESTAMP is microseconds since the Unix epoch;
/// DECIMAL is a canonical decimal string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Timestamp(i64),
    Blob(Vec<u8>),
    Decimal(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Boolean(_) => "BOOLEAN",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Blob(_) => "BLOB",
            Value::Decimal(_) => "DECIMAL",
            Value::Null => "NULL",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Timestamp(v) => match DateTime::from_timestamp_micros(*v) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
                None => write!(f, "{v}"),
            },
            Value::Blob(v) => write!(f, "<blob {} bytes>", v.len()),
            Value::Decimal(v) => f.write_str(v),
            Value::Null => f.write_str("NULL"),
        }
    }
}

/// Coerces a value to a column type, or reports the mismatch.
pub fn coerce(value: Value, ty: ColumnType) -> Result<Value> {
    let mismatch = |value: &Value| {
        Err(Error::Constraint(format!(
            "cannot store {} in a {ty} column",
            value.type_name()
        )))
    };
    if value.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        ColumnType::Integer => match value {
            Value::Integer(v) => Ok(Value::Integer(v)),
            Value::Boolean(v) => Ok(Value::Integer(v as i64)),
            Value::Real(v) if v.is_finite() => Ok(Value::Integer(v.trunc() as i64)),
            other => mismatch(&other),
        },
        ColumnType::Real => match value {
            Value::Real(v) => Ok(Value::Real(v)),
            Value::Integer(v) => Ok(Value::Real(v as f64)),
            other => mismatch(&other),
        },
        ColumnType::Text => match value {
            Value::Text(v) => Ok(Value::Text(v)),
            other => mismatch(&other),
        },
        ColumnType::Boolean => match value {
            Value::Boolean(v) => Ok(Value::Boolean(v)),
            Value::Integer(0) => Ok(Value::Boolean(false)),
            Value::Integer(1) => Ok(Value::Boolean(true)),
            Value::Text(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                _ => mismatch(&Value::Text(v)),
            },
            other => mismatch(&other),
        },
        ColumnType::Timestamp => match value {
            Value::Timestamp(v) => Ok(Value::Timestamp(v)),
            Value::Integer(v) => Ok(Value::Timestamp(v)),
            Value::Text(v) => Ok(Value::Timestamp(parse_timestamp(&v)?)),
            other => mismatch(&other),
        },
        ColumnType::Blob => match value {
            Value::Blob(v) => Ok(Value::Blob(v)),
            Value::Text(v) => Ok(Value::Blob(v.into_bytes())),
            other => mismatch(&other),
        },
        ColumnType::Decimal => match value {
            Value::Decimal(v) => Ok(Value::Decimal(canonical_decimal(&v)?)),
            Value::Text(v) => Ok(Value::Decimal(canonical_decimal(&v)?)),
            Value::Integer(v) => Ok(Value::Decimal(v.to_string())),
            other => mismatch(&other),
        },
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.frac]`, or a bare date.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_micros());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(dt.and_utc().timestamp_micros());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc().timestamp_micros());
    }
    Err(Error::Constraint(format!(
        "cannot parse '{text}' as a timestamp"
    )))
}

/// Normalizes a decimal string: optional sign, no redundant zeros, no
/// trailing point. Rejects anything that is not a plain decimal literal.
pub fn canonical_decimal(text: &str) -> Result<String> {
    let text = text.trim();
    let invalid = || Error::Constraint(format!("'{text}' is not a valid decimal"));

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let int_trimmed = int_part.trim_start_matches('0');
    let int_norm = if int_trimmed.is_empty() { "0" } else { int_trimmed };
    let frac_norm = frac_part.trim_end_matches('0');

    let mut out = String::new();
    if negative && !(int_norm == "0" && frac_norm.is_empty()) {
        out.push('-');
    }
    out.push_str(int_norm);
    if !frac_norm.is_empty() {
        out.push('.');
        out.push_str(frac_norm);
    }
    Ok(out)
}
