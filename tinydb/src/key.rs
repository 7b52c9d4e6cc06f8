//! Primary-key tuples: encoding and the field-by-field ordering B-tree
//! nodes compare with. Composite keys compare in declared column order.

use std::cmp::Ordering;

use crate::error::Result;
use crate::record;
use crate::value::Value;

pub fn encode_key(values: &[Value]) -> Vec<u8> {
    record::encode_row(values)
}

pub fn decode_key(bytes: &[u8]) -> Result<Vec<Value>> {
    record::decode_row(bytes)
}

pub fn compare_encoded(a: &[u8], b: &[u8]) -> Result<Ordering> {
    let left = decode_key(a)?;
    let right = decode_key(b)?;
    Ok(compare_tuples(&left, &right))
}

pub fn compare_tuples(a: &[Value], b: &[Value]) -> Ordering {
    for (left, right) in a.iter().zip(b.iter()) {
        let ord = compare_values(left, right);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Typed ordering: integers and timestamps as signed, reals by IEEE total
/// order, text and blobs bytewise, decimals numerically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Real(x), Value::Real(y)) => x.total_cmp(y),
        (Value::Text(x), Value::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Decimal(x), Value::Decimal(y)) => compare_decimals(x, y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        // Keys are schema-typed, so mixed comparisons only occur on corrupt
        // input; fall back to a stable rank so ordering stays total.
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 2,
        Value::Real(_) => 3,
        Value::Timestamp(_) => 4,
        Value::Decimal(_) => 5,
        Value::Text(_) => 6,
        Value::Blob(_) => 7,
    }
}

/// Numeric comparison of canonical decimal strings.
fn compare_decimals(a: &str, b: &str) -> Ordering {
    let (a_neg, a_int, a_frac) = split_decimal(a);
    let (b_neg, b_int, b_frac) = split_decimal(b);

    match (a_neg, b_neg) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let magnitude = compare_magnitudes(a_int, a_frac, b_int, b_frac);
    if a_neg {
        magnitude.reverse()
    } else {
        magnitude
    }
}

fn split_decimal(text: &str) -> (bool, &str, &str) {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    match rest.split_once('.') {
        Some((int_part, frac_part)) => (negative, int_part, frac_part),
        None => (negative, rest, ""),
    }
}

fn compare_magnitudes(a_int: &str, a_frac: &str, b_int: &str, b_frac: &str) -> Ordering {
    let a_int = a_int.trim_start_matches('0');
    let b_int = b_int.trim_start_matches('0');
    match a_int.len().cmp(&b_int.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    match a_int.cmp(b_int) {
        Ordering::Equal => {}
        other => return other,
    }
    // Same integer part: the fraction decides, shorter padded with zeros.
    let max_len = a_frac.len().max(b_frac.len());
    for i in 0..max_len {
        let da = a_frac.as_bytes().get(i).copied().unwrap_or(b'0');
        let db = b_frac.as_bytes().get(i).copied().unwrap_or(b'0');
        match da.cmp(&db) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}
