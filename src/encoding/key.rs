//! # Typed Key Codec
//!
//! Indexed values are scalars (plus shallow arrays) and encode to a type tag
//! followed by a fixed or length-prefixed payload. All integers are
//! big-endian.
//!
//! ## Wire Layout
//!
//! ```text
//! tag  type       payload
//! ---  ---------  -----------------------------------------
//! 0    UNDEFINED  (empty)
//! 1    STRING     u16 length + UTF-8 bytes (max 255 bytes)
//! 2    NUMBER/i   i64, 8 bytes two's complement
//! 3    NUMBER/f   f64, 8 bytes IEEE-754
//! 4    BOOLEAN    1 byte, 0 or 1
//! 5    DATETIME   i64 milliseconds since the epoch
//! 6    BINARY     u16 length + bytes
//! 7    ARRAY      u16 count + encoded elements
//! ```
//!
//! ## Total Order
//!
//! Keys of different types compare by rank:
//!
//! ```text
//! undefined < boolean < number/datetime < string < binary < array
//! ```
//!
//! Numbers and datetimes share one rank and compare numerically, with
//! integer/float comparisons done exactly (no round-trip through lossy
//! casts for large magnitudes). Strings compare byte-wise; indexes that are
//! case-insensitive fold keys *before* they reach the tree, so the tree
//! itself never consults a locale.
//!
//! The order is implemented on the decoded [`IndexKey`] values, not on the
//! encoded bytes; every comparison site in the tree decodes keys first.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::config::MAX_KEY_STRING_BYTES;

pub const TAG_UNDEFINED: u8 = 0;
pub const TAG_STRING: u8 = 1;
pub const TAG_INTEGER: u8 = 2;
pub const TAG_FLOAT: u8 = 3;
pub const TAG_BOOLEAN: u8 = 4;
pub const TAG_DATETIME: u8 = 5;
pub const TAG_BINARY: u8 = 6;
pub const TAG_ARRAY: u8 = 7;

#[derive(Debug, Clone)]
pub enum IndexKey {
    Undefined,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<IndexKey>),
}

impl IndexKey {
    /// Rank in the cross-type total order.
    fn rank(&self) -> u8 {
        match self {
            IndexKey::Undefined => 0,
            IndexKey::Boolean(_) => 1,
            IndexKey::Integer(_) | IndexKey::Float(_) | IndexKey::Date(_) => 2,
            IndexKey::String(_) => 3,
            IndexKey::Binary(_) => 4,
            IndexKey::Array(_) => 5,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, IndexKey::Undefined)
    }

    /// Case-folds string keys (and string array elements) for
    /// case-insensitive indexes. The fold happens once, before the key
    /// enters the tree or a scratch file.
    pub fn fold_case(self) -> IndexKey {
        match self {
            IndexKey::String(s) => IndexKey::String(s.to_lowercase()),
            IndexKey::Array(items) => {
                IndexKey::Array(items.into_iter().map(IndexKey::fold_case).collect())
            }
            other => other,
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            IndexKey::Undefined => buf.push(TAG_UNDEFINED),
            IndexKey::String(s) => {
                let bytes = truncate_str(s, MAX_KEY_STRING_BYTES).as_bytes();
                buf.push(TAG_STRING);
                buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            IndexKey::Integer(v) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            IndexKey::Float(v) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            IndexKey::Boolean(v) => {
                buf.push(TAG_BOOLEAN);
                buf.push(u8::from(*v));
            }
            IndexKey::Date(ms) => {
                buf.push(TAG_DATETIME);
                buf.extend_from_slice(&ms.to_be_bytes());
            }
            IndexKey::Binary(bytes) => {
                buf.push(TAG_BINARY);
                buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            IndexKey::Array(items) => {
                buf.push(TAG_ARRAY);
                buf.extend_from_slice(&(items.len() as u16).to_be_bytes());
                for item in items {
                    item.encode_to(buf);
                }
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes one key from the front of `buf`, returning it together with
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(IndexKey, usize)> {
        ensure!(!buf.is_empty(), "cannot decode key from empty buffer");
        let tag = buf[0];
        match tag {
            TAG_UNDEFINED => Ok((IndexKey::Undefined, 1)),
            TAG_STRING | TAG_BINARY => {
                ensure!(buf.len() >= 3, "truncated length prefix in key");
                let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                ensure!(buf.len() >= 3 + len, "truncated key payload");
                let payload = &buf[3..3 + len];
                let key = if tag == TAG_STRING {
                    IndexKey::String(std::str::from_utf8(payload)?.to_string())
                } else {
                    IndexKey::Binary(payload.to_vec())
                };
                Ok((key, 3 + len))
            }
            TAG_INTEGER | TAG_FLOAT | TAG_DATETIME => {
                ensure!(buf.len() >= 9, "truncated 8-byte key payload");
                let raw: [u8; 8] = buf[1..9].try_into().unwrap();
                let key = match tag {
                    TAG_INTEGER => IndexKey::Integer(i64::from_be_bytes(raw)),
                    TAG_FLOAT => IndexKey::Float(f64::from_be_bytes(raw)),
                    _ => IndexKey::Date(i64::from_be_bytes(raw)),
                };
                Ok((key, 9))
            }
            TAG_BOOLEAN => {
                ensure!(buf.len() >= 2, "truncated boolean key");
                Ok((IndexKey::Boolean(buf[1] != 0), 2))
            }
            TAG_ARRAY => {
                ensure!(buf.len() >= 3, "truncated array key header");
                let count = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                let mut items = Vec::with_capacity(count);
                let mut at = 3;
                for _ in 0..count {
                    let (item, used) = IndexKey::decode(&buf[at..])?;
                    items.push(item);
                    at += used;
                }
                Ok((IndexKey::Array(items), at))
            }
            other => bail!("unknown key type tag {}", other),
        }
    }
}

/// Truncates to the largest char boundary not exceeding `max` bytes.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Exact integer/float comparison. Casting i64 to f64 loses precision above
/// 2^53, so the float is compared piecewise against the integer instead.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    if f == f64::INFINITY {
        return Ordering::Less;
    }
    if f == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    let floor = f.floor();
    // as-casts saturate at the i64 range ends, which is exactly the
    // comparison we need out beyond it.
    let floor_i = floor as i64;
    match i.cmp(&floor_i) {
        Ordering::Equal => {
            if f > floor {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn numeric_value(key: &IndexKey) -> Option<Numeric> {
    match key {
        IndexKey::Integer(v) => Some(Numeric::Int(*v)),
        IndexKey::Date(v) => Some(Numeric::Int(*v)),
        IndexKey::Float(v) => Some(Numeric::Float(*v)),
        _ => None,
    }
}

enum Numeric {
    Int(i64),
    Float(f64),
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.rank().cmp(&other.rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (IndexKey::Undefined, IndexKey::Undefined) => Ordering::Equal,
            (IndexKey::Boolean(a), IndexKey::Boolean(b)) => a.cmp(b),
            (IndexKey::String(a), IndexKey::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (IndexKey::Binary(a), IndexKey::Binary(b)) => a.cmp(b),
            (IndexKey::Array(a), IndexKey::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            // Same rank left: the numeric family.
            (a, b) => match (numeric_value(a), numeric_value(b)) {
                (Some(Numeric::Int(x)), Some(Numeric::Int(y))) => x.cmp(&y),
                (Some(Numeric::Float(x)), Some(Numeric::Float(y))) => x.total_cmp(&y),
                (Some(Numeric::Int(x)), Some(Numeric::Float(y))) => cmp_int_float(x, y),
                (Some(Numeric::Float(x)), Some(Numeric::Int(y))) => {
                    cmp_int_float(y, x).reverse()
                }
                _ => unreachable!("rank grouping guarantees numeric operands"),
            },
        }
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKey::Undefined => write!(f, "undefined"),
            IndexKey::Boolean(v) => write!(f, "{}", v),
            IndexKey::Integer(v) => write!(f, "{}", v),
            IndexKey::Float(v) => write!(f, "{}", v),
            IndexKey::Date(ms) => write!(f, "date({})", ms),
            IndexKey::String(s) => write!(f, "{:?}", s),
            IndexKey::Binary(b) => write!(f, "binary[{}]", b.len()),
            IndexKey::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(key: IndexKey) {
        let bytes = key.encode();
        let (decoded, used) = IndexKey::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len(), "consumed length mismatch for {}", key);
        assert_eq!(decoded, key);
    }

    #[test]
    fn codec_roundtrip_all_types() {
        roundtrip(IndexKey::Undefined);
        roundtrip(IndexKey::Boolean(true));
        roundtrip(IndexKey::Boolean(false));
        roundtrip(IndexKey::Integer(-42));
        roundtrip(IndexKey::Integer(i64::MAX));
        roundtrip(IndexKey::Float(3.5));
        roundtrip(IndexKey::Date(1_700_000_000_000));
        roundtrip(IndexKey::String("hello wörld".to_string()));
        roundtrip(IndexKey::Binary(vec![0, 255, 1, 254]));
        roundtrip(IndexKey::Array(vec![
            IndexKey::Integer(1),
            IndexKey::String("two".to_string()),
        ]));
    }

    #[test]
    fn decode_reports_consumed_bytes_with_trailing_data() {
        let mut bytes = IndexKey::Integer(7).encode();
        let expected = bytes.len();
        bytes.extend_from_slice(b"trailing");
        let (key, used) = IndexKey::decode(&bytes).unwrap();
        assert_eq!(key, IndexKey::Integer(7));
        assert_eq!(used, expected);
    }

    #[test]
    fn long_strings_truncate_on_char_boundary() {
        let s = "é".repeat(200); // 400 bytes
        let key = IndexKey::String(s);
        let bytes = key.encode();
        let (decoded, _) = IndexKey::decode(&bytes).unwrap();
        match decoded {
            IndexKey::String(out) => {
                assert!(out.len() <= MAX_KEY_STRING_BYTES);
                assert_eq!(out.len(), 254); // 255 splits a 2-byte char
            }
            other => panic!("expected string, got {}", other),
        }
    }

    #[test]
    fn cross_type_rank_order() {
        let undefined = IndexKey::Undefined;
        let boolean = IndexKey::Boolean(true);
        let number = IndexKey::Integer(999_999);
        let date = IndexKey::Date(0);
        let string = IndexKey::String("a".to_string());
        let binary = IndexKey::Binary(vec![0]);

        assert!(undefined < boolean);
        assert!(boolean < number);
        assert!(boolean < date);
        assert!(number < string);
        assert!(date < string);
        assert!(string < binary);
    }

    #[test]
    fn numbers_and_dates_compare_numerically() {
        assert_eq!(IndexKey::Integer(100), IndexKey::Date(100));
        assert!(IndexKey::Integer(99) < IndexKey::Date(100));
        assert!(IndexKey::Float(99.5) < IndexKey::Integer(100));
        assert!(IndexKey::Float(100.5) > IndexKey::Integer(100));
        assert_eq!(IndexKey::Float(100.0), IndexKey::Integer(100));
    }

    #[test]
    fn large_magnitude_int_float_comparison_is_exact() {
        // 2^53 + 1 is not representable as f64; a lossy cast would call
        // these equal.
        let i = IndexKey::Integer((1i64 << 53) + 1);
        let f = IndexKey::Float((1i64 << 53) as f64);
        assert!(i > f);
        assert!(f < i);
    }

    #[test]
    fn case_fold_lowers_strings_recursively() {
        let key = IndexKey::Array(vec![
            IndexKey::String("HeLLo".to_string()),
            IndexKey::Integer(1),
        ]);
        match key.fold_case() {
            IndexKey::Array(items) => {
                assert_eq!(items[0], IndexKey::String("hello".to_string()));
            }
            other => panic!("expected array, got {}", other),
        }
    }

    #[test]
    fn unknown_tag_fails() {
        assert!(IndexKey::decode(&[200]).is_err());
    }
}
