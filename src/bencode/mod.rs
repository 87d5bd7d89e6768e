//! Bencode codec: the canonical binary serialization used for torrent
//! metainfo and tracker responses.
//!
//! Byte strings are never forced through UTF-8 here — that decision
//! belongs to callers that know a field's semantics (§4.1).
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// Maximum nesting depth the decoder will follow before giving up.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// A decoded bencode value.
///
/// Dictionaries are represented with a `BTreeMap` so that insertion
/// order is irrelevant and re-encoding always produces the canonical,
/// lexicographically key-sorted form — §3 requires sorted-on-encode,
/// and a sorted map gets that invariant for free instead of re-sorting
/// at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(Integer),
    ByteString(Vec<u8>),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

/// Bencode integers are arbitrary precision in principle. Values that
/// fit in an `i64` are kept native; anything larger is kept as the
/// exact decimal digit string it was parsed from (§9: "prefer a 64-bit
/// signed type with an explicit overflow path").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integer {
    Small(i64),
    Big(BigInt),
}

/// Sign-and-digits representation of an out-of-i64-range integer.
/// `digits` never has a leading zero and is never "0" with `negative`
/// set (canonical `-0` is rejected during decode, so this type cannot
/// represent it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt {
    pub negative: bool,
    pub digits: String,
}

impl Integer {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Integer::Small(v) => Some(*v),
            Integer::Big(_) => None,
        }
    }
}

impl From<i64> for Integer {
    fn from(v: i64) -> Self {
        Integer::Small(v)
    }
}

impl Value {
    pub fn as_integer(&self) -> Option<&Integer> {
        match self {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(Integer::as_i64)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn string(s: impl Into<Vec<u8>>) -> Value {
        Value::ByteString(s.into())
    }

    pub fn integer(v: i64) -> Value {
        Value::Integer(Integer::Small(v))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("string length {0} exceeds remaining buffer")]
    StringLengthOutOfBounds(usize),

    #[error("dictionary keys are not sorted at key {0:?}")]
    UnsortedKeys(Vec<u8>),

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("{0} bytes of trailing data after root value")]
    TrailingData(usize),

    #[error("nesting depth exceeds limit of {0}")]
    DepthLimitExceeded(usize),

    #[error("unexpected byte {0:#04x} while decoding")]
    UnexpectedByte(u8),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decode a single root value, rejecting any trailing bytes.
pub fn decode(bytes: &[u8]) -> BencodeResult<Value> {
    decode_with_depth_limit(bytes, DEFAULT_MAX_DEPTH)
}

pub fn decode_with_depth_limit(bytes: &[u8], max_depth: usize) -> BencodeResult<Value> {
    let mut cursor = decoder::Cursor::new(bytes, max_depth);
    let value = cursor.decode_value(0)?;
    if cursor.remaining() > 0 {
        return Err(BencodeError::TrailingData(cursor.remaining()));
    }
    Ok(value)
}

/// Encode a value into its canonical byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encoder::encode_value(&mut buf, value);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_dict_spec_scenario() {
        // §8 scenario 1.
        let input = b"d3:bar4:spam3:fooi42ee";
        let decoded = decode(input).unwrap();
        let dict = decoded.as_dict().unwrap();
        assert_eq!(dict.get(b"bar".as_slice()).unwrap().as_bytes(), Some(b"spam".as_slice()));
        assert_eq!(dict.get(b"foo".as_slice()).unwrap().as_i64(), Some(42));
        assert_eq!(encode(&decoded), input);
    }

    #[test]
    fn zero_decodes_to_zero() {
        assert_eq!(decode(b"i0e").unwrap(), Value::integer(0));
    }

    #[test]
    fn rejects_negative_zero_and_leading_zeros() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i01e").is_err());
        assert!(decode(b"i ee").is_err());
    }

    #[test]
    fn empty_string_decodes() {
        assert_eq!(decode(b"0:").unwrap(), Value::string(&b""[..]));
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(matches!(decode(b"i1ee"), Err(BencodeError::TrailingData(1))));
    }

    #[test]
    fn rejects_string_length_out_of_bounds() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn rejects_excess_depth() {
        let mut nested = Vec::new();
        for _ in 0..200 {
            nested.push(b'l');
        }
        for _ in 0..200 {
            nested.push(b'e');
        }
        assert!(matches!(
            decode(&nested),
            Err(BencodeError::DepthLimitExceeded(_))
        ));
    }

    #[test]
    fn encode_sorts_keys_regardless_of_insertion_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), Value::integer(1));
        dict.insert(b"apple".to_vec(), Value::integer(2));
        let v = Value::Dictionary(dict);
        assert_eq!(encode(&v), b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn big_integer_round_trips_exactly() {
        let big = "123456789012345678901234567890";
        let input = format!("i{}e", big);
        let decoded = decode(input.as_bytes()).unwrap();
        match &decoded {
            Value::Integer(Integer::Big(b)) => {
                assert!(!b.negative);
                assert_eq!(b.digits, big);
            }
            _ => panic!("expected big integer"),
        }
        assert_eq!(encode(&decoded), input.as_bytes());
    }
}
