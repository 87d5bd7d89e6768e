//! Canonical bencode emitter. Encoding never fails: any `Value` that
//! exists was either decoded (and is therefore already canonical) or
//! built in-process, so there is no "cannot encode" path to report.
use super::{BigInt, Integer, Value};
use tracing::instrument;

#[instrument(skip(out, s), level = "trace")]
fn encode_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s);
}

#[instrument(skip(out), level = "trace")]
fn encode_integer(out: &mut Vec<u8>, i: &Integer) {
    out.push(b'i');
    match i {
        Integer::Small(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Integer::Big(BigInt { negative, digits }) => {
            if *negative {
                out.push(b'-');
            }
            out.extend_from_slice(digits.as_bytes());
        }
    }
    out.push(b'e');
}

#[instrument(skip(out, list), level = "trace")]
fn encode_list(out: &mut Vec<u8>, list: &[Value]) {
    out.push(b'l');
    for item in list {
        encode_value(out, item);
    }
    out.push(b'e');
}

#[instrument(skip(out, dict), level = "trace")]
fn encode_dict(out: &mut Vec<u8>, dict: &std::collections::BTreeMap<Vec<u8>, Value>) {
    out.push(b'd');
    // BTreeMap iterates in ascending key order already, which is the
    // canonical byte-sort order for dict keys (§3).
    for (key, value) in dict {
        encode_string(out, key);
        encode_value(out, value);
    }
    out.push(b'e');
}

#[instrument(skip(out), level = "trace")]
pub fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::ByteString(s) => encode_string(out, s),
        Value::Integer(i) => encode_integer(out, i),
        Value::List(list) => encode_list(out, list),
        Value::Dictionary(dict) => encode_dict(out, dict),
    }
}
