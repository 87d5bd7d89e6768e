//! Recursive-descent bencode decoder over a bounded in-memory buffer.
//!
//! §5 requires that decode never block waiting for more bytes — callers
//! do their own length-prefixed framing before handing a complete
//! buffer to [`Cursor`]. A slice cursor rather than a `Read` stream is
//! what makes that guarantee structural instead of a convention.
use super::{BencodeError, BencodeResult, BigInt, Integer, Value};
use std::collections::BTreeMap;
use tracing::instrument;

pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], max_depth: usize) -> Self {
        Self { buf, pos: 0, max_depth }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(BencodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        if self.peek()? == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(BencodeError::UnexpectedByte(self.peek()?))
        }
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let byte = self.peek()?;
            if byte == delimiter {
                let slice = &self.buf[start..self.pos];
                self.pos += 1;
                return Ok(slice);
            }
            self.pos += 1;
        }
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_value(&mut self, depth: usize) -> BencodeResult<Value> {
        if depth > self.max_depth {
            return Err(BencodeError::DepthLimitExceeded(self.max_depth));
        }
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(Value::ByteString),
            b'i' => self.decode_integer().map(Value::Integer),
            b'l' => self.decode_list(depth).map(Value::List),
            b'd' => self.decode_dict(depth).map(Value::Dictionary),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let length_bytes = self.read_until(b':')?;
        let length_str = std::str::from_utf8(length_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
        if length_str.len() > 1 && length_str.starts_with('0') {
            return Err(BencodeError::InvalidStringLength);
        }
        let length: usize = length_str.parse().map_err(|_| BencodeError::InvalidStringLength)?;
        if length > self.remaining() {
            return Err(BencodeError::StringLengthOutOfBounds(length));
        }
        Ok(self.advance(length)?.to_vec())
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_integer(&mut self) -> BencodeResult<Integer> {
        self.expect(b'i')?;
        let digits = self.read_until(b'e')?;
        let num_str = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        validate_canonical_integer(num_str)?;
        match num_str.parse::<i64>() {
            Ok(v) => Ok(Integer::Small(v)),
            Err(_) => {
                let (negative, digits) = match num_str.strip_prefix('-') {
                    Some(rest) => (true, rest.to_string()),
                    None => (false, num_str.to_string()),
                };
                Ok(Integer::Big(BigInt { negative, digits }))
            }
        }
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_list(&mut self, depth: usize) -> BencodeResult<Vec<Value>> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.decode_value(depth + 1)?);
        }
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_dict(&mut self, depth: usize) -> BencodeResult<BTreeMap<Vec<u8>, Value>> {
        self.expect(b'd')?;
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(dict);
            }
            let key = self.decode_string()?;
            if let Some(prev) = &last_key {
                if key.as_slice() <= prev.as_slice() {
                    return Err(BencodeError::UnsortedKeys(key));
                }
            }
            let value = self.decode_value(depth + 1)?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
    }
}

/// §4.1: reject leading zeros (except a single `0`), reject `-0`, reject empty digit strings.
fn validate_canonical_integer(s: &str) -> BencodeResult<()> {
    if s.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if negative && digits == "0" {
        return Err(BencodeError::InvalidInteger);
    }
    Ok(())
}
