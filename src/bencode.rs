//! A minimal bencode value codec for the extension protocol.
//!
//! Descriptor parsing goes through `serde_bencode` (see [`crate::metainfo`]);
//! this hand-rolled codec exists because extension messages need to know
//! exactly how many bytes a decoded value occupied, which a serde
//! deserializer does not expose. A `ut_metadata` data message is a bencoded
//! dictionary immediately followed by raw piece bytes, and the only safe
//! way to find the split is the decoder's consumed count: scanning for a
//! literal `ee` terminator misfires as soon as the dictionary nests
//! another container.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A bencoded value.
///
/// Dictionary keys are raw byte strings; a `BTreeMap` keeps them sorted,
/// which is what the canonical encoding requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key, if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Decodes a buffer holding exactly one bencoded value.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(Error::Bencode("trailing bytes after value"));
    }
    Ok(value)
}

/// Decodes the first bencoded value in the buffer and returns it along
/// with the number of bytes it occupied.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    let mut pos = 0;
    let value = parse(buf, &mut pos)?;
    Ok((value, pos))
}

fn parse(buf: &[u8], pos: &mut usize) -> Result<Value> {
    match buf.get(*pos) {
        Some(b'i') => {
            *pos += 1;
            Ok(Value::Int(parse_int(buf, pos)?))
        }
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match buf.get(*pos) {
                    Some(b'e') => break,
                    Some(_) => items.push(parse(buf, pos)?),
                    None => return Err(Error::Bencode("unterminated list")),
                }
            }
            *pos += 1;
            Ok(Value::List(items))
        }
        Some(b'd') => {
            *pos += 1;
            let mut entries = BTreeMap::new();
            loop {
                match buf.get(*pos) {
                    Some(b'e') => break,
                    Some(_) => {
                        let key = match parse(buf, pos)? {
                            Value::Bytes(key) => key,
                            _ => {
                                return Err(Error::Bencode(
                                    "dictionary key is not a byte string",
                                ))
                            }
                        };
                        entries.insert(key, parse(buf, pos)?);
                    }
                    None => return Err(Error::Bencode("unterminated dictionary")),
                }
            }
            *pos += 1;
            Ok(Value::Dict(entries))
        }
        Some(b'0'..=b'9') => {
            let len = parse_len(buf, pos)?;
            let end = pos
                .checked_add(len)
                .ok_or(Error::Bencode("byte string length overflow"))?;
            let bytes = buf
                .get(*pos..end)
                .ok_or(Error::Bencode("byte string is truncated"))?;
            *pos = end;
            Ok(Value::Bytes(bytes.to_vec()))
        }
        Some(_) => Err(Error::Bencode("unexpected byte")),
        None => Err(Error::Bencode("unexpected end of input")),
    }
}

/// Parses the body of an `i<digits>e` integer, with `pos` past the `i`.
fn parse_int(buf: &[u8], pos: &mut usize) -> Result<i64> {
    let start = *pos;
    if buf.get(*pos) == Some(&b'-') {
        *pos += 1;
    }
    while matches!(buf.get(*pos), Some(b'0'..=b'9')) {
        *pos += 1;
    }
    if *pos == start || (buf[start] == b'-' && *pos == start + 1) {
        return Err(Error::Bencode("integer without digits"));
    }
    if buf.get(*pos) != Some(&b'e') {
        return Err(Error::Bencode("unterminated integer"));
    }
    // the range only holds ASCII digits and an optional sign
    let digits = std::str::from_utf8(&buf[start..*pos])
        .map_err(|_| Error::Bencode("invalid integer"))?;
    let n = digits
        .parse()
        .map_err(|_| Error::Bencode("integer out of range"))?;
    *pos += 1;
    Ok(n)
}

/// Parses the `<len>:` prefix of a byte string, with `pos` at the first
/// digit; leaves `pos` past the colon.
fn parse_len(buf: &[u8], pos: &mut usize) -> Result<usize> {
    let start = *pos;
    while matches!(buf.get(*pos), Some(b'0'..=b'9')) {
        *pos += 1;
    }
    if buf.get(*pos) != Some(&b':') {
        return Err(Error::Bencode("byte string without length separator"));
    }
    let digits = std::str::from_utf8(&buf[start..*pos])
        .map_err(|_| Error::Bencode("invalid byte string length"))?;
    let len = digits
        .parse()
        .map_err(|_| Error::Bencode("byte string length out of range"))?;
    *pos += 1;
    Ok(len)
}

/// Encodes a value canonically (dictionary keys in sorted order).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                write_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                write_value(&Value::Bytes(key.clone()), out);
                write_value(item, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v))
                .collect(),
        )
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_containers() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            Value::List(vec![Value::Bytes(b"spam".to_vec()), Value::Int(42)])
        );
        assert_eq!(
            decode(b"d3:bari1e3:fooi2ee").unwrap(),
            dict(vec![(b"bar", Value::Int(1)), (b"foo", Value::Int(2))])
        );
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(decode(b"").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i-e").is_err());
        assert!(decode(b"i42").is_err());
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"di1ei2ee").is_err());
        assert!(decode(b"i42ei43e").is_err());
        assert!(decode(b"x").is_err());
    }

    #[test]
    fn test_round_trip() {
        let values = vec![
            Value::Int(-123),
            Value::Bytes(b"hello world".to_vec()),
            Value::List(vec![
                Value::Int(1),
                Value::Bytes(b"two".to_vec()),
                Value::List(vec![Value::Int(3)]),
            ]),
            dict(vec![
                (b"a", Value::Int(1)),
                (b"b", Value::List(vec![Value::Int(2), Value::Int(3)])),
                (b"c", dict(vec![(b"d", Value::Bytes(b"e".to_vec()))])),
            ]),
        ];
        for value in values {
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_canonical_key_order() {
        let value = dict(vec![
            (b"zz", Value::Int(1)),
            (b"aa", Value::Int(2)),
            (b"mm", Value::Int(3)),
        ]);
        assert_eq!(encode(&value), b"d2:aai2e2:mmi3e2:zzi1ee".to_vec());
    }

    // The split point of a ut_metadata data message must come from the
    // decoder, not from scanning for `ee`: this dictionary contains an
    // interior `ee` (the nested list terminator followed by the outer
    // value's own data) that a pattern search would latch onto.
    #[test]
    fn test_prefix_consumed_count_with_interior_terminators() {
        let mut payload = Vec::new();
        let value = dict(vec![
            (b"ids", Value::List(vec![Value::Int(1), Value::Int(2)])),
            (b"msg_type", Value::Int(1)),
            (b"piece", Value::Int(0)),
        ]);
        let encoded = encode(&value);
        // sanity check the trap exists: `ee` occurs before the real end
        let first_ee = encoded.windows(2).position(|w| w == b"ee").unwrap();
        assert!(first_ee + 2 < encoded.len());

        payload.extend_from_slice(&encoded);
        payload.extend_from_slice(b"eeee raw piece bytes");

        let (decoded, used) = decode_prefix(&payload).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, encoded.len());
        assert_eq!(&payload[used..], b"eeee raw piece bytes");
    }
}
