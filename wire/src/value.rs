//! Structured-value encoding for control and payload dictionaries.
//!
//! This module is a thin façade over the CBOR codec: the rest of the stack
//! only ever deals in the four shapes below (integers, byte strings, lists,
//! and string-keyed ordered dictionaries), which keeps the encoded form
//! canonical and trivially portable.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::WireError;

/// A string-keyed, ordered dictionary of values.
pub type Dict = BTreeMap<String, Value>;

/// Structured value supported by the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed integer
    Int(i64),
    /// Opaque byte string
    Bytes(Vec<u8>),
    /// Ordered list of values
    List(Vec<Value>),
    /// String-keyed ordered dictionary
    Dict(Dict),
}

impl Value {
    /// Returns the integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the byte string, if this is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the list elements, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the dictionary, if this is one.
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// Encode a value to bytes.
pub fn encode(value: &Value) -> Bytes {
    let mut buf = Vec::new();
    // Encoding of the shapes above cannot fail; the writer is a Vec.
    let _ = ciborium::into_writer(&to_cbor(value), &mut buf);
    Bytes::from(buf)
}

/// Decode bytes into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, WireError> {
    let raw: ciborium::Value = ciborium::from_reader(bytes).map_err(|_| WireError::Decode)?;
    from_cbor(raw)
}

/// Get an integer out of a dictionary.
pub fn dict_get_int(dict: &Dict, key: &str) -> Option<i64> {
    dict.get(key).and_then(Value::as_int)
}

/// Get a byte string out of a dictionary.
pub fn dict_get_bytes<'a>(dict: &'a Dict, key: &str) -> Option<&'a [u8]> {
    dict.get(key).and_then(Value::as_bytes)
}

/// Get a list out of a dictionary.
pub fn dict_get_list<'a>(dict: &'a Dict, key: &str) -> Option<&'a [Value]> {
    dict.get(key).and_then(Value::as_list)
}

/// Get a byte string out of a dictionary as UTF-8 text.
pub fn dict_get_str(dict: &Dict, key: &str) -> Option<String> {
    dict_get_bytes(dict, key).and_then(|b| String::from_utf8(b.to_vec()).ok())
}

fn to_cbor(value: &Value) -> ciborium::Value {
    match value {
        Value::Int(i) => ciborium::Value::Integer((*i).into()),
        Value::Bytes(b) => ciborium::Value::Bytes(b.clone()),
        Value::List(l) => ciborium::Value::Array(l.iter().map(to_cbor).collect()),
        Value::Dict(d) => ciborium::Value::Map(
            d.iter()
                .map(|(k, v)| (ciborium::Value::Text(k.clone()), to_cbor(v)))
                .collect(),
        ),
    }
}

fn from_cbor(value: ciborium::Value) -> Result<Value, WireError> {
    match value {
        ciborium::Value::Integer(i) => Ok(Value::Int(i.try_into().map_err(|_| WireError::Decode)?)),
        ciborium::Value::Bytes(b) => Ok(Value::Bytes(b)),
        // Text is accepted on input for interoperability but carried as bytes.
        ciborium::Value::Text(t) => Ok(Value::Bytes(t.into_bytes())),
        ciborium::Value::Array(items) => Ok(Value::List(
            items.into_iter().map(from_cbor).collect::<Result<_, _>>()?,
        )),
        ciborium::Value::Map(entries) => {
            let mut dict = Dict::new();
            for (k, v) in entries {
                let key = match k {
                    ciborium::Value::Text(t) => t,
                    _ => return Err(WireError::Decode),
                };
                dict.insert(key, from_cbor(v)?);
            }
            Ok(Value::Dict(dict))
        }
        _ => Err(WireError::Decode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_scalars() {
        for v in [Value::Int(0), Value::Int(-42), Value::Int(i64::MAX)] {
            assert_eq!(decode(&encode(&v)).unwrap(), v);
        }

        let v = Value::Bytes(b"hello".to_vec());
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn test_roundtrip_nested() {
        let mut dict = Dict::new();
        dict.insert("pubkey".into(), Value::Bytes(vec![7u8; 32]));
        dict.insert("keep-alive".into(), Value::Int(30_000));
        dict.insert(
            "send".into(),
            Value::List(vec!["x.echo".into(), Value::Bytes(b"hi".to_vec())]),
        );
        let v = Value::Dict(dict);

        let decoded = decode(&encode(&v)).unwrap();
        assert_eq!(decoded, v);

        let d = decoded.as_dict().unwrap();
        assert_eq!(dict_get_int(d, "keep-alive"), Some(30_000));
        assert_eq!(dict_get_bytes(d, "pubkey"), Some(&[7u8; 32][..]));
        assert_eq!(dict_get_list(d, "send").map(|l| l.len()), Some(2));
    }

    #[test]
    fn test_dict_keys_ordered() {
        let mut dict = Dict::new();
        dict.insert("zebra".into(), Value::Int(1));
        dict.insert("apple".into(), Value::Int(2));

        let decoded = decode(&encode(&Value::Dict(dict))).unwrap();
        let keys: Vec<_> = decoded.as_dict().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["apple".to_string(), "zebra".to_string()]);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(&[0xff, 0x00, 0x13, 0x37]).is_err());
        assert!(decode(b"").is_err());
    }
}
