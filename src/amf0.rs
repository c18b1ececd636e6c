//! Thin wrapper around the external `rml_amf0` value codec.
//!
//! The source's argument-list parsing loop relies on AMF0 decode raising
//! `EOFError` to know when it has run out of values (`common.py`'s
//! `Command.fromMessage`). `rml_amf0::deserialize` already returns a
//! `Vec<Amf0Value>` for a whole buffer instead of one value at a time, so
//! there's no end-of-stream exception to translate — decoding a command's
//! payload is a single bounded call rather than a `loop { read() }`. This
//! module exists mainly to give the rest of the crate one funnel for AMF0
//! I/O and a place to hang failure-crate-flavored errors around it.

use std::io::Cursor;

use failure::{Error, ResultExt};
pub use rml_amf0::Amf0Value;

/// Decodes every AMF0 value in `buf` (a whole AMF0 Command/Data message
/// payload), in wire order. Returns an empty `Vec` for an empty payload.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Amf0Value>, Error> {
    let mut cursor = Cursor::new(buf);
    rml_amf0::deserialize(&mut cursor).context("AMF0 decode error")
        .map_err(Error::from)
}

/// Encodes `values` in order into a single AMF0 byte buffer.
pub fn encode_all(values: &[Amf0Value]) -> Result<Vec<u8>, Error> {
    rml_amf0::serialize(values).context("AMF0 encode error")
        .map_err(Error::from)
}

/// Pulls the `n`th value out of an already-decoded list, or `None` if the
/// list is shorter — the bounded, non-exceptional replacement for the
/// source's `read_one_or_eof` walk over command arguments.
pub fn read_one_or_eof(values: &[Amf0Value], n: usize) -> Option<&Amf0Value> {
    values.get(n)
}

pub fn as_f64(v: &Amf0Value) -> Option<f64> {
    match v {
        Amf0Value::Number(n) => Some(*n),
        _ => None,
    }
}

pub fn as_str(v: &Amf0Value) -> Option<&str> {
    match v {
        Amf0Value::Utf8String(s) => Some(s.as_str()),
        _ => None,
    }
}

pub fn object_get<'a>(v: &'a Amf0Value, key: &str) -> Option<&'a Amf0Value> {
    match v {
        Amf0Value::Object(map) => map.get(key),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_command_like_values() {
        let values = vec![
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(1.0),
        ];
        let bytes = encode_all(&values).unwrap();
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn read_one_or_eof_is_bounded() {
        let values = vec![Amf0Value::Number(1.0)];
        assert!(read_one_or_eof(&values, 0).is_some());
        assert!(read_one_or_eof(&values, 1).is_none());
    }
}
