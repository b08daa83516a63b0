//! BSON binary codec.
//!
//! Implements the subset of the BSON spec covered by the value model: double,
//! string, embedded document, array, bool, UTC datetime, null, int32, int64,
//! ObjectId and regex. All integers are little-endian. A document is a total
//! length prefix (including itself and the trailing `0x00`), a list of
//! `(type byte, cstring key, value)` elements, and a `0x00` terminator.
//!
//! Decoding is strict: truncated input, length mismatches, invalid type
//! bytes and non-UTF-8 strings all fail with [`Error::Decode`] carrying the
//! byte offset. Types outside the model (binary, undefined, decimal128, ...)
//! are recognized by tag and rejected.

mod decode;
mod encode;

use bytes::Bytes;

use crate::error::Result;
use crate::types::Document;

/// Maximum encoded document size, enforced on both encode and decode.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

pub(crate) mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOL: u8 = 0x08;
    pub const DATE_TIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const DB_POINTER: u8 = 0x0C;
    pub const CODE: u8 = 0x0D;
    pub const SYMBOL: u8 = 0x0E;
    pub const CODE_WITH_SCOPE: u8 = 0x0F;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const DECIMAL128: u8 = 0x13;
    pub const MIN_KEY: u8 = 0xFF;
    pub const MAX_KEY: u8 = 0x7F;
}

/// Encodes a document to its canonical binary form.
pub fn encode_document(doc: &Document) -> Result<Bytes> {
    encode::encode_document(doc)
}

/// Decodes a document from `buf`, which must contain exactly one document.
pub fn decode_document(buf: &[u8]) -> Result<Document> {
    decode::decode_document(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::error::Error;
    use crate::types::{Array, ObjectId, Regex, Value};

    fn round_trip(doc: &Document) {
        let bytes = encode_document(doc).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(&decoded, doc);
    }

    #[test]
    fn empty_document() {
        let bytes = encode_document(&Document::new()).unwrap();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, 0]);
        round_trip(&Document::new());
    }

    #[test]
    fn length_prefix_matches_encoded_length() {
        let doc = doc! { "a": "x", "n": 7i32, "ok": 1.0 };
        let bytes = encode_document(&doc).unwrap();
        let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len());
    }

    #[test]
    fn scalar_round_trips() {
        let oid = ObjectId::new();
        let doc = doc! {
            "double": 4.125,
            "string": "héllo",
            "doc": doc! { "nested": true },
            "array": Array::from(vec![Value::Int32(1), Value::String("two".into())]),
            "bool": false,
            "date": Value::date_time_from_millis(1_654_642_409_123).unwrap(),
            "null": Value::Null,
            "int32": -42i32,
            "int64": i64::MAX,
            "oid": oid,
            "regex": Regex::new("^A", "i"),
        };
        round_trip(&doc);
    }

    #[test]
    fn handshake_document_round_trips() {
        let doc = doc! {
            "ismaster": true,
            "maxBsonObjectSize": 16_777_216i32,
            "minWireVersion": 13i32,
            "maxWireVersion": 13i32,
            "ok": 1.0,
        };
        round_trip(&doc);
    }

    #[test]
    fn truncated_input_fails_with_offset() {
        let bytes = encode_document(&doc! { "a": 1i32 }).unwrap();
        for end in 1..bytes.len() - 1 {
            let err = decode_document(&bytes[..end]).unwrap_err();
            assert!(matches!(err, Error::Decode { .. }), "end={end}: {err}");
        }
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut bytes = encode_document(&doc! { "a": 1i32 }).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(
            decode_document(&bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut bytes = encode_document(&doc! { "a": 1i32 }).unwrap().to_vec();
        bytes[0] += 1;
        assert!(matches!(
            decode_document(&bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn unsupported_type_byte_rejected() {
        // {<0x05> "b": ...}: binary is recognized but unsupported.
        let mut bytes = encode_document(&doc! { "b": 1i32 }).unwrap().to_vec();
        bytes[4] = super::tag::BINARY;
        let err = decode_document(&bytes).unwrap_err();
        match err {
            Error::Decode { message, .. } => assert!(message.contains("binary")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_type_byte_rejected() {
        let mut bytes = encode_document(&doc! { "b": 1i32 }).unwrap().to_vec();
        bytes[4] = 0x42;
        assert!(matches!(
            decode_document(&bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn non_utf8_string_rejected() {
        let mut bytes = encode_document(&doc! { "s": "ab" }).unwrap().to_vec();
        // Corrupt the first byte of the string payload.
        let payload = bytes.len() - 4;
        bytes[payload] = 0xFF;
        assert!(matches!(
            decode_document(&bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn bool_with_invalid_byte_rejected() {
        let mut bytes = encode_document(&doc! { "b": true }).unwrap().to_vec();
        let payload = bytes.len() - 2;
        bytes[payload] = 2;
        assert!(matches!(
            decode_document(&bytes),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn array_indices_are_validated() {
        // Encode {"a": [7]} then corrupt the element key "0" to "1".
        let arr = Array::from(vec![Value::Int32(7)]);
        let bytes = encode_document(&doc! { "a": arr }).unwrap().to_vec();
        let mut corrupted = bytes.clone();
        let pos = corrupted
            .windows(2)
            .position(|w| w == [b'0', 0])
            .unwrap();
        corrupted[pos] = b'1';
        assert!(decode_document(&bytes).is_ok());
        assert!(matches!(
            decode_document(&corrupted),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn oversize_document_rejected_on_decode() {
        let mut bytes = encode_document(&doc! { "a": 1i32 }).unwrap().to_vec();
        let huge = (MAX_DOCUMENT_LEN as i32 + 1).to_le_bytes();
        bytes[..4].copy_from_slice(&huge);
        assert!(decode_document(&bytes).is_err());
    }
}
