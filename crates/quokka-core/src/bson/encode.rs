use bytes::{BufMut, Bytes, BytesMut};

use crate::bson::{tag, MAX_DOCUMENT_LEN};
use crate::error::{Error, Result};
use crate::types::{Array, Document, Value};

pub(crate) fn encode_document(doc: &Document) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    write_document(&mut buf, doc)?;
    if buf.len() > MAX_DOCUMENT_LEN {
        return Err(Error::DocumentTooLarge {
            len: buf.len(),
            max: MAX_DOCUMENT_LEN,
        });
    }
    Ok(buf.freeze())
}

fn write_document(buf: &mut BytesMut, doc: &Document) -> Result<()> {
    let start = buf.len();
    buf.put_i32_le(0); // length, backfilled below
    for (key, value) in doc.iter() {
        write_element(buf, key, value)?;
    }
    buf.put_u8(0);

    let len = buf.len() - start;
    if len > MAX_DOCUMENT_LEN {
        return Err(Error::DocumentTooLarge {
            len,
            max: MAX_DOCUMENT_LEN,
        });
    }
    buf[start..start + 4].copy_from_slice(&(len as i32).to_le_bytes());
    Ok(())
}

fn write_array(buf: &mut BytesMut, arr: &Array) -> Result<()> {
    let start = buf.len();
    buf.put_i32_le(0);
    for (i, value) in arr.iter().enumerate() {
        write_element(buf, &i.to_string(), value)?;
    }
    buf.put_u8(0);

    let len = buf.len() - start;
    buf[start..start + 4].copy_from_slice(&(len as i32).to_le_bytes());
    Ok(())
}

fn write_element(buf: &mut BytesMut, key: &str, value: &Value) -> Result<()> {
    buf.put_u8(type_byte(value));
    write_cstring(buf, key)?;
    match value {
        Value::Double(f) => buf.put_f64_le(*f),
        Value::String(s) => write_string(buf, s)?,
        Value::Document(d) => write_document(buf, d)?,
        Value::Array(a) => write_array(buf, a)?,
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::DateTime(dt) => buf.put_i64_le(dt.timestamp_millis()),
        Value::Null => {}
        Value::Int32(n) => buf.put_i32_le(*n),
        Value::Int64(n) => buf.put_i64_le(*n),
        Value::ObjectId(oid) => buf.put_slice(oid.as_bytes()),
        Value::Regex(re) => {
            write_cstring(buf, &re.pattern)?;
            write_cstring(buf, &re.options)?;
        }
    }
    Ok(())
}

fn type_byte(value: &Value) -> u8 {
    match value {
        Value::Double(_) => tag::DOUBLE,
        Value::String(_) => tag::STRING,
        Value::Document(_) => tag::DOCUMENT,
        Value::Array(_) => tag::ARRAY,
        Value::Bool(_) => tag::BOOL,
        Value::DateTime(_) => tag::DATE_TIME,
        Value::Null => tag::NULL,
        Value::Int32(_) => tag::INT32,
        Value::Int64(_) => tag::INT64,
        Value::ObjectId(_) => tag::OBJECT_ID,
        Value::Regex(_) => tag::REGEX,
    }
}

fn write_cstring(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::Validation(format!(
            "cstring {s:?} contains a NUL byte"
        )));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = s.len() + 1;
    if len > i32::MAX as usize {
        return Err(Error::Validation("string too long".into()));
    }
    buf.put_i32_le(len as i32);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}
