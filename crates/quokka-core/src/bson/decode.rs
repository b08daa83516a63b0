use crate::bson::{tag, MAX_DOCUMENT_LEN};
use crate::error::{Error, Result};
use crate::types::{Array, Document, ObjectId, Regex, Value};

pub(crate) fn decode_document(buf: &[u8]) -> Result<Document> {
    let mut r = Reader::new(buf);
    let doc = r.read_document()?;
    if r.remaining() != 0 {
        return Err(r.error("trailing bytes after document"));
    }
    Ok(doc)
}

/// A cursor over the input that reports failures with their byte offset.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Decode {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.error(format!("unexpected end of input, need {n} bytes")));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// NUL-terminated UTF-8 with no embedded NUL.
    fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("unterminated cstring"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| self.error(format!("invalid UTF-8 in cstring: {e}")))?
            .to_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Length-prefixed string: int32 length including the trailing NUL.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(self.error(format!("invalid string length {len}")));
        }
        let payload = self.take(len as usize)?;
        let (body, terminator) = payload.split_at(len as usize - 1);
        if terminator != [0] {
            return Err(self.error("string is not NUL-terminated"));
        }
        let s = std::str::from_utf8(body)
            .map_err(|e| self.error(format!("invalid UTF-8 in string: {e}")))?;
        Ok(s.to_owned())
    }

    fn read_document(&mut self) -> Result<Document> {
        let start = self.pos;
        let len = self.read_i32()?;
        if len < 5 {
            return Err(self.error(format!("invalid document length {len}")));
        }
        if len as usize > MAX_DOCUMENT_LEN {
            return Err(Error::DocumentTooLarge {
                len: len as usize,
                max: MAX_DOCUMENT_LEN,
            });
        }
        if self.buf.len() - start < len as usize {
            return Err(self.error(format!("document length {len} exceeds input")));
        }
        let end = start + len as usize;

        let mut doc = Document::new();
        loop {
            let t = self.read_u8()?;
            if t == 0 {
                break;
            }
            let key = self.read_cstring()?;
            if doc.contains_key(&key) {
                return Err(self.error(format!("duplicate key {key:?}")));
            }
            let value = self.read_value(t)?;
            doc.set(key, value);
        }

        if self.pos != end {
            return Err(self.error(format!(
                "document length mismatch: declared {len}, consumed {}",
                self.pos - start
            )));
        }
        Ok(doc)
    }

    fn read_array(&mut self) -> Result<Array> {
        // An array is a document whose keys are the decimal indices 0..n-1.
        let doc = self.read_document()?;
        let mut arr = Array::with_capacity(doc.len());
        for (i, (key, value)) in doc.iter().enumerate() {
            if key.parse::<usize>() != Ok(i) {
                return Err(self.error(format!("array index {i} has key {key:?}")));
            }
            arr.push(value.clone());
        }
        Ok(arr)
    }

    fn read_value(&mut self, t: u8) -> Result<Value> {
        match t {
            tag::DOUBLE => Ok(Value::Double(self.read_f64()?)),
            tag::STRING => Ok(Value::String(self.read_string()?)),
            tag::DOCUMENT => Ok(Value::Document(self.read_document()?)),
            tag::ARRAY => Ok(Value::Array(self.read_array()?)),
            tag::OBJECT_ID => {
                let b = self.take(12)?;
                let mut bytes = [0u8; 12];
                bytes.copy_from_slice(b);
                Ok(Value::ObjectId(ObjectId::from_bytes(bytes)))
            }
            tag::BOOL => match self.read_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                b => Err(self.error(format!("unexpected bool byte {b:#04x}"))),
            },
            tag::DATE_TIME => {
                let millis = self.read_i64()?;
                Value::date_time_from_millis(millis)
                    .ok_or_else(|| self.error(format!("datetime {millis} out of range")))
            }
            tag::NULL => Ok(Value::Null),
            tag::REGEX => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Ok(Value::Regex(Regex { pattern, options }))
            }
            tag::INT32 => Ok(Value::Int32(self.read_i32()?)),
            tag::INT64 => Ok(Value::Int64(self.read_i64()?)),
            tag::BINARY => Err(self.error("unsupported BSON type binary")),
            tag::UNDEFINED => Err(self.error("unsupported BSON type undefined")),
            tag::DB_POINTER => Err(self.error("unsupported BSON type dbPointer")),
            tag::CODE => Err(self.error("unsupported BSON type code")),
            tag::SYMBOL => Err(self.error("unsupported BSON type symbol")),
            tag::CODE_WITH_SCOPE => Err(self.error("unsupported BSON type codeWScope")),
            tag::TIMESTAMP => Err(self.error("unsupported BSON type timestamp")),
            tag::DECIMAL128 => Err(self.error("unsupported BSON type decimal128")),
            tag::MIN_KEY => Err(self.error("unsupported BSON type minKey")),
            tag::MAX_KEY => Err(self.error("unsupported BSON type maxKey")),
            other => Err(self.error(format!("invalid BSON type byte {other:#04x}"))),
        }
    }
}
