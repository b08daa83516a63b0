use bytes::{BufMut, BytesMut};

use quokka_core::bson;
use quokka_core::error::{Error, Result};
use quokka_core::types::Document;

/// OP_QUERY (2004). Only served for the legacy handshake
/// (`admin.$cmd` / `isMaster`); stock drivers use OP_MSG for everything
/// else.
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// The `db.collection` namespace split at the first dot.
    pub fn namespace(&self) -> (&str, &str) {
        match self.full_collection_name.split_once('.') {
            Some((db, coll)) => (db, coll),
            None => ("", self.full_collection_name.as_str()),
        }
    }

    pub(crate) fn decode(body: &[u8]) -> Result<OpQuery> {
        let err = |offset: usize, message: String| Error::Decode { offset, message };

        if body.len() < 4 {
            return Err(err(0, "OP_QUERY body shorter than its flags".into()));
        }
        let flags = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let mut pos = 4;

        let nul = body[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| err(pos, "unterminated collection name".into()))?;
        let full_collection_name = std::str::from_utf8(&body[pos..pos + nul])
            .map_err(|e| err(pos, format!("invalid collection name: {e}")))?
            .to_owned();
        pos += nul + 1;

        if body.len() - pos < 8 {
            return Err(err(pos, "OP_QUERY truncated before its counters".into()));
        }
        let number_to_skip = i32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        let number_to_return = i32::from_le_bytes(body[pos + 4..pos + 8].try_into().unwrap());
        pos += 8;

        let query_len = document_len(body, pos)?;
        let query = bson::decode_document(&body[pos..pos + query_len])?;
        pos += query_len;

        let return_fields_selector = if pos < body.len() {
            let selector_len = document_len(body, pos)?;
            let selector = bson::decode_document(&body[pos..pos + selector_len])?;
            pos += selector_len;
            Some(selector)
        } else {
            None
        };

        if pos != body.len() {
            return Err(err(pos, "trailing bytes after OP_QUERY".into()));
        }

        Ok(OpQuery {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }

    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.flags);
        buf.put_slice(self.full_collection_name.as_bytes());
        buf.put_u8(0);
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        buf.extend_from_slice(&bson::encode_document(&self.query)?);
        if let Some(selector) = &self.return_fields_selector {
            buf.extend_from_slice(&bson::encode_document(selector)?);
        }
        Ok(buf)
    }
}

fn document_len(body: &[u8], pos: usize) -> Result<usize> {
    if body.len() - pos < 4 {
        return Err(Error::Decode {
            offset: pos,
            message: "truncated document length".into(),
        });
    }
    let len = i32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
    if len < 5 || len as usize > body.len() - pos {
        return Err(Error::Decode {
            offset: pos,
            message: format!("invalid document length {len}"),
        });
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quokka_core::doc;

    #[test]
    fn namespace_splits_at_first_dot() {
        let q = OpQuery {
            flags: 0,
            full_collection_name: "admin.$cmd".into(),
            number_to_skip: 0,
            number_to_return: -1,
            query: doc! { "ismaster": 1i32 },
            return_fields_selector: None,
        };
        assert_eq!(q.namespace(), ("admin", "$cmd"));
    }

    #[test]
    fn selector_is_optional() {
        let q = OpQuery {
            flags: 0,
            full_collection_name: "db.coll".into(),
            number_to_skip: 0,
            number_to_return: 1,
            query: doc! { "a": 1i32 },
            return_fields_selector: Some(doc! { "b": 1i32 }),
        };
        let body = q.encode().unwrap();
        let decoded = OpQuery::decode(&body).unwrap();
        assert_eq!(decoded, q);
    }
}
