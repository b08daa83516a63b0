use bytes::{BufMut, BytesMut};

use quokka_core::bson;
use quokka_core::error::{Error, Result};
use quokka_core::types::Document;

/// `responseFlags` bit 1: the query failed and a single error document
/// follows.
pub const REPLY_FLAG_QUERY_FAILURE: i32 = 1 << 1;
/// `responseFlags` bit 3: AwaitCapable, always set by servers that support
/// tailable cursors; harmless and expected by some drivers.
pub const REPLY_FLAG_AWAIT_CAPABLE: i32 = 1 << 3;

/// OP_REPLY (1). Emitted only in response to OP_QUERY.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    /// A single-document reply, the only form the gateway produces.
    pub fn with_document(doc: Document) -> Self {
        OpReply {
            response_flags: REPLY_FLAG_AWAIT_CAPABLE,
            cursor_id: 0,
            starting_from: 0,
            number_returned: 1,
            documents: vec![doc],
        }
    }

    pub(crate) fn decode(body: &[u8]) -> Result<OpReply> {
        let err = |offset: usize, message: String| Error::Decode { offset, message };

        if body.len() < 20 {
            return Err(err(0, "OP_REPLY body shorter than its fixed fields".into()));
        }
        let response_flags = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
        let starting_from = i32::from_le_bytes(body[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());

        let mut documents = Vec::new();
        let mut pos = 20;
        while pos < body.len() {
            if body.len() - pos < 4 {
                return Err(err(pos, "truncated document length".into()));
            }
            let len = i32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
            if len < 5 || len as usize > body.len() - pos {
                return Err(err(pos, format!("invalid document length {len}")));
            }
            documents.push(bson::decode_document(&body[pos..pos + len as usize])?);
            pos += len as usize;
        }

        if number_returned as usize != documents.len() {
            return Err(err(
                16,
                format!(
                    "numberReturned is {number_returned} but {} documents follow",
                    documents.len()
                ),
            ));
        }

        Ok(OpReply {
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub(crate) fn encode(&self) -> Result<BytesMut> {
        if self.number_returned as usize != self.documents.len() {
            return Err(Error::Validation(format!(
                "numberReturned is {} but the reply carries {} documents",
                self.number_returned,
                self.documents.len()
            )));
        }
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.response_flags);
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.number_returned);
        for doc in &self.documents {
            buf.extend_from_slice(&bson::encode_document(doc)?);
        }
        Ok(buf)
    }
}
