use bytes::{BufMut, BytesMut};

use quokka_core::bson;
use quokka_core::error::{Error, Result};
use quokka_core::types::{Array, Document, Value};

use crate::CASTAGNOLI;

/// Bit 0: a CRC-32C of the whole message (minus the checksum itself) trails
/// the body.
pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
/// Bit 1: more messages follow and no reply is expected yet.
pub const FLAG_MORE_TO_COME: u32 = 1 << 1;
/// Bit 16: the sender is prepared for multiple replies.
pub const FLAG_EXHAUST_ALLOWED: u32 = 1 << 16;

const KNOWN_FLAGS: u32 = FLAG_CHECKSUM_PRESENT | FLAG_MORE_TO_COME | FLAG_EXHAUST_ALLOWED;

/// OP_MSG (2013): `flags:uint32` followed by sections, optionally trailed by
/// a CRC-32C checksum.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpMsg {
    pub flags: u32,
    pub sections: Vec<OpMsgSection>,
}

/// One OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub enum OpMsgSection {
    /// Kind 0: a single document. Exactly one per message.
    Body(Document),
    /// Kind 1: a size-prefixed identifier plus a document stream.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl OpMsg {
    /// A reply message carrying a single body document.
    pub fn from_document(doc: Document) -> Self {
        OpMsg {
            flags: 0,
            sections: vec![OpMsgSection::Body(doc)],
        }
    }

    /// The request document: the body section with every kind-1 sequence
    /// folded in under its identifier as an array.
    pub fn document(&self) -> Result<Document> {
        let mut body = None;
        for section in &self.sections {
            if let OpMsgSection::Body(doc) = section {
                body = Some(doc.clone());
            }
        }
        let mut doc = body.ok_or_else(|| Error::Validation("OP_MSG has no body section".into()))?;

        for section in &self.sections {
            if let OpMsgSection::Sequence {
                identifier,
                documents,
            } = section
            {
                let arr: Array = documents
                    .iter()
                    .cloned()
                    .map(Value::Document)
                    .collect();
                doc.set(identifier.clone(), arr);
            }
        }
        Ok(doc)
    }

    /// Decodes the body (everything after the header). `header` is needed
    /// because the optional trailing checksum covers it too.
    pub(crate) fn decode(header: &[u8], body: &[u8]) -> Result<OpMsg> {
        let err = |offset: usize, message: String| Error::Decode { offset, message };

        if body.len() < 4 {
            return Err(err(0, "OP_MSG body shorter than its flags".into()));
        }
        let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
        if flags & !KNOWN_FLAGS != 0 {
            return Err(err(0, format!("unknown OP_MSG flags {flags:#x}")));
        }

        let sections_end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
            if body.len() < 8 {
                return Err(err(4, "OP_MSG too short for its checksum".into()));
            }
            let end = body.len() - 4;
            let declared = u32::from_le_bytes(body[end..].try_into().unwrap());
            let mut digest = CASTAGNOLI.digest();
            digest.update(header);
            digest.update(&body[..end]);
            let actual = digest.finalize();
            if actual != declared {
                return Err(err(
                    end,
                    format!("checksum mismatch: declared {declared:#010x}, actual {actual:#010x}"),
                ));
            }
            end
        } else {
            body.len()
        };

        let mut sections = Vec::new();
        let mut bodies = 0usize;
        let mut pos = 4;
        while pos < sections_end {
            let kind = body[pos];
            pos += 1;
            match kind {
                0 => {
                    let doc_len = document_len(&body[pos..sections_end], pos)?;
                    let doc = bson::decode_document(&body[pos..pos + doc_len])?;
                    pos += doc_len;
                    bodies += 1;
                    sections.push(OpMsgSection::Body(doc));
                }
                1 => {
                    if sections_end - pos < 4 {
                        return Err(err(pos, "sequence section shorter than its size".into()));
                    }
                    let size =
                        i32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
                    if size < 4 || size > sections_end - pos {
                        return Err(err(pos, format!("invalid sequence section size {size}")));
                    }
                    let section_end = pos + size;
                    let mut inner = pos + 4;

                    let nul = body[inner..section_end]
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or_else(|| err(inner, "unterminated sequence identifier".into()))?;
                    let identifier = std::str::from_utf8(&body[inner..inner + nul])
                        .map_err(|e| err(inner, format!("invalid identifier: {e}")))?
                        .to_owned();
                    inner += nul + 1;

                    let mut documents = Vec::new();
                    while inner < section_end {
                        let doc_len = document_len(&body[inner..section_end], inner)?;
                        documents.push(bson::decode_document(&body[inner..inner + doc_len])?);
                        inner += doc_len;
                    }
                    pos = section_end;
                    sections.push(OpMsgSection::Sequence {
                        identifier,
                        documents,
                    });
                }
                other => {
                    return Err(err(pos - 1, format!("unknown section kind {other}")));
                }
            }
        }

        if bodies != 1 {
            return Err(err(
                4,
                format!("OP_MSG must have exactly one body section, found {bodies}"),
            ));
        }

        Ok(OpMsg { flags, sections })
    }

    /// Encodes flags and sections. The checksum, which also covers the
    /// header, is appended by the framing layer.
    pub(crate) fn encode_sections(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.flags);
        for section in &self.sections {
            match section {
                OpMsgSection::Body(doc) => {
                    buf.put_u8(0);
                    buf.extend_from_slice(&bson::encode_document(doc)?);
                }
                OpMsgSection::Sequence {
                    identifier,
                    documents,
                } => {
                    buf.put_u8(1);
                    let size_at = buf.len();
                    buf.put_i32_le(0);
                    buf.put_slice(identifier.as_bytes());
                    buf.put_u8(0);
                    for doc in documents {
                        buf.extend_from_slice(&bson::encode_document(doc)?);
                    }
                    let size = (buf.len() - size_at) as i32;
                    buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
                }
            }
        }
        Ok(buf)
    }
}

/// Reads the length prefix of a document starting at the head of `buf`.
fn document_len(buf: &[u8], at: usize) -> Result<usize> {
    if buf.len() < 4 {
        return Err(Error::Decode {
            offset: at,
            message: "truncated document length".into(),
        });
    }
    let len = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    if len < 5 || len as usize > buf.len() {
        return Err(Error::Decode {
            offset: at,
            message: format!("invalid document length {len}"),
        });
    }
    Ok(len as usize)
}
