//! MongoDB wire protocol framing.
//!
//! Every message starts with a header of four little-endian int32s:
//! `messageLength` (total bytes including the header), `requestID`,
//! `responseTo` and `opCode`. Three opcodes are live:
//!
//! - [`OpQuery`] (2004), used by legacy drivers for the initial handshake;
//! - [`OpReply`] (1), emitted only in response to OP_QUERY;
//! - [`OpMsg`] (2013), everything else, with optional CRC-32C checksum.
//!
//! Decoding is strict: size mismatches, trailing bytes and unknown opcodes
//! are errors, and the caller is expected to close the connection. For any
//! valid message, `encode(decode(M)) == M` byte for byte.

mod op_msg;
mod op_query;
mod op_reply;

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{BufMut, BytesMut};
use crc::Crc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use quokka_core::error::{Error, Result};

pub use op_msg::{OpMsg, OpMsgSection, FLAG_CHECKSUM_PRESENT, FLAG_EXHAUST_ALLOWED, FLAG_MORE_TO_COME};
pub use op_query::OpQuery;
pub use op_reply::{OpReply, REPLY_FLAG_AWAIT_CAPABLE, REPLY_FLAG_QUERY_FAILURE};

/// Maximum wire message size, larger than the document limit to leave room
/// for batches and framing.
pub const MAX_MSG_LEN: usize = 48 * 1024 * 1024;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 16;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocates a fresh `requestID` for an outgoing message.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    Msg = 2013,
}

impl OpCode {
    fn from_i32(code: i32) -> Result<Self> {
        match code {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Msg),
            other => Err(Error::Decode {
                offset: 12,
                message: format!("unknown opcode {other}"),
            }),
        }
    }
}

/// The fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

/// A decoded wire message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(OpQuery),
    Reply(OpReply),
    Msg(OpMsg),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::Reply(_) => OpCode::Reply,
            Message::Msg(_) => OpCode::Msg,
        }
    }
}

/// Reads one complete framed message.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary. EOF in the
/// middle of a message, an oversize length, an unknown opcode or a malformed
/// body are all errors.
pub async fn read_message<R>(r: &mut R) -> Result<Option<(MsgHeader, Message)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let n = r.read(&mut header_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    r.read_exact(&mut header_buf[n..]).await.map_err(|e| Error::Decode {
        offset: n,
        message: format!("eof inside message header: {e}"),
    })?;

    let message_length = i32::from_le_bytes(header_buf[0..4].try_into().unwrap());
    let request_id = i32::from_le_bytes(header_buf[4..8].try_into().unwrap());
    let response_to = i32::from_le_bytes(header_buf[8..12].try_into().unwrap());
    let op_code = OpCode::from_i32(i32::from_le_bytes(header_buf[12..16].try_into().unwrap()))?;

    if (message_length as usize) < HEADER_LEN || message_length as usize > MAX_MSG_LEN {
        return Err(Error::Decode {
            offset: 0,
            message: format!("invalid message length {message_length}"),
        });
    }

    let header = MsgHeader {
        message_length,
        request_id,
        response_to,
        op_code,
    };

    let mut body = vec![0u8; message_length as usize - HEADER_LEN];
    r.read_exact(&mut body).await.map_err(|e| Error::Decode {
        offset: HEADER_LEN,
        message: format!("eof inside message body: {e}"),
    })?;

    let message = match op_code {
        OpCode::Query => Message::Query(OpQuery::decode(&body)?),
        OpCode::Reply => Message::Reply(OpReply::decode(&body)?),
        OpCode::Msg => Message::Msg(OpMsg::decode(&header_buf, &body)?),
    };
    Ok(Some((header, message)))
}

/// Encodes `msg` into a single framed buffer with the given ids.
pub fn encode_message(request_id: i32, response_to: i32, msg: &Message) -> Result<BytesMut> {
    let body = match msg {
        Message::Query(q) => q.encode()?,
        Message::Reply(r) => r.encode()?,
        Message::Msg(m) => m.encode_sections()?,
    };

    let with_checksum = matches!(msg, Message::Msg(m) if m.flags & FLAG_CHECKSUM_PRESENT != 0);
    let total = HEADER_LEN + body.len() + if with_checksum { 4 } else { 0 };
    if total > MAX_MSG_LEN {
        return Err(Error::Validation(format!("message of {total} bytes exceeds the limit")));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_i32_le(total as i32);
    buf.put_i32_le(request_id);
    buf.put_i32_le(response_to);
    buf.put_i32_le(msg.op_code() as i32);
    buf.extend_from_slice(&body);
    if with_checksum {
        let checksum = CASTAGNOLI.checksum(&buf);
        buf.put_u32_le(checksum);
    }
    Ok(buf)
}

/// Writes one framed message.
pub async fn write_message<W>(
    w: &mut W,
    request_id: i32,
    response_to: i32,
    msg: &Message,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_message(request_id, response_to, msg)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
