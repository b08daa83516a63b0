//! The backend abstraction behind the per-connection state machine.
//!
//! The operation mode selects where replies originate: `normal` serves from
//! the SQL-backed router, `proxy` relays frames to an upstream MongoDB, and
//! the diff modes dispatch to both and answer from the named side while
//! logging divergence. Modes are expressed as [`Backend`] implementations
//! rather than conditionals in every handler.

use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_postgres::PgStorage;
use quokka_wire::{
    next_request_id, Message, MsgHeader, OpMsg, OpReply, REPLY_FLAG_QUERY_FAILURE,
};

use crate::command::{dispatch, error_reply, Request};
use crate::handlers::hello_document;

/// Process-wide operation mode, immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Proxy,
    DiffNormal,
    DiffProxy,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Normal, Mode::Proxy, Mode::DiffNormal, Mode::DiffProxy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Proxy => "proxy",
            Mode::DiffNormal => "diff-normal",
            Mode::DiffProxy => "diff-proxy",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown mode {s:?}"))
    }
}

/// Produces exactly one reply per request (header and body), or an error
/// that tears the connection down.
#[async_trait]
pub trait Backend: Send {
    async fn handle(
        &mut self,
        header: &MsgHeader,
        msg: &Message,
        peer_addr: SocketAddr,
    ) -> Result<(MsgHeader, Message)>;
}

/// Builds the per-connection backend for the configured mode.
pub fn backend_for(mode: Mode, storage: PgStorage, proxy_addr: &str) -> Box<dyn Backend> {
    match mode {
        Mode::Normal => Box::new(SqlBackend { storage }),
        Mode::Proxy => Box::new(ProxyBackend::new(proxy_addr.to_owned())),
        Mode::DiffNormal => Box::new(DiffBackend {
            sql: SqlBackend { storage },
            proxy: ProxyBackend::new(proxy_addr.to_owned()),
            primary_is_sql: true,
        }),
        Mode::DiffProxy => Box::new(DiffBackend {
            sql: SqlBackend { storage },
            proxy: ProxyBackend::new(proxy_addr.to_owned()),
            primary_is_sql: false,
        }),
    }
}

fn reply_header(response_to: i32, msg: &Message) -> MsgHeader {
    MsgHeader {
        // Recomputed by the framing layer on write.
        message_length: 0,
        request_id: next_request_id(),
        response_to,
        op_code: msg.op_code(),
    }
}

/// Serves requests from the command router and the SQL storage.
pub struct SqlBackend {
    storage: PgStorage,
}

impl SqlBackend {
    pub fn new(storage: PgStorage) -> Self {
        SqlBackend { storage }
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn handle(
        &mut self,
        header: &MsgHeader,
        msg: &Message,
        peer_addr: SocketAddr,
    ) -> Result<(MsgHeader, Message)> {
        let reply = match msg {
            Message::Query(query) => {
                // Legacy handshake path. Anything else over OP_QUERY gets a
                // QueryFailure reply.
                let (_, collection) = query.namespace();
                let command = query.query.command_name().unwrap_or_default();
                let is_handshake = collection == "$cmd"
                    && matches!(command, "ismaster" | "isMaster" | "hello");

                let reply = if is_handshake {
                    OpReply::with_document(hello_document())
                } else {
                    let err = Error::command(
                        ErrorCode::CommandNotFound,
                        format!("OP_QUERY is no longer supported, used for {command:?}"),
                    );
                    let mut reply = OpReply::with_document(error_reply(&err));
                    reply.response_flags |= REPLY_FLAG_QUERY_FAILURE;
                    reply
                };
                Message::Reply(reply)
            }
            Message::Msg(op_msg) => {
                let document = op_msg.document()?;
                let request = Request {
                    document: &document,
                    peer_addr,
                };
                let reply = dispatch(&self.storage, &request).await;
                Message::Msg(OpMsg::from_document(reply))
            }
            Message::Reply(_) => {
                return Err(Error::Validation("unexpected OP_REPLY from client".into()));
            }
        };

        Ok((reply_header(header.request_id, &reply), reply))
    }
}

/// Relays each request frame to an upstream MongoDB and returns its reply.
pub struct ProxyBackend {
    addr: String,
    upstream: Option<TcpStream>,
}

impl ProxyBackend {
    pub fn new(addr: String) -> Self {
        ProxyBackend {
            addr,
            upstream: None,
        }
    }

    async fn upstream(&mut self) -> Result<&mut TcpStream> {
        if self.upstream.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                Error::Storage(format!("proxy connect to {}: {e}", self.addr))
            })?;
            tracing::debug!(addr = %self.addr, "connected to proxy upstream");
            self.upstream = Some(stream);
        }
        Ok(self.upstream.as_mut().unwrap())
    }
}

#[async_trait]
impl Backend for ProxyBackend {
    async fn handle(
        &mut self,
        header: &MsgHeader,
        msg: &Message,
        _peer_addr: SocketAddr,
    ) -> Result<(MsgHeader, Message)> {
        let stream = self.upstream().await?;
        quokka_wire::write_message(stream, header.request_id, header.response_to, msg).await?;
        match quokka_wire::read_message(stream).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::Storage("proxy upstream closed the connection".into())),
        }
    }
}

/// Dispatches to both the SQL backend and the proxy, logs divergence, and
/// replies from the primary side.
pub struct DiffBackend {
    sql: SqlBackend,
    proxy: ProxyBackend,
    primary_is_sql: bool,
}

#[async_trait]
impl Backend for DiffBackend {
    async fn handle(
        &mut self,
        header: &MsgHeader,
        msg: &Message,
        peer_addr: SocketAddr,
    ) -> Result<(MsgHeader, Message)> {
        let sql = self.sql.handle(header, msg, peer_addr).await;
        let proxy = self.proxy.handle(header, msg, peer_addr).await;

        match (&sql, &proxy) {
            (Ok((_, sql_reply)), Ok((_, proxy_reply))) => {
                if sql_reply != proxy_reply {
                    tracing::warn!(
                        request_id = header.request_id,
                        sql = ?sql_reply,
                        proxy = ?proxy_reply,
                        "diff: replies diverge"
                    );
                }
            }
            (Err(e), _) => tracing::warn!(error = %e, "diff: sql side failed"),
            (_, Err(e)) => tracing::warn!(error = %e, "diff: proxy side failed"),
        }

        if self.primary_is_sql {
            // Best effort on the secondary side; the primary decides.
            sql
        } else {
            proxy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        assert!("sideways".parse::<Mode>().is_err());
    }
}
