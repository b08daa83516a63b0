//! The per-connection state machine.
//!
//! Each accepted connection cycles Reading → Dispatching → Writing until
//! EOF, a fatal decode error or shutdown. Requests are strictly sequential
//! within a connection; replies carry `responseTo` equal to the request's
//! `requestID` so pipelining clients can match them up.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use quokka_wire as wire;

use crate::backend::Backend;
use crate::metrics;

fn opcode_label(op: wire::OpCode) -> &'static str {
    match op {
        wire::OpCode::Query => "op_query",
        wire::OpCode::Reply => "op_reply",
        wire::OpCode::Msg => "op_msg",
    }
}

/// Runs the request loop until the peer goes away, a transport error occurs
/// or the token fires. Transport errors close the connection; command errors
/// were already rendered into the reply by the router.
pub async fn run_connection<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    mut backend: Box<dyn Backend>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(peer = %peer_addr, "connection cancelled");
                break;
            }
            read = wire::read_message(&mut stream) => read,
        };

        let (header, msg) = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(peer = %peer_addr, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "dropping connection: bad frame");
                break;
            }
        };

        metrics::REQUESTS_TOTAL
            .with_label_values(&[opcode_label(header.op_code)])
            .inc();
        tracing::trace!(
            peer = %peer_addr,
            request_id = header.request_id,
            opcode = opcode_label(header.op_code),
            "request"
        );

        let reply = tokio::select! {
            _ = token.cancelled() => {
                // Aborting mid-command: write nothing, close the socket.
                tracing::debug!(peer = %peer_addr, "cancelled in flight");
                break;
            }
            reply = backend.handle(&header, &msg, peer_addr) => reply,
        };

        let (reply_header, reply_msg) = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "dropping connection");
                break;
            }
        };

        debug_assert_eq!(reply_header.response_to, header.request_id);

        if let Err(e) = wire::write_message(
            &mut stream,
            reply_header.request_id,
            reply_header.response_to,
            &reply_msg,
        )
        .await
        {
            tracing::warn!(peer = %peer_addr, error = %e, "dropping connection: write failed");
            break;
        }
    }
}
