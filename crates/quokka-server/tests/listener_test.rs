//! Wire-level integration tests: a real listener on a loopback socket and a
//! raw client speaking the MongoDB wire protocol.
//!
//! The storage pool is lazy and never touched; these tests only exercise the
//! stateless paths (handshake, diagnostics, the router's error envelopes and
//! panic recovery).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use quokka_core::doc;
use quokka_core::types::{Document, Value};
use quokka_postgres::PgStorage;
use quokka_server::backend::Mode;
use quokka_server::{Listener, ListenerOpts};
use quokka_wire::{next_request_id, Message, OpMsg, OpQuery};

async fn start_server(token: CancellationToken) -> std::net::SocketAddr {
    let storage = PgStorage::connect_lazy("postgres://postgres@127.0.0.1:5432/unused").unwrap();
    let listener = Listener::bind(ListenerOpts {
        listen_addr: "127.0.0.1:0".to_owned(),
        mode: Mode::Normal,
        proxy_addr: "127.0.0.1:37017".to_owned(),
        tls: false,
        test_conn_timeout: Duration::ZERO,
        shutdown_timeout: Duration::ZERO,
    })
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run(storage, token));
    addr
}

async fn send_command(stream: &mut TcpStream, command: Document) -> (i32, Document) {
    let request_id = next_request_id();
    let msg = Message::Msg(OpMsg::from_document(command));
    quokka_wire::write_message(stream, request_id, 0, &msg)
        .await
        .unwrap();

    let (header, reply) = quokka_wire::read_message(stream)
        .await
        .unwrap()
        .expect("server closed the connection");
    assert_eq!(header.response_to, request_id, "reply linkage");

    match reply {
        Message::Msg(op_msg) => (request_id, op_msg.document().unwrap()),
        other => panic!("unexpected reply opcode: {other:?}"),
    }
}

fn assert_error(reply: &Document, code: i32, code_name: &str) {
    assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)), "{reply:?}");
    assert_eq!(reply.get("code"), Some(&Value::Int32(code)), "{reply:?}");
    assert_eq!(
        reply.get("codeName"),
        Some(&Value::String(code_name.into())),
        "{reply:?}"
    );
    assert!(matches!(reply.get("errmsg"), Some(Value::String(_))));
}

#[tokio::test]
async fn op_query_handshake() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request_id = next_request_id();
    let query = Message::Query(OpQuery {
        flags: 0,
        full_collection_name: "admin.$cmd".to_owned(),
        number_to_skip: 0,
        number_to_return: -1,
        query: doc! { "ismaster": 1i32 },
        return_fields_selector: None,
    });
    quokka_wire::write_message(&mut stream, request_id, 0, &query)
        .await
        .unwrap();

    let (header, reply) = quokka_wire::read_message(&mut stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header.response_to, request_id);

    let reply = match reply {
        Message::Reply(reply) => reply,
        other => panic!("expected OP_REPLY, got {other:?}"),
    };
    assert_eq!(reply.number_returned, 1);
    let doc = &reply.documents[0];
    assert_eq!(doc.get("ismaster"), Some(&Value::Bool(true)));
    assert_eq!(doc.get("helloOk"), Some(&Value::Bool(true)));
    assert_eq!(doc.get("maxBsonObjectSize"), Some(&Value::Int32(16_777_216)));
    assert_eq!(doc.get("maxWireVersion"), Some(&Value::Int32(13)));
    assert_eq!(doc.get("minWireVersion"), Some(&Value::Int32(13)));
    assert_eq!(doc.get("ok"), Some(&Value::Double(1.0)));

    token.cancel();
}

#[tokio::test]
async fn ping_over_op_msg() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));

    token.cancel();
}

#[tokio::test]
async fn unknown_command_keeps_connection_open() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "frobnicate": 1i32, "$db": "test" }).await;
    assert_error(&reply, 59, "CommandNotFound");

    // The connection must remain usable.
    let (_, reply) = send_command(&mut stream, doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));

    token.cancel();
}

#[tokio::test]
async fn debug_error_reports_internal_error() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "debug_error": 1i32, "$db": "admin" }).await;
    assert_error(&reply, 1, "InternalError");

    token.cancel();
}

#[tokio::test]
async fn handler_panic_is_recovered() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "debug_panic": 1i32, "$db": "admin" }).await;
    assert_error(&reply, 1, "InternalError");

    // The connection survived the panic.
    let (_, reply) = send_command(&mut stream, doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));

    token.cancel();
}

#[tokio::test]
async fn list_commands_enumerates_registry() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "listCommands": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));
    let commands = reply.get("commands").unwrap().as_document().unwrap();
    for name in ["find", "insert", "update", "delete", "hello"] {
        assert!(commands.get(name).is_some(), "missing {name}");
    }

    token.cancel();
}

#[tokio::test]
async fn command_names_are_case_normalized() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "isMaster": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ismaster"), Some(&Value::Bool(true)));

    token.cancel();
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let token = CancellationToken::new();
    let addr = start_server(token.clone()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (_, reply) = send_command(&mut stream, doc! { "ping": 1i32, "$db": "admin" }).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));

    token.cancel();

    // The server stops reading; the next read observes the close.
    let result = quokka_wire::read_message(&mut stream).await;
    match result {
        Ok(None) => {}
        Ok(Some(_)) => panic!("unexpected message after shutdown"),
        Err(_) => {}
    }
}
