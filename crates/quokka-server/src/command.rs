//! The command router.
//!
//! A static registry maps lowercase command names to handler descriptors.
//! The first key of the request document names the command. Two handler
//! shapes exist: stateless (handshake and diagnostics) and storage (requires
//! the backend pool). The router is the single place where errors and
//! recovered handler panics become the `{ok: 0, errmsg, code, codeName}`
//! wire envelope.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::types::Document;
use quokka_core::doc;
use quokka_postgres::PgStorage;

use crate::handlers;
use crate::metrics;

/// A parsed request as seen by handlers.
pub struct Request<'a> {
    pub document: &'a Document,
    pub peer_addr: SocketAddr,
}

pub type CommandResult = Result<Document>;

type StatelessFn = for<'a> fn(&'a Request<'a>) -> BoxFuture<'a, CommandResult>;
type StorageFn = for<'a> fn(&'a PgStorage, &'a Request<'a>) -> BoxFuture<'a, CommandResult>;

pub enum Handler {
    Stateless(StatelessFn),
    Storage(StorageFn),
}

/// A registry entry: display name, help text and the handler.
pub struct Command {
    pub name: &'static str,
    pub help: &'static str,
    pub handler: Handler,
}

macro_rules! stateless {
    ($name:literal, $help:literal, $f:path) => {
        Command {
            name: $name,
            help: $help,
            handler: Handler::Stateless({
                fn wrap<'a>(req: &'a Request<'a>) -> BoxFuture<'a, CommandResult> {
                    Box::pin($f(req))
                }
                wrap
            }),
        }
    };
}

macro_rules! storage {
    ($name:literal, $help:literal, $f:path) => {
        Command {
            name: $name,
            help: $help,
            handler: Handler::Storage({
                fn wrap<'a>(
                    storage: &'a PgStorage,
                    req: &'a Request<'a>,
                ) -> BoxFuture<'a, CommandResult> {
                    Box::pin($f(storage, req))
                }
                wrap
            }),
        }
    };
}

static COMMANDS: Lazy<HashMap<String, Command>> = Lazy::new(|| {
    let commands = vec![
        stateless!("hello", "Returns the role of the instance.", handlers::msg_hello),
        stateless!("isMaster", "Returns the role of the instance.", handlers::msg_hello),
        stateless!(
            "buildInfo",
            "Returns a summary of the build information.",
            handlers::msg_build_info
        ),
        stateless!("ping", "Returns a pong response.", handlers::msg_ping),
        stateless!(
            "whatsmyuri",
            "Returns the peer address as seen by the server.",
            handlers::msg_whats_my_uri
        ),
        stateless!(
            "getCmdLineOpts",
            "Returns a summary of all runtime and configuration options.",
            handlers::msg_get_cmd_line_opts
        ),
        stateless!(
            "getParameter",
            "Returns the value of the requested parameters.",
            handlers::msg_get_parameter
        ),
        stateless!(
            "getLog",
            "Returns the most recent logged events from memory.",
            handlers::msg_get_log
        ),
        stateless!(
            "connectionStatus",
            "Returns information about the current connection.",
            handlers::msg_connection_status
        ),
        stateless!(
            "authenticate",
            "Accepts any authentication attempt; real authentication is not supported.",
            handlers::msg_authenticate
        ),
        stateless!(
            "getLastError",
            "Does not return the last error. Kept as a workaround for GUI clients.",
            handlers::msg_get_last_error
        ),
        stateless!(
            "usersInfo",
            "Returns a static user list. Kept as a workaround for GUI clients.",
            handlers::msg_users_info
        ),
        stateless!(
            "rolesInfo",
            "Returns a static role list. Kept as a workaround for GUI clients.",
            handlers::msg_roles_info
        ),
        stateless!(
            "hostInfo",
            "Returns a summary of the system information.",
            handlers::msg_host_info
        ),
        stateless!(
            "listCommands",
            "Returns information about the currently supported commands.",
            handlers::msg_list_commands
        ),
        stateless!(
            "debug_error",
            "Returns an error. Used to exercise error reporting.",
            handlers::msg_debug_error
        ),
        stateless!(
            "debug_panic",
            "Panics. Used to exercise panic recovery.",
            handlers::msg_debug_panic
        ),
        storage!(
            "find",
            "Returns documents matched by the query.",
            handlers::msg_find_or_count
        ),
        storage!(
            "count",
            "Returns the count of documents matched by the query.",
            handlers::msg_find_or_count
        ),
        storage!(
            "insert",
            "Inserts documents into the database.",
            handlers::msg_insert
        ),
        storage!(
            "update",
            "Updates documents that are matched by the query.",
            handlers::msg_update
        ),
        storage!(
            "delete",
            "Deletes documents matched by the query.",
            handlers::msg_delete
        ),
        storage!(
            "findAndModify",
            "Finds one document, modifies or removes it, and returns either image.",
            handlers::msg_find_and_modify
        ),
        storage!("create", "Creates the collection.", handlers::msg_create),
        storage!("drop", "Drops the collection.", handlers::msg_drop),
        storage!(
            "dropDatabase",
            "Deletes the database.",
            handlers::msg_drop_database
        ),
        storage!(
            "listCollections",
            "Returns the collections in the database.",
            handlers::msg_list_collections
        ),
        storage!(
            "listDatabases",
            "Returns a summary of all the databases.",
            handlers::msg_list_databases
        ),
        storage!(
            "dbStats",
            "Returns the statistics of the database.",
            handlers::msg_db_stats
        ),
        storage!(
            "createIndexes",
            "Accepts and ignores index creation; secondary indexes are not supported.",
            handlers::msg_create_indexes
        ),
    ];

    commands
        .into_iter()
        .map(|command| (command.name.to_lowercase(), command))
        .collect()
});

/// The command registry, keyed by lowercase command name.
pub fn registry() -> &'static HashMap<String, Command> {
    &COMMANDS
}

/// Routes one request document to its handler and always produces a reply
/// document. Internal errors and panics are converted to the error envelope
/// here; the connection stays usable afterwards.
pub async fn dispatch(storage: &PgStorage, request: &Request<'_>) -> Document {
    let Some(name) = request.document.command_name() else {
        return error_reply(&Error::command(
            ErrorCode::BadValue,
            "request document is empty",
        ));
    };

    let lowered = name.to_lowercase();
    let Some(command) = COMMANDS.get(lowered.as_str()) else {
        metrics::COMMANDS_TOTAL
            .with_label_values(&["unknown", "error"])
            .inc();
        return error_reply(&Error::command(
            ErrorCode::CommandNotFound,
            format!("no such command: '{name}'"),
        ));
    };

    let fut = match command.handler {
        Handler::Stateless(f) => f(request),
        Handler::Storage(f) => f(storage, request),
    };

    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::error!(command = command.name, panic = %message, "handler panicked");
            Err(Error::command(
                ErrorCode::InternalError,
                format!("handler panicked: {message}"),
            ))
        }
    };

    match result {
        Ok(reply) => {
            metrics::COMMANDS_TOTAL
                .with_label_values(&[command.name, "ok"])
                .inc();
            reply
        }
        Err(e) => {
            tracing::warn!(command = command.name, error = %e, "command failed");
            metrics::COMMANDS_TOTAL
                .with_label_values(&[command.name, "error"])
                .inc();
            error_reply(&e)
        }
    }
}

/// Renders an error as the wire envelope.
pub fn error_reply(err: &Error) -> Document {
    let code = err.error_code();
    doc! {
        "ok": 0.0,
        "errmsg": err.to_string(),
        "code": code.code(),
        "codeName": code.code_name(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keys_are_lowercase() {
        for key in registry().keys() {
            assert_eq!(*key, key.to_lowercase());
        }
    }

    #[test]
    fn registry_has_help_for_every_command() {
        for command in registry().values() {
            assert!(!command.help.is_empty(), "{} has no help", command.name);
        }
    }

    #[test]
    fn error_reply_shape() {
        let reply = error_reply(&Error::command(ErrorCode::CommandNotFound, "nope"));
        assert_eq!(
            reply.keys().collect::<Vec<_>>(),
            ["ok", "errmsg", "code", "codeName"]
        );
        assert_eq!(reply.get("code"), Some(&quokka_core::Value::Int32(59)));
        assert_eq!(
            reply.get("codeName"),
            Some(&quokka_core::Value::String("CommandNotFound".into()))
        );
    }
}
