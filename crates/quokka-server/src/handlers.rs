//! Command handlers.
//!
//! Stateless handlers serve the handshake and diagnostic commands; storage
//! handlers parse their command document, call into [`PgStorage`] and build
//! the reply. Handlers return plain result documents; the router owns the
//! error envelope.

use chrono::Utc;

use quokka_core::bson;
use quokka_core::doc;
use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::types::{Array, Document, Value};
use quokka_postgres::{Namespace, PgStorage, Projection};
use quokka_wire::MAX_MSG_LEN;

use crate::command::{registry, Command, CommandResult, Request};
use crate::version::{gateway_version, MONGODB_VERSION, MONGODB_VERSION_ARRAY};

/// The handshake document shared by `hello`, `isMaster` and the OP_QUERY
/// handshake path.
pub fn hello_document() -> Document {
    doc! {
        "helloOk": true,
        "ismaster": true,
        "maxBsonObjectSize": bson::MAX_DOCUMENT_LEN as i32,
        "maxMessageSizeBytes": MAX_MSG_LEN as i32,
        "maxWriteBatchSize": 100_000i32,
        "localTime": Utc::now(),
        "minWireVersion": 13i32,
        "maxWireVersion": 13i32,
        "readOnly": false,
        "ok": 1.0,
    }
}

pub async fn msg_hello(_req: &Request<'_>) -> CommandResult {
    Ok(hello_document())
}

pub async fn msg_build_info(_req: &Request<'_>) -> CommandResult {
    let mut version_array = Array::with_capacity(4);
    for part in MONGODB_VERSION_ARRAY {
        version_array.push(part);
    }
    Ok(doc! {
        "version": MONGODB_VERSION,
        "gitVersion": gateway_version(),
        "modules": Array::new(),
        "sysInfo": "deprecated",
        "versionArray": version_array,
        "bits": 64i32,
        "debug": false,
        "maxBsonObjectSize": bson::MAX_DOCUMENT_LEN as i32,
        "ok": 1.0,
    })
}

pub async fn msg_ping(_req: &Request<'_>) -> CommandResult {
    Ok(doc! { "ok": 1.0 })
}

pub async fn msg_whats_my_uri(req: &Request<'_>) -> CommandResult {
    Ok(doc! { "you": req.peer_addr.to_string(), "ok": 1.0 })
}

pub async fn msg_get_cmd_line_opts(_req: &Request<'_>) -> CommandResult {
    Ok(doc! {
        "argv": Array::from(vec![Value::String("quokkadb".into())]),
        "parsed": Document::new(),
        "ok": 1.0,
    })
}

pub async fn msg_get_parameter(_req: &Request<'_>) -> CommandResult {
    Ok(doc! { "version": MONGODB_VERSION, "ok": 1.0 })
}

pub async fn msg_get_log(req: &Request<'_>) -> CommandResult {
    let wants_startup_warnings = matches!(
        req.document.get("getLog").or_else(|| req.document.get("getlog")),
        Some(Value::String(s)) if s == "startupWarnings"
    );

    let mut log = Array::new();
    if wants_startup_warnings {
        log.push(format!(
            "Powered by QuokkaDB {}. Documents live in PostgreSQL.",
            gateway_version()
        ));
    }
    Ok(doc! {
        "totalLinesWritten": log.len() as i32,
        "log": log,
        "ok": 1.0,
    })
}

pub async fn msg_connection_status(_req: &Request<'_>) -> CommandResult {
    Ok(doc! {
        "authInfo": doc! {
            "authenticatedUsers": Array::new(),
            "authenticatedUserRoles": Array::new(),
        },
        "ok": 1.0,
    })
}

pub async fn msg_authenticate(_req: &Request<'_>) -> CommandResult {
    // Real authentication is a non-goal; drivers expect an ok to proceed.
    Ok(doc! { "ok": 1.0 })
}

pub async fn msg_get_last_error(_req: &Request<'_>) -> CommandResult {
    Ok(doc! { "n": 0i32, "err": Value::Null, "ok": 1.0 })
}

pub async fn msg_users_info(_req: &Request<'_>) -> CommandResult {
    Ok(doc! { "users": Array::new(), "ok": 1.0 })
}

pub async fn msg_roles_info(_req: &Request<'_>) -> CommandResult {
    Ok(doc! { "roles": Array::new(), "ok": 1.0 })
}

pub async fn msg_host_info(_req: &Request<'_>) -> CommandResult {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    Ok(doc! {
        "system": doc! {
            "currentTime": Utc::now(),
            "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            "cpuAddrSize": 64i32,
            "numCores": cores,
        },
        "os": doc! { "type": std::env::consts::OS },
        "ok": 1.0,
    })
}

pub async fn msg_list_commands(_req: &Request<'_>) -> CommandResult {
    let mut names: Vec<&Command> = registry().values().collect();
    names.sort_by_key(|c| c.name);

    let mut commands = Document::with_capacity(names.len());
    for command in names {
        commands.set(command.name, doc! { "help": command.help });
    }
    Ok(doc! { "commands": commands, "ok": 1.0 })
}

pub async fn msg_debug_error(_req: &Request<'_>) -> CommandResult {
    Err(Error::Storage("debug_error".into()))
}

pub async fn msg_debug_panic(_req: &Request<'_>) -> CommandResult {
    panic!("debug_panic");
}

// ---------------------------------------------------------------------------
// Storage handlers
// ---------------------------------------------------------------------------

/// Extracts the `db.collection` namespace: the command's own value is the
/// collection, `$db` the database.
fn namespace(document: &Document) -> Result<Namespace> {
    let command = document
        .command_name()
        .ok_or_else(|| Error::command(ErrorCode::BadValue, "request document is empty"))?;
    let collection = match document.get(command) {
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(Error::command(
                ErrorCode::TypeMismatch,
                format!(
                    "collection name has invalid type {}",
                    other.type_name()
                ),
            ));
        }
        None => unreachable!("command_name() returned a key"),
    };
    let db = match document.get("$db") {
        Some(Value::String(s)) => s,
        _ => {
            return Err(Error::command(ErrorCode::FailedToParse, "no $db"));
        }
    };
    Namespace::new(db, collection)
}

fn document_field<'a>(document: &'a Document, key: &str) -> Result<Option<&'a Document>> {
    match document.get(key) {
        None => Ok(None),
        Some(Value::Document(d)) => Ok(Some(d)),
        Some(other) => Err(Error::command(
            ErrorCode::TypeMismatch,
            format!("{key} has invalid type {}", other.type_name()),
        )),
    }
}

fn array_field<'a>(document: &'a Document, key: &str) -> Result<&'a Array> {
    match document.get(key) {
        Some(Value::Array(a)) => Ok(a),
        Some(other) => Err(Error::command(
            ErrorCode::TypeMismatch,
            format!("{key} has invalid type {}", other.type_name()),
        )),
        None => Err(Error::command(
            ErrorCode::FailedToParse,
            format!("missing required field {key}"),
        )),
    }
}

fn bool_field(document: &Document, key: &str) -> Result<bool> {
    match document.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(v) => match v.as_whole_number() {
            Some(n) => Ok(n != 0),
            None => Err(Error::command(
                ErrorCode::TypeMismatch,
                format!("{key} has invalid type {}", v.type_name()),
            )),
        },
    }
}

fn cursor_reply(ns: &Namespace, batch: Array) -> Document {
    doc! {
        "cursor": doc! {
            "id": 0i64,
            "ns": ns.dotted(),
            "firstBatch": batch,
        },
        "ok": 1.0,
    }
}

/// `find` and `count` share parsing; they differ only in the SQL aggregate
/// and the reply shape.
pub async fn msg_find_or_count(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let document = req.document;
    let is_count = document
        .command_name()
        .is_some_and(|c| c.eq_ignore_ascii_case("count"));
    let ns = namespace(document)?;

    let empty = Document::new();
    let filter = document_field(document, "filter")?
        .or(document_field(document, "query")?)
        .unwrap_or(&empty);

    if is_count {
        let n = storage.count(&ns, filter).await?;
        return Ok(doc! { "n": n as i32, "ok": 1.0 });
    }

    let projection = Projection::parse(document_field(document, "projection")?)?;
    let limit = match document.get("limit") {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_whole_number() {
            Some(0) => None,
            Some(n) if n > 0 => Some(n),
            _ => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    "limit must be a non-negative number",
                ));
            }
        },
    };

    let docs = storage.find(&ns, filter, &projection, limit).await?;
    let batch: Array = docs.into_iter().map(Value::Document).collect();
    Ok(cursor_reply(&ns, batch))
}

pub async fn msg_insert(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let ns = namespace(req.document)?;
    let documents = array_field(req.document, "documents")?;

    let mut batch = Vec::with_capacity(documents.len());
    for value in documents.iter() {
        match value {
            Value::Document(d) => batch.push(d.clone()),
            other => {
                return Err(Error::command(
                    ErrorCode::TypeMismatch,
                    format!("documents element has invalid type {}", other.type_name()),
                ));
            }
        }
    }

    let n = storage.insert(&ns, batch).await?;
    Ok(doc! { "n": n, "ok": 1.0 })
}

pub async fn msg_update(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let ns = namespace(req.document)?;
    let updates = array_field(req.document, "updates")?;

    let mut n = 0i64;
    let mut n_modified = 0i64;
    let mut upserted = Array::new();

    for (index, value) in updates.iter().enumerate() {
        let update = match value {
            Value::Document(d) => d,
            other => {
                return Err(Error::command(
                    ErrorCode::TypeMismatch,
                    format!("updates element has invalid type {}", other.type_name()),
                ));
            }
        };

        let empty = Document::new();
        let filter = document_field(update, "q")?.unwrap_or(&empty);
        let u = document_field(update, "u")?.ok_or_else(|| {
            Error::command(ErrorCode::FailedToParse, "missing required field u")
        })?;
        let multi = bool_field(update, "multi")?;
        let upsert = bool_field(update, "upsert")?;

        let result = storage.update(&ns, filter, u, multi, upsert).await?;
        n += result.matched;
        n_modified += result.modified;
        if let Some(id) = result.upserted_id {
            n += 1;
            upserted.push(Value::Document(doc! { "index": index as i32, "_id": id }));
        }
    }

    let mut reply = doc! { "n": n as i32 };
    if !upserted.is_empty() {
        reply.set("upserted", upserted);
    }
    reply.set("nModified", n_modified as i32);
    reply.set("ok", 1.0);
    Ok(reply)
}

pub async fn msg_delete(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let ns = namespace(req.document)?;
    let deletes = array_field(req.document, "deletes")?;

    let mut n = 0i64;
    for value in deletes.iter() {
        let delete = match value {
            Value::Document(d) => d,
            other => {
                return Err(Error::command(
                    ErrorCode::TypeMismatch,
                    format!("deletes element has invalid type {}", other.type_name()),
                ));
            }
        };
        let empty = Document::new();
        let filter = document_field(delete, "q")?.unwrap_or(&empty);
        let limit_one = match delete.get("limit") {
            None | Some(Value::Null) => false,
            Some(v) => v.as_whole_number() == Some(1),
        };
        n += storage.delete(&ns, filter, limit_one).await?;
    }

    Ok(doc! { "n": n as i32, "ok": 1.0 })
}

pub async fn msg_find_and_modify(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let document = req.document;
    let ns = namespace(document)?;

    let empty = Document::new();
    let filter = document_field(document, "query")?.unwrap_or(&empty);
    let update = document_field(document, "update")?;
    let remove = bool_field(document, "remove")?;
    let new = bool_field(document, "new")?;
    let upsert = bool_field(document, "upsert")?;

    if remove && update.is_some() {
        return Err(Error::command(
            ErrorCode::FailedToParse,
            "cannot specify both an update and remove=true",
        ));
    }

    let result = storage
        .find_and_modify(&ns, filter, update, remove, new, upsert)
        .await?;

    let n: i32 = if result.value.is_some() || result.upserted_id.is_some() {
        1
    } else {
        0
    };
    let mut last_error = doc! { "n": n, "updatedExisting": result.updated_existing };
    if let Some(id) = result.upserted_id {
        last_error.set("upserted", id);
    }

    Ok(doc! {
        "lastErrorObject": last_error,
        "value": result.value.map(Value::Document).unwrap_or(Value::Null),
        "ok": 1.0,
    })
}

pub async fn msg_create(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let ns = namespace(req.document)?;
    storage.create_collection(&ns).await?;
    Ok(doc! { "ok": 1.0 })
}

pub async fn msg_drop(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let ns = namespace(req.document)?;
    storage.drop_collection(&ns).await?;
    Ok(doc! { "ns": ns.dotted(), "ok": 1.0 })
}

pub async fn msg_drop_database(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let db = match req.document.get("$db") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(Error::command(ErrorCode::FailedToParse, "no $db")),
    };
    let dropped = storage.drop_database(&db).await?;
    let mut reply = Document::new();
    if dropped {
        reply.set("dropped", db);
    }
    reply.set("ok", 1.0);
    Ok(reply)
}

pub async fn msg_list_collections(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let document = req.document;
    if document_field(document, "filter")?.is_some_and(|f| !f.is_empty()) {
        return Err(Error::command(
            ErrorCode::NotImplemented,
            "listCollections: filter is not supported",
        ));
    }

    let db = match document.get("$db") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(Error::command(ErrorCode::FailedToParse, "no $db")),
    };

    let mut batch = Array::new();
    for name in storage.list_collections(&db).await? {
        batch.push(Value::Document(doc! { "name": name, "type": "collection" }));
    }

    Ok(doc! {
        "cursor": doc! {
            "id": 0i64,
            "ns": format!("{db}.$cmd.listCollections"),
            "firstBatch": batch,
        },
        "ok": 1.0,
    })
}

pub async fn msg_list_databases(storage: &PgStorage, _req: &Request<'_>) -> CommandResult {
    let mut databases = Array::new();
    let mut total_size = 0i64;
    for (name, size) in storage.list_databases().await? {
        total_size += size;
        databases.push(Value::Document(doc! {
            "name": name,
            "sizeOnDisk": size,
            "empty": size == 0,
        }));
    }

    Ok(doc! {
        "databases": databases,
        "totalSize": total_size,
        "ok": 1.0,
    })
}

pub async fn msg_db_stats(storage: &PgStorage, req: &Request<'_>) -> CommandResult {
    let db = match req.document.get("$db") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(Error::command(ErrorCode::FailedToParse, "no $db")),
    };
    let stats = storage.db_stats(&db).await?;
    Ok(doc! {
        "db": db,
        "collections": stats.collections as i32,
        "objects": stats.objects,
        "dataSize": stats.data_size,
        "ok": 1.0,
    })
}

pub async fn msg_create_indexes(_storage: &PgStorage, _req: &Request<'_>) -> CommandResult {
    // Secondary indexes are not supported; acknowledge so shell helpers and
    // ODMs that insist on creating indexes keep working.
    Ok(doc! { "ok": 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn request(document: &Document) -> Request<'_> {
        Request {
            document,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
        }
    }

    #[tokio::test]
    async fn hello_reports_wire_versions() {
        let doc = doc! { "hello": 1i32 };
        let reply = msg_hello(&request(&doc)).await.unwrap();
        assert_eq!(reply.get("ismaster"), Some(&Value::Bool(true)));
        assert_eq!(reply.get("helloOk"), Some(&Value::Bool(true)));
        assert_eq!(
            reply.get("maxBsonObjectSize"),
            Some(&Value::Int32(16_777_216))
        );
        assert_eq!(reply.get("minWireVersion"), Some(&Value::Int32(13)));
        assert_eq!(reply.get("maxWireVersion"), Some(&Value::Int32(13)));
        assert_eq!(reply.get("ok"), Some(&Value::Double(1.0)));
    }

    #[tokio::test]
    async fn whatsmyuri_echoes_peer() {
        let doc = doc! { "whatsmyuri": 1i32 };
        let reply = msg_whats_my_uri(&request(&doc)).await.unwrap();
        assert_eq!(
            reply.get("you"),
            Some(&Value::String("127.0.0.1:40000".into()))
        );
    }

    #[tokio::test]
    async fn get_log_startup_warnings() {
        let doc = doc! { "getLog": "startupWarnings" };
        let reply = msg_get_log(&request(&doc)).await.unwrap();
        let log = reply.get("log").unwrap().as_array().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(reply.get("totalLinesWritten"), Some(&Value::Int32(1)));
    }

    #[tokio::test]
    async fn list_commands_covers_registry() {
        let doc = doc! { "listCommands": 1i32 };
        let reply = msg_list_commands(&request(&doc)).await.unwrap();
        let commands = reply.get("commands").unwrap().as_document().unwrap();
        assert_eq!(commands.len(), registry().len());
        assert!(commands.get("find").is_some());
    }

    #[test]
    fn namespace_extraction() {
        let doc = doc! { "find": "values", "$db": "test" };
        let ns = namespace(&doc).unwrap();
        assert_eq!(ns.dotted(), "test.values");

        let doc = doc! { "find": 1i32, "$db": "test" };
        assert!(matches!(
            namespace(&doc),
            Err(Error::Command(ErrorCode::TypeMismatch, _))
        ));

        let doc = doc! { "find": "values" };
        assert!(matches!(
            namespace(&doc),
            Err(Error::Command(ErrorCode::FailedToParse, _))
        ));
    }

    #[test]
    fn bool_field_accepts_numbers() {
        let doc = doc! { "upsert": 1i32, "multi": false, "new": 1.0 };
        assert!(bool_field(&doc, "upsert").unwrap());
        assert!(!bool_field(&doc, "multi").unwrap());
        assert!(bool_field(&doc, "new").unwrap());
        assert!(!bool_field(&doc, "missing").unwrap());
        let doc = doc! { "upsert": "yes" };
        assert!(bool_field(&doc, "upsert").is_err());
    }
}
