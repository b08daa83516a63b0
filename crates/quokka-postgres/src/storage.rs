//! Document operations against the shared connection pool.

use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::fjson;
use quokka_core::types::{Document, ObjectId, Value};

use crate::projection::Projection;
use crate::update::{apply_update, upsert_document};
use crate::where_clause::{where_clause, Placeholder, SqlArg};
use crate::{is_undefined_schema, is_undefined_table, map_sqlx, Namespace};

/// PostgreSQL-backed document storage.
///
/// Wraps a `sqlx::PgPool`; the pool is internally synchronized and shared by
/// every connection task.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub matched: i64,
    pub modified: i64,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindAndModifyResult {
    /// The pre- or post-image, per the `new` flag.
    pub value: Option<Document>,
    pub updated_existing: bool,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbStats {
    pub collections: i64,
    pub objects: i64,
    pub data_size: i64,
}

impl PgStorage {
    /// Connects to PostgreSQL and verifies the connection.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(map_sqlx)?;
        Ok(PgStorage { pool })
    }

    /// Builds storage over a pool that connects on first use. Startup does
    /// not touch the network; useful for tests and proxy-only setups.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(url)
            .map_err(map_sqlx)?;
        Ok(PgStorage { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStorage { pool }
    }

    /// Creates the schema and table backing a collection if missing.
    async fn ensure_table(&self, ns: &Namespace) -> Result<()> {
        tracing::debug!(ns = %ns.dotted(), "ensuring backing table");
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", ns.db()))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (_jsonb jsonb NOT NULL)",
            ns.qualified()
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn find(
        &self,
        ns: &Namespace,
        filter: &Document,
        projection: &Projection,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let mut p = Placeholder::new();
        let (select, mut args) = projection.select_sql(&mut p);
        let (where_sql, where_args) = where_clause(filter, &mut p)?;
        args.extend(where_args);

        let mut sql = format!("SELECT {select} FROM {}{where_sql}", ns.qualified());
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", p.next()));
            args.push(SqlArg::Int8(n));
        }

        let rows = match bind(sqlx::query(&sql), &args).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => return Ok(Vec::new()),
            Err(e) => return Err(map_sqlx(e)),
        };

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(decode_row(&row)?);
        }
        projection.apply(&mut docs);
        Ok(docs)
    }

    pub async fn count(&self, ns: &Namespace, filter: &Document) -> Result<i64> {
        let mut p = Placeholder::new();
        let (where_sql, args) = where_clause(filter, &mut p)?;
        let sql = format!("SELECT COUNT(*) FROM {}{where_sql}", ns.qualified());

        let row = match bind(sqlx::query(&sql), &args).fetch_one(&self.pool).await {
            Ok(row) => row,
            Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => return Ok(0),
            Err(e) => return Err(map_sqlx(e)),
        };
        row.try_get::<i64, _>(0).map_err(map_sqlx)
    }

    /// Inserts documents, generating an ObjectId `_id` where absent.
    /// Returns the number of documents written.
    pub async fn insert(&self, ns: &Namespace, documents: Vec<Document>) -> Result<i32> {
        self.ensure_table(ns).await?;

        let mut n = 0;
        for mut doc in documents {
            if !doc.contains_key("_id") {
                doc.set("_id", ObjectId::new());
            }
            let encoded = fjson::encode_document(&doc)?;
            let sql = format!("INSERT INTO {} (_jsonb) VALUES ($1)", ns.qualified());
            bind(sqlx::query(&sql), &[SqlArg::Jsonb(encoded)])
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            n += 1;
        }
        Ok(n)
    }

    /// Applies an update to matching documents, optionally inserting a
    /// seeded document when nothing matched and `upsert` is set.
    pub async fn update(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let limit = if multi { None } else { Some(1) };
        let matches = self.find(ns, filter, &Projection::All, limit).await?;

        if matches.is_empty() {
            if !upsert {
                return Ok(UpdateResult {
                    matched: 0,
                    modified: 0,
                    upserted_id: None,
                });
            }
            let doc = upsert_document(filter, update)?;
            let upserted_id = doc.get("_id").cloned();
            self.insert(ns, vec![doc]).await?;
            return Ok(UpdateResult {
                matched: 0,
                modified: 0,
                upserted_id,
            });
        }

        let mut modified = 0;
        for doc in &matches {
            let rewritten = apply_update(doc, update)?;
            if &rewritten == doc {
                continue;
            }
            self.rewrite(ns, doc, &rewritten).await?;
            modified += 1;
        }

        Ok(UpdateResult {
            matched: matches.len() as i64,
            modified,
            upserted_id: None,
        })
    }

    /// Replaces a stored document, keyed by its `_id`.
    async fn rewrite(&self, ns: &Namespace, old: &Document, new: &Document) -> Result<()> {
        let id = old
            .get("_id")
            .ok_or_else(|| Error::Storage("stored document has no _id".into()))?;
        let sql = format!(
            "UPDATE {} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
            ns.qualified()
        );
        let args = [
            SqlArg::Jsonb(fjson::encode_document(new)?),
            SqlArg::Jsonb(fjson::encode(id)?),
        ];
        bind(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// Deletes matching documents and returns how many were removed.
    pub async fn delete(&self, ns: &Namespace, filter: &Document, limit_one: bool) -> Result<i64> {
        let mut p = Placeholder::new();
        let (where_sql, args) = where_clause(filter, &mut p)?;

        let sql = if limit_one {
            format!(
                "DELETE FROM {table} WHERE ctid IN (SELECT ctid FROM {table}{where_sql} LIMIT 1)",
                table = ns.qualified()
            )
        } else {
            format!("DELETE FROM {}{where_sql}", ns.qualified())
        };

        match bind(sqlx::query(&sql), &args).execute(&self.pool).await {
            Ok(done) => Ok(done.rows_affected() as i64),
            Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => Ok(0),
            Err(e) => Err(map_sqlx(e)),
        }
    }

    /// Atomically modifies (or removes) at most one matching document.
    ///
    /// The remove form is a single `DELETE ... RETURNING`. The update form
    /// runs in a transaction because update operators are applied in the
    /// gateway: `SELECT ... FOR UPDATE`, rewrite, `UPDATE`.
    pub async fn find_and_modify(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: Option<&Document>,
        remove: bool,
        new: bool,
        upsert: bool,
    ) -> Result<FindAndModifyResult> {
        if remove {
            let mut p = Placeholder::new();
            let (where_sql, args) = where_clause(filter, &mut p)?;
            let sql = format!(
                "DELETE FROM {table} WHERE ctid IN (SELECT ctid FROM {table}{where_sql} LIMIT 1) RETURNING _jsonb",
                table = ns.qualified()
            );
            let row = match bind(sqlx::query(&sql), &args)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(row) => row,
                Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => None,
                Err(e) => return Err(map_sqlx(e)),
            };
            let value = row.as_ref().map(decode_row).transpose()?;
            return Ok(FindAndModifyResult {
                updated_existing: value.is_some(),
                value,
                upserted_id: None,
            });
        }

        let update = update.ok_or_else(|| {
            Error::command(ErrorCode::FailedToParse, "either an update or remove=true must be specified")
        })?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let mut p = Placeholder::new();
        let (where_sql, args) = where_clause(filter, &mut p)?;
        let sql = format!(
            "SELECT _jsonb FROM {}{where_sql} LIMIT 1 FOR UPDATE",
            ns.qualified()
        );
        let row = match bind(sqlx::query(&sql), &args).fetch_optional(&mut *tx).await {
            Ok(row) => row,
            Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => None,
            Err(e) => return Err(map_sqlx(e)),
        };

        match row {
            Some(row) => {
                let old = decode_row(&row)?;
                let rewritten = apply_update(&old, update)?;

                let id = old
                    .get("_id")
                    .ok_or_else(|| Error::Storage("stored document has no _id".into()))?;
                let sql = format!(
                    "UPDATE {} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
                    ns.qualified()
                );
                let args = [
                    SqlArg::Jsonb(fjson::encode_document(&rewritten)?),
                    SqlArg::Jsonb(fjson::encode(id)?),
                ];
                bind(sqlx::query(&sql), &args)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                tx.commit().await.map_err(map_sqlx)?;

                Ok(FindAndModifyResult {
                    value: Some(if new { rewritten } else { old }),
                    updated_existing: true,
                    upserted_id: None,
                })
            }
            None => {
                tx.commit().await.map_err(map_sqlx)?;
                if !upsert {
                    return Ok(FindAndModifyResult {
                        value: None,
                        updated_existing: false,
                        upserted_id: None,
                    });
                }
                let doc = upsert_document(filter, update)?;
                let upserted_id = doc.get("_id").cloned();
                self.insert(ns, vec![doc.clone()]).await?;
                Ok(FindAndModifyResult {
                    value: if new { Some(doc) } else { None },
                    updated_existing: false,
                    upserted_id,
                })
            }
        }
    }

    /// Explicit collection creation; a no-op when it already exists, which
    /// matches the lazy creation done by insert.
    pub async fn create_collection(&self, ns: &Namespace) -> Result<()> {
        self.ensure_table(ns).await
    }

    pub async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        match sqlx::query(&format!("DROP TABLE {}", ns.qualified()))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_undefined_table(&e) || is_undefined_schema(&e) => Err(Error::command(
                ErrorCode::NamespaceNotFound,
                "ns not found",
            )),
            Err(e) => Err(map_sqlx(e)),
        }
    }

    /// Drops a database. Returns `false` when it did not exist, which is not
    /// an error for `dropDatabase`.
    pub async fn drop_database(&self, db: &str) -> Result<bool> {
        crate::validate_name("database", db)?;
        match sqlx::query(&format!("DROP SCHEMA \"{db}\" CASCADE"))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_undefined_schema(&e) => Ok(false),
            Err(e) => Err(map_sqlx(e)),
        }
    }

    pub async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        crate::validate_name("database", db)?;
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(db.to_owned())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(map_sqlx))
            .collect()
    }

    /// All document databases with their on-disk sizes in bytes.
    pub async fn list_databases(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT n.nspname, COALESCE(SUM(pg_total_relation_size(c.oid)), 0)::int8 \
             FROM pg_namespace n \
             LEFT JOIN pg_class c ON c.relnamespace = n.oid AND c.relkind = 'r' \
             WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema' \
             GROUP BY n.nspname ORDER BY n.nspname",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>(0).map_err(map_sqlx)?,
                    row.try_get::<i64, _>(1).map_err(map_sqlx)?,
                ))
            })
            .collect()
    }

    pub async fn db_stats(&self, db: &str) -> Result<DbStats> {
        crate::validate_name("database", db)?;
        let row = sqlx::query(
            "SELECT COUNT(*)::int8, COALESCE(SUM(c.reltuples), 0)::float8, \
             COALESCE(SUM(pg_total_relation_size(c.oid)), 0)::int8 \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relkind = 'r'",
        )
        .bind(db.to_owned())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(DbStats {
            collections: row.try_get::<i64, _>(0).map_err(map_sqlx)?,
            objects: row.try_get::<f64, _>(1).map_err(map_sqlx)? as i64,
            data_size: row.try_get::<i64, _>(2).map_err(map_sqlx)?,
        })
    }
}

/// Decodes the single `_jsonb` column of a result row.
fn decode_row(row: &PgRow) -> Result<Document> {
    let json: serde_json::Value = row.try_get(0).map_err(map_sqlx)?;
    fjson::decode_document(&json)
}

/// Binds a compiled argument list onto a query in placeholder order.
fn bind<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    args: &[SqlArg],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Text(v) => query.bind(v.clone()),
            SqlArg::Int4(v) => query.bind(*v),
            SqlArg::Int8(v) => query.bind(*v),
            SqlArg::Float8(v) => query.bind(*v),
            SqlArg::Bool(v) => query.bind(*v),
            SqlArg::Jsonb(v) => query.bind(v.clone()),
            SqlArg::TextArray(v) => query.bind(v.clone()),
        };
    }
    query
}
