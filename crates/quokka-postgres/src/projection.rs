//! Projection compilation and post-filtering.
//!
//! Inclusion and exclusion are mutually exclusive, except that `_id` may
//! appear in either form. Exclusion compiles to `SELECT` of the whole
//! document and the excluded fields are removed from the decoded documents
//! in place; inclusion compiles to a jsonb expression that rebuilds the
//! stored object from the included key set, keeping the key-order
//! bookkeeping consistent.

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::types::{Document, Value};

use crate::where_clause::{Placeholder, SqlArg};

/// Compiled form of a projection document.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// No projection: select the document as is.
    All,
    /// Inclusion: the listed top-level fields (plus `_id` unless excluded).
    Include(Vec<String>),
    /// Exclusion: everything but the listed fields (paths allowed).
    Exclude(Vec<String>),
}

impl Projection {
    /// Parses and validates a projection document.
    pub fn parse(projection: Option<&Document>) -> Result<Projection> {
        let Some(projection) = projection else {
            return Ok(Projection::All);
        };
        if projection.is_empty() {
            return Ok(Projection::All);
        }

        let inclusion = is_inclusion(projection)?;

        if inclusion {
            let mut fields = Vec::new();
            let mut id_excluded = false;
            for (key, value) in projection.iter() {
                let include = truthy(key, value)?;
                if key == "_id" {
                    id_excluded = !include;
                    continue;
                }
                if key.contains('.') {
                    return Err(Error::command(
                        ErrorCode::NotImplemented,
                        format!("projection on nested path {key:?} is not implemented"),
                    ));
                }
                fields.push(key.to_owned());
            }
            if !id_excluded {
                fields.insert(0, "_id".to_owned());
            }
            Ok(Projection::Include(fields))
        } else {
            let mut fields = Vec::new();
            for (key, value) in projection.iter() {
                // Only `_id: 1` can appear with a truthy value here; it means
                // "keep _id", which exclusion does anyway.
                if truthy(key, value)? {
                    continue;
                }
                fields.push(key.to_owned());
            }
            Ok(Projection::Exclude(fields))
        }
    }

    /// The SQL select expression for the document column.
    pub fn select_sql(&self, p: &mut Placeholder) -> (String, Vec<SqlArg>) {
        match self {
            Projection::All | Projection::Exclude(_) => ("_jsonb".to_owned(), Vec::new()),
            Projection::Include(fields) => {
                // Drop the not-included members, then rewrite "$k" to the
                // surviving keys so the stored bookkeeping stays valid.
                let keys = p.next();
                let keys_again = p.next();
                let sql = format!(
                    "jsonb_set(_jsonb - ARRAY(SELECT k FROM jsonb_array_elements_text(_jsonb->'$k') AS k \
                     WHERE NOT k = ANY({keys})), ARRAY['$k'], \
                     (SELECT COALESCE(jsonb_agg(k), '[]'::jsonb) FROM jsonb_array_elements_text(_jsonb->'$k') AS k \
                     WHERE k = ANY({keys_again})))"
                );
                let args = vec![
                    SqlArg::TextArray(fields.clone()),
                    SqlArg::TextArray(fields.clone()),
                ];
                (sql, args)
            }
        }
    }

    /// Applies the gateway-side part of the projection to decoded documents.
    pub fn apply(&self, docs: &mut [Document]) {
        if let Projection::Exclude(fields) = self {
            for doc in docs {
                for field in fields {
                    exclude_path(doc, field);
                }
            }
        }
    }
}

/// Removes `path` from `doc`; for a dotted path, removes the deepest matched
/// field and leaves parents untouched. Unresolved paths are no-ops.
fn exclude_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Document(inner)) = doc.get_mut(head) {
                exclude_path(inner, rest);
            }
        }
    }
}

/// Whether the projection is an inclusion, rejecting mixed modes.
fn is_inclusion(projection: &Document) -> Result<bool> {
    let mut inclusion = None;
    for (key, value) in projection.iter() {
        let include = truthy(key, value)?;
        if key == "_id" {
            continue;
        }
        match inclusion {
            None => inclusion = Some(include),
            Some(previous) if previous != include => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    if include {
                        format!("Cannot do inclusion on field {key} in exclusion projection")
                    } else {
                        format!("Cannot do exclusion on field {key} in inclusion projection")
                    },
                ));
            }
            Some(_) => {}
        }
    }
    // A projection of only `_id` follows the _id value's own mode.
    match inclusion {
        Some(inclusion) => Ok(inclusion),
        None => truthy("_id", projection.get("_id").unwrap()),
    }
}

/// Interprets a projection value: booleans, or numbers where zero excludes.
fn truthy(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int32(n) => Ok(*n != 0),
        Value::Int64(n) => Ok(*n != 0),
        Value::Double(f) => Ok(*f != 0.0),
        other => Err(Error::command(
            ErrorCode::BadValue,
            format!("unsupported projection value for {key}: {}", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quokka_core::doc;
    use quokka_core::types::ObjectId;

    #[test]
    fn empty_projection_selects_all() {
        assert_eq!(Projection::parse(None).unwrap(), Projection::All);
        assert_eq!(
            Projection::parse(Some(&doc! {})).unwrap(),
            Projection::All
        );
    }

    #[test]
    fn exclusion_lists_fields() {
        let proj = Projection::parse(Some(&doc! { "b": 0i32, "c": false })).unwrap();
        assert_eq!(
            proj,
            Projection::Exclude(vec!["b".to_owned(), "c".to_owned()])
        );
        let mut p = Placeholder::new();
        let (sql, args) = proj.select_sql(&mut p);
        assert_eq!(sql, "_jsonb");
        assert!(args.is_empty());
    }

    #[test]
    fn inclusion_includes_id_by_default() {
        let proj = Projection::parse(Some(&doc! { "a": 1i32 })).unwrap();
        assert_eq!(
            proj,
            Projection::Include(vec!["_id".to_owned(), "a".to_owned()])
        );
    }

    #[test]
    fn inclusion_can_drop_id() {
        let proj = Projection::parse(Some(&doc! { "a": true, "_id": 0i32 })).unwrap();
        assert_eq!(proj, Projection::Include(vec!["a".to_owned()]));
    }

    #[test]
    fn mixed_modes_rejected() {
        let err = Projection::parse(Some(&doc! { "a": 1i32, "b": 0i32 })).unwrap_err();
        match err {
            Error::Command(ErrorCode::BadValue, _) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn id_may_join_either_mode() {
        assert!(Projection::parse(Some(&doc! { "_id": 0i32, "a": 1i32 })).is_ok());
        assert!(Projection::parse(Some(&doc! { "_id": 1i32, "a": 0i32 })).is_ok());
    }

    #[test]
    fn nonzero_doubles_include() {
        let proj = Projection::parse(Some(&doc! { "a": 1.0 })).unwrap();
        assert!(matches!(proj, Projection::Include(_)));
        let proj = Projection::parse(Some(&doc! { "a": 0.0 })).unwrap();
        assert!(matches!(proj, Projection::Exclude(_)));
    }

    #[test]
    fn non_numeric_projection_value_rejected() {
        assert!(Projection::parse(Some(&doc! { "a": "yes" })).is_err());
    }

    #[test]
    fn nested_inclusion_not_implemented() {
        let err = Projection::parse(Some(&doc! { "a.b": 1i32 })).unwrap_err();
        match err {
            Error::Command(ErrorCode::NotImplemented, _) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn inclusion_sql_binds_keys_twice() {
        let proj = Projection::parse(Some(&doc! { "a": 1i32 })).unwrap();
        let mut p = Placeholder::new();
        let (sql, args) = proj.select_sql(&mut p);
        assert!(sql.contains("$1") && sql.contains("$2"));
        assert_eq!(p.count(), 2);
        assert_eq!(args.len(), 2);
        assert_eq!(
            args[0],
            SqlArg::TextArray(vec!["_id".to_owned(), "a".to_owned()])
        );
    }

    #[test]
    fn exclusion_removes_fields_in_place() {
        let oid = ObjectId::new();
        let mut docs = vec![doc! { "_id": oid, "a": 1i32, "b": 2i32, "c": 3i32 }];
        let proj = Projection::parse(Some(&doc! { "b": 0i32 })).unwrap();
        proj.apply(&mut docs);
        assert_eq!(docs[0], doc! { "_id": oid, "a": 1i32, "c": 3i32 });
    }

    #[test]
    fn nested_exclusion_removes_deepest_field_only() {
        let mut docs = vec![doc! {
            "a": doc! { "b": doc! { "c": 1i32, "d": 2i32 }, "e": 3i32 },
            "f": 4i32,
        }];
        let proj = Projection::parse(Some(&doc! { "a.b.c": 0i32 })).unwrap();
        proj.apply(&mut docs);
        assert_eq!(
            docs[0],
            doc! {
                "a": doc! { "b": doc! { "d": 2i32 }, "e": 3i32 },
                "f": 4i32,
            }
        );
    }

    #[test]
    fn unresolved_nested_exclusion_is_a_noop() {
        let mut docs = vec![doc! { "a": 1i32 }];
        let proj = Projection::parse(Some(&doc! { "x.y": 0i32 })).unwrap();
        proj.apply(&mut docs);
        assert_eq!(docs[0], doc! { "a": 1i32 });
    }
}
