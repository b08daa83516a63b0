//! Update-operator application and upsert seeding.
//!
//! MongoDB update operators cannot be pushed down into SQL against a single
//! jsonb column, so the gateway rewrites the whole document: fetch, apply,
//! write back keyed by `_id`.

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::types::{Document, ObjectId, Value};

/// Applies an update specification to a document and returns the rewritten
/// document. `update` is either a set of `$`-operators (`$set`, `$inc`,
/// `$unset`) or a plain replacement document.
pub fn apply_update(doc: &Document, update: &Document) -> Result<Document> {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if has_operators {
        apply_operators(doc, update)
    } else {
        replace_document(doc, update)
    }
}

fn apply_operators(doc: &Document, update: &Document) -> Result<Document> {
    let mut result = doc.clone();
    for (op, spec) in update.iter() {
        let spec = match spec {
            Value::Document(d) => d,
            other => {
                return Err(Error::command(
                    ErrorCode::FailedToParse,
                    format!("{op} needs an object, not {}", other.type_name()),
                ));
            }
        };
        match op {
            "$set" => {
                for (key, value) in spec.iter() {
                    if key == "_id" && doc.get("_id").is_some_and(|id| id != value) {
                        return Err(Error::command(
                            ErrorCode::BadValue,
                            "the _id field cannot be changed",
                        ));
                    }
                    result.set(key, value.clone());
                }
            }
            "$unset" => {
                for (key, _) in spec.iter() {
                    if key == "_id" {
                        return Err(Error::command(
                            ErrorCode::BadValue,
                            "the _id field cannot be removed",
                        ));
                    }
                    result.remove(key);
                }
            }
            "$inc" => {
                for (key, amount) in spec.iter() {
                    if key == "_id" {
                        return Err(Error::command(
                            ErrorCode::BadValue,
                            "the _id field cannot be changed",
                        ));
                    }
                    let incremented = increment(key, result.get(key), amount)?;
                    result.set(key, incremented);
                }
            }
            other => {
                return Err(Error::command(
                    ErrorCode::NotImplemented,
                    format!("update operator {other} is not implemented"),
                ));
            }
        }
    }
    Ok(result)
}

/// A replacement document keeps the original `_id`; supplying a different
/// one is an error.
fn replace_document(doc: &Document, replacement: &Document) -> Result<Document> {
    let id = doc.get("_id");
    if let (Some(id), Some(new_id)) = (id, replacement.get("_id")) {
        if id != new_id {
            return Err(Error::command(
                ErrorCode::BadValue,
                "the _id field cannot be changed",
            ));
        }
    }

    let mut result = Document::with_capacity(replacement.len() + 1);
    if let Some(id) = id {
        result.set("_id", id.clone());
    }
    for (key, value) in replacement.iter() {
        if key == "_id" {
            continue;
        }
        result.set(key, value.clone());
    }
    Ok(result)
}

/// Adds `amount` to the current value of `key`. A missing field is seeded
/// with the amount. int32 sums that overflow widen to int64.
fn increment(key: &str, current: Option<&Value>, amount: &Value) -> Result<Value> {
    let amount = match amount {
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => amount,
        other => {
            return Err(Error::command(
                ErrorCode::TypeMismatch,
                format!(
                    "cannot increment with non-numeric argument: {{{key}: {}}}",
                    other.type_name()
                ),
            ));
        }
    };

    let current = match current {
        None | Some(Value::Null) => return Ok(amount.clone()),
        Some(v) => v,
    };

    let result = match (current, amount) {
        (Value::Int32(a), Value::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Value::Int32(sum),
            None => Value::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Value::Int32(a), Value::Int64(b)) => int64_add(i64::from(*a), *b)?,
        (Value::Int64(a), Value::Int32(b)) => int64_add(*a, i64::from(*b))?,
        (Value::Int64(a), Value::Int64(b)) => int64_add(*a, *b)?,
        (Value::Double(a), Value::Int32(b)) => Value::Double(a + f64::from(*b)),
        (Value::Double(a), Value::Int64(b)) => Value::Double(a + *b as f64),
        (Value::Double(a), Value::Double(b)) => Value::Double(a + b),
        (Value::Int32(a), Value::Double(b)) => Value::Double(f64::from(*a) + b),
        (Value::Int64(a), Value::Double(b)) => Value::Double(*a as f64 + b),
        (other, _) => {
            return Err(Error::command(
                ErrorCode::TypeMismatch,
                format!(
                    "cannot apply $inc to a value of type {} at {key}",
                    other.type_name()
                ),
            ));
        }
    };
    Ok(result)
}

fn int64_add(a: i64, b: i64) -> Result<Value> {
    a.checked_add(b)
        .map(Value::Int64)
        .ok_or_else(|| Error::command(ErrorCode::BadValue, "integer overflow in $inc"))
}

/// Builds the document an upsert inserts when the filter matched nothing.
///
/// Seeds from the equality-only scalar pairs of the filter, layers the
/// update's `$set` on top (a key present in both with a different value is
/// an error), and generates `_id` when neither side supplied one.
pub fn upsert_document(filter: &Document, update: &Document) -> Result<Document> {
    let has_operators = update.keys().any(|k| k.starts_with('$'));

    let mut doc;
    if has_operators {
        doc = Document::new();
        for (key, value) in filter.iter() {
            if key.starts_with('$') {
                continue;
            }
            match value {
                Value::Document(_) | Value::Array(_) => continue,
                _ => doc.set(key, value.clone()),
            }
        }

        if let Some(set) = update.get("$set") {
            let set = match set {
                Value::Document(d) => d,
                other => {
                    return Err(Error::command(
                        ErrorCode::FailedToParse,
                        format!("$set needs an object, not {}", other.type_name()),
                    ));
                }
            };
            for (key, value) in set.iter() {
                if let Some(seeded) = doc.get(key) {
                    if seeded == value {
                        continue;
                    }
                    return Err(Error::command(
                        ErrorCode::BadValue,
                        format!(
                            "field {key} differs between the query and the update document"
                        ),
                    ));
                }
                doc.set(key, value.clone());
            }
        }
    } else {
        // Replacement-style upserts insert the replacement itself.
        doc = update.clone();
    }

    if !doc.contains_key("_id") {
        doc.set("_id", ObjectId::new());
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quokka_core::doc;

    #[test]
    fn set_adds_and_overwrites() {
        let doc = doc! { "_id": 1i32, "a": 1i32 };
        let updated = apply_update(&doc, &doc! { "$set": doc! { "a": 2i32, "b": "x" } }).unwrap();
        assert_eq!(updated, doc! { "_id": 1i32, "a": 2i32, "b": "x" });
    }

    #[test]
    fn set_same_id_is_allowed() {
        let doc = doc! { "_id": 5i32, "a": 1i32 };
        let updated = apply_update(&doc, &doc! { "$set": doc! { "_id": 5i32 } }).unwrap();
        assert_eq!(updated, doc);
    }

    #[test]
    fn set_different_id_rejected() {
        let doc = doc! { "_id": 5i32 };
        let err = apply_update(&doc, &doc! { "$set": doc! { "_id": 6i32 } }).unwrap_err();
        assert!(matches!(err, Error::Command(ErrorCode::BadValue, _)));
    }

    #[test]
    fn unset_removes_fields() {
        let doc = doc! { "_id": 1i32, "a": 1i32, "b": 2i32 };
        let updated = apply_update(&doc, &doc! { "$unset": doc! { "a": "" } }).unwrap();
        assert_eq!(updated, doc! { "_id": 1i32, "b": 2i32 });
    }

    #[test]
    fn unset_id_rejected() {
        let doc = doc! { "_id": 1i32 };
        assert!(apply_update(&doc, &doc! { "$unset": doc! { "_id": "" } }).is_err());
    }

    #[test]
    fn inc_seeds_missing_field() {
        let doc = doc! { "_id": 1i32 };
        let updated = apply_update(&doc, &doc! { "$inc": doc! { "n": 3i32 } }).unwrap();
        assert_eq!(updated.get("n"), Some(&Value::Int32(3)));
    }

    #[test]
    fn inc_adds_in_kind() {
        let doc = doc! { "_id": 1i32, "n": 4i32, "m": 1.5 };
        let updated =
            apply_update(&doc, &doc! { "$inc": doc! { "n": 3i32, "m": 2i32 } }).unwrap();
        assert_eq!(updated.get("n"), Some(&Value::Int32(7)));
        assert_eq!(updated.get("m"), Some(&Value::Double(3.5)));
    }

    #[test]
    fn inc_overflow_widens_to_int64() {
        let doc = doc! { "_id": 1i32, "n": i32::MAX };
        let updated = apply_update(&doc, &doc! { "$inc": doc! { "n": 1i32 } }).unwrap();
        assert_eq!(updated.get("n"), Some(&Value::Int64(i64::from(i32::MAX) + 1)));
    }

    #[test]
    fn inc_on_non_numeric_field_rejected() {
        let doc = doc! { "_id": 1i32, "s": "x" };
        let err = apply_update(&doc, &doc! { "$inc": doc! { "s": 1i32 } }).unwrap_err();
        assert!(matches!(err, Error::Command(ErrorCode::TypeMismatch, _)));
    }

    #[test]
    fn unknown_operator_not_implemented() {
        let doc = doc! { "_id": 1i32 };
        let err = apply_update(&doc, &doc! { "$push": doc! { "a": 1i32 } }).unwrap_err();
        assert!(matches!(err, Error::Command(ErrorCode::NotImplemented, _)));
    }

    #[test]
    fn replacement_keeps_id() {
        let doc = doc! { "_id": 9i32, "a": 1i32, "b": 2i32 };
        let updated = apply_update(&doc, &doc! { "c": 3i32 }).unwrap();
        assert_eq!(updated, doc! { "_id": 9i32, "c": 3i32 });
    }

    #[test]
    fn replacement_with_conflicting_id_rejected() {
        let doc = doc! { "_id": 9i32 };
        assert!(apply_update(&doc, &doc! { "_id": 10i32, "a": 1i32 }).is_err());
    }

    #[test]
    fn upsert_seeds_from_filter_and_set() {
        let seeded = upsert_document(
            &doc! { "k": 5i32 },
            &doc! { "$set": doc! { "v": "y" } },
        )
        .unwrap();
        assert_eq!(seeded.get("k"), Some(&Value::Int32(5)));
        assert_eq!(seeded.get("v"), Some(&Value::String("y".into())));
        assert!(matches!(seeded.get("_id"), Some(Value::ObjectId(_))));
    }

    #[test]
    fn upsert_skips_operator_and_composite_filter_pairs() {
        let filter = doc! {
            "$or": quokka_core::types::Array::new(),
            "a": doc! { "$gt": 1i32 },
            "b": 2i32,
        };
        let seeded = upsert_document(&filter, &doc! { "$set": doc! { "c": 3i32 } }).unwrap();
        assert!(seeded.get("$or").is_none());
        assert!(seeded.get("a").is_none());
        assert_eq!(seeded.get("b"), Some(&Value::Int32(2)));
    }

    #[test]
    fn upsert_conflicting_values_rejected() {
        let err = upsert_document(
            &doc! { "k": 5i32 },
            &doc! { "$set": doc! { "k": 6i32 } },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Command(ErrorCode::BadValue, _)));
    }

    #[test]
    fn upsert_equal_values_are_fine() {
        let seeded = upsert_document(
            &doc! { "k": 5i32 },
            &doc! { "$set": doc! { "k": 5i32, "v": "y" } },
        )
        .unwrap();
        assert_eq!(seeded.get("k"), Some(&Value::Int32(5)));
    }

    #[test]
    fn upsert_respects_supplied_id() {
        let seeded = upsert_document(
            &doc! { "_id": 7i32 },
            &doc! { "$set": doc! { "v": 1i32 } },
        )
        .unwrap();
        assert_eq!(seeded.get("_id"), Some(&Value::Int32(7)));
    }

    #[test]
    fn replacement_upsert_inserts_the_replacement() {
        let seeded = upsert_document(&doc! { "k": 1i32 }, &doc! { "v": 2i32 }).unwrap();
        assert_eq!(seeded.get("v"), Some(&Value::Int32(2)));
        assert!(seeded.get("k").is_none());
        assert!(seeded.contains_key("_id"));
    }
}
