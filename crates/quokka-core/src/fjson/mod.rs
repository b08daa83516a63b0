//! Tagged extended-JSON codec ("fjson").
//!
//! The storage layer keeps one document per row as JSON, so every type that
//! is not natively expressible in JSON is wrapped in a single-key envelope.
//! The envelopes are chosen so that each type in the value model has exactly
//! one serial form and `decode(encode(v)) == v` holds for every value:
//!
//! | type | form |
//! |---|---|
//! | document | object with `"$k"` listing its keys in order |
//! | array | JSON array |
//! | string / bool / null | the plain JSON form |
//! | int32 | plain JSON integer (the only unwrapped number) |
//! | int64 | `{"$l": <n>}` |
//! | double | `{"$f": <n>}`; non-finite as `{"$f": "Infinity" / "-Infinity" / "NaN"}` |
//! | datetime | `{"$d": <millis>}` |
//! | objectId | `{"$o": "<24 hex>"}` |
//! | regex | `{"$r": "<pattern>", "o": "<options>"}` |
//!
//! `"$k"` exists because JSON object member order is not portable; decoding
//! takes key order from it, not from the object. Decoding is strict: unknown
//! envelopes, plain numbers outside the int32 range, and `"$k"` mismatches
//! are errors.

use serde_json::{json, Map, Number};

use crate::error::{Error, Result};
use crate::types::{Array, Document, ObjectId, Regex, Value};

type Json = serde_json::Value;

const KEY_ORDER: &str = "$k";

/// Encodes a value to its tagged JSON form.
pub fn encode(value: &Value) -> Result<Json> {
    let json = match value {
        Value::Double(f) => {
            if f.is_finite() {
                json!({ "$f": f })
            } else if f.is_nan() {
                json!({ "$f": "NaN" })
            } else if *f > 0.0 {
                json!({ "$f": "Infinity" })
            } else {
                json!({ "$f": "-Infinity" })
            }
        }
        Value::String(s) => Json::String(s.clone()),
        Value::Document(d) => encode_document(d)?,
        Value::Array(a) => {
            let mut elements = Vec::with_capacity(a.len());
            for v in a.iter() {
                elements.push(encode(v)?);
            }
            Json::Array(elements)
        }
        Value::Bool(b) => Json::Bool(*b),
        Value::DateTime(dt) => json!({ "$d": dt.timestamp_millis() }),
        Value::Null => Json::Null,
        Value::Int32(n) => Json::Number(Number::from(*n)),
        Value::Int64(n) => json!({ "$l": n }),
        Value::ObjectId(oid) => json!({ "$o": oid.to_hex() }),
        Value::Regex(re) => json!({ "$r": re.pattern, "o": re.options }),
    };
    Ok(json)
}

/// Encodes a document, recording key order under `"$k"`.
pub fn encode_document(doc: &Document) -> Result<Json> {
    let mut object = Map::with_capacity(doc.len() + 1);
    let keys: Vec<Json> = doc.keys().map(|k| Json::String(k.to_owned())).collect();
    object.insert(KEY_ORDER.to_owned(), Json::Array(keys));
    for (key, value) in doc.iter() {
        if key == KEY_ORDER {
            return Err(Error::Validation(format!(
                "document key {KEY_ORDER:?} is reserved"
            )));
        }
        object.insert(key.to_owned(), encode(value)?);
    }
    Ok(Json::Object(object))
}

/// Decodes a tagged JSON value back into the typed model.
pub fn decode(json: &Json) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Number(n) => {
            // Only int32 is stored as a plain number; everything else is
            // enveloped, so anything outside i32 is a corrupt row.
            let n = n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| Error::Json(format!("plain number {n} is not an int32")))?;
            Ok(Value::Int32(n))
        }
        Json::Array(elements) => {
            let mut arr = Array::with_capacity(elements.len());
            for e in elements {
                arr.push(decode(e)?);
            }
            Ok(Value::Array(arr))
        }
        Json::Object(object) => decode_object(object),
    }
}

/// Decodes a JSON object that must be a document (not a scalar envelope).
pub fn decode_document(json: &Json) -> Result<Document> {
    match decode(json)? {
        Value::Document(doc) => Ok(doc),
        other => Err(Error::Json(format!(
            "expected a document, found {}",
            other.type_name()
        ))),
    }
}

/// Convenience: decode a document from serialized JSON text.
pub fn document_from_str(s: &str) -> Result<Document> {
    let json: Json = serde_json::from_str(s)?;
    decode_document(&json)
}

/// Convenience: serialize a document to JSON text.
pub fn document_to_string(doc: &Document) -> Result<String> {
    Ok(serde_json::to_string(&encode_document(doc)?)?)
}

fn decode_object(object: &Map<String, Json>) -> Result<Value> {
    if object.contains_key(KEY_ORDER) {
        return decode_document_object(object).map(Value::Document);
    }

    let mut keys = object.keys().map(String::as_str);
    match (keys.next(), keys.next()) {
        (Some("$f"), None) => decode_double(&object["$f"]),
        (Some("$l"), None) => match object["$l"].as_i64() {
            Some(n) => Ok(Value::Int64(n)),
            None => Err(Error::Json(format!("invalid int64 envelope {:?}", object["$l"]))),
        },
        (Some("$d"), None) => {
            let millis = object["$d"]
                .as_i64()
                .ok_or_else(|| Error::Json(format!("invalid datetime envelope {:?}", object["$d"])))?;
            Value::date_time_from_millis(millis)
                .ok_or_else(|| Error::Json(format!("datetime {millis} out of range")))
        }
        (Some("$o"), None) => {
            let hex = object["$o"]
                .as_str()
                .ok_or_else(|| Error::Json("invalid ObjectId envelope".into()))?;
            let oid = ObjectId::parse_hex(hex)
                .map_err(|e| Error::Json(e.to_string()))?;
            Ok(Value::ObjectId(oid))
        }
        (Some("$r"), rest) if rest.is_none() || rest == Some("o") => {
            let pattern = object["$r"]
                .as_str()
                .ok_or_else(|| Error::Json("invalid regex envelope".into()))?;
            let options = match object.get("o") {
                Some(Json::String(o)) => o.clone(),
                None => String::new(),
                Some(other) => {
                    return Err(Error::Json(format!("invalid regex options {other}")));
                }
            };
            Ok(Value::Regex(Regex::new(pattern, options)))
        }
        _ => Err(Error::Json(format!(
            "object is neither an envelope nor a document: keys {:?}",
            object.keys().collect::<Vec<_>>()
        ))),
    }
}

fn decode_double(json: &Json) -> Result<Value> {
    match json {
        Json::Number(n) => n
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| Error::Json(format!("invalid double envelope {n}"))),
        Json::String(s) => match s.as_str() {
            "Infinity" => Ok(Value::Double(f64::INFINITY)),
            "-Infinity" => Ok(Value::Double(f64::NEG_INFINITY)),
            "NaN" => Ok(Value::Double(f64::NAN)),
            other => Err(Error::Json(format!("invalid double envelope {other:?}"))),
        },
        other => Err(Error::Json(format!("invalid double envelope {other}"))),
    }
}

fn decode_document_object(object: &Map<String, Json>) -> Result<Document> {
    let keys = object[KEY_ORDER]
        .as_array()
        .ok_or_else(|| Error::Json(format!("{KEY_ORDER:?} is not an array")))?;
    if keys.len() != object.len() - 1 {
        return Err(Error::Json(format!(
            "{KEY_ORDER:?} lists {} keys but the object has {} members",
            keys.len(),
            object.len() - 1
        )));
    }

    let mut doc = Document::with_capacity(keys.len());
    for key in keys {
        let key = key
            .as_str()
            .ok_or_else(|| Error::Json(format!("non-string key in {KEY_ORDER:?}: {key}")))?;
        let value = object
            .get(key)
            .ok_or_else(|| Error::Json(format!("{KEY_ORDER:?} names missing member {key:?}")))?;
        if doc.contains_key(key) {
            return Err(Error::Json(format!("duplicate key {key:?}")));
        }
        doc.set(key, decode(value)?);
    }
    Ok(doc)
}
