//! Compiles MongoDB filter documents into parameterized SQL `WHERE`
//! fragments over the `_jsonb` document column.
//!
//! The compiler walks the filter recursively and collects a parallel
//! argument list; the placeholder allocator is threaded through explicitly
//! so compilation is reentrant. The number of placeholders emitted always
//! equals the number of arguments collected.

use quokka_core::error::{Error, ErrorCode, Result};
use quokka_core::fjson;
use quokka_core::types::{Array, Document, Regex, Value};

/// Monotonic allocator of positional parameter tokens (`$1`, `$2`, ...).
#[derive(Debug, Default)]
pub struct Placeholder(u32);

impl Placeholder {
    pub fn new() -> Self {
        Placeholder(0)
    }

    pub fn next(&mut self) -> String {
        self.0 += 1;
        format!("${}", self.0)
    }

    /// Number of placeholders allocated so far.
    pub fn count(&self) -> u32 {
        self.0
    }
}

/// A value bound to one SQL placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Bool(bool),
    Jsonb(serde_json::Value),
    TextArray(Vec<String>),
}

/// Compiles a filter document to a `WHERE ...` fragment (empty string for an
/// empty filter) plus its bound arguments.
pub fn where_clause(filter: &Document, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut sql = String::from(" WHERE");
    let mut args = Vec::new();

    for (i, (key, value)) in filter.iter().enumerate() {
        if i != 0 {
            sql.push_str(" AND");
        }
        let (pair_sql, pair_args) = where_pair(key, value, p)?;
        sql.push_str(" (");
        sql.push_str(&pair_sql);
        sql.push(')');
        args.extend(pair_args);
    }

    Ok((sql, args))
}

/// One top-level `{key: value}` pair: either a logical operator over
/// subexpressions or a field condition.
fn where_pair(key: &str, value: &Value, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    if key.starts_with('$') {
        let exprs = match value {
            Value::Array(a) => a,
            other => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    format!("{key} must be an array, not {}", other.type_name()),
                ));
            }
        };
        return logic_expr(key, exprs, p);
    }

    match value {
        Value::Document(expr) => field_expr(key, expr, p),
        Value::Regex(re) => {
            let mut sql = format!("_jsonb->>{} ~ ", p.next());
            let mut args = vec![SqlArg::Text(key.to_owned())];
            let (scalar_sql, scalar_args) = regex_scalar(re, p)?;
            sql.push_str(&scalar_sql);
            args.extend(scalar_args);
            Ok((sql, args))
        }
        value => {
            let mut sql = format!("_jsonb->{} = ", p.next());
            let mut args = vec![SqlArg::Text(key.to_owned())];
            let (scalar_sql, scalar_args) = scalar(value, p)?;
            sql.push_str(&scalar_sql);
            args.extend(scalar_args);
            Ok((sql, args))
        }
    }
}

/// `$and` / `$or` / `$nor` over an array of subexpressions.
fn logic_expr(op: &str, exprs: &Array, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    let joiner = match op {
        "$and" => " AND",
        "$or" | "$nor" => " OR",
        _ => {
            return Err(Error::command(
                ErrorCode::BadValue,
                format!("unknown top level operator: {op}"),
            ));
        }
    };

    if exprs.is_empty() {
        return Err(Error::command(
            ErrorCode::BadValue,
            format!("{op} must be a nonempty array"),
        ));
    }

    let mut sql = String::new();
    if op == "$nor" {
        sql.push_str("NOT (");
    }
    sql.push('(');

    let mut args = Vec::new();
    for (i, expr) in exprs.iter().enumerate() {
        let expr = match expr {
            Value::Document(d) => d,
            other => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    format!("{op} elements must be objects, not {}", other.type_name()),
                ));
            }
        };

        if i != 0 {
            sql.push_str(joiner);
            sql.push(' ');
        }

        let mut inner_sql = String::new();
        for (j, (key, value)) in expr.iter().enumerate() {
            if j != 0 {
                inner_sql.push_str(" AND ");
            }
            let (pair_sql, pair_args) = where_pair(key, value, p)?;
            inner_sql.push('(');
            inner_sql.push_str(&pair_sql);
            inner_sql.push(')');
            args.extend(pair_args);
        }
        sql.push_str(&inner_sql);
    }

    sql.push(')');
    if op == "$nor" {
        sql.push(')');
    }
    Ok((sql, args))
}

/// `{field: {expr}}`: comparison, membership, regex and `$not` operators.
fn field_expr(field: &str, expr: &Document, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    let mut sql = String::new();
    let mut args = Vec::new();

    for (op, value) in expr.iter() {
        if op == "$options" {
            // Consumed by the $regex arm below.
            if !expr.contains_key("$regex") {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    "$options needs a $regex",
                ));
            }
            continue;
        }

        if !sql.is_empty() {
            sql.push_str(" AND ");
        }

        // {field: {$not: {expr}}}
        if op == "$not" {
            let inner = match value {
                Value::Document(d) => d,
                other => {
                    return Err(Error::command(
                        ErrorCode::BadValue,
                        format!("$not needs an object, not {}", other.type_name()),
                    ));
                }
            };
            let (inner_sql, inner_args) = field_expr(field, inner, p)?;
            sql.push_str("NOT(");
            sql.push_str(&inner_sql);
            sql.push(')');
            args.extend(inner_args);
            continue;
        }

        match op {
            "$in" | "$nin" => {
                let list = match value {
                    Value::Array(a) => a,
                    other => {
                        return Err(Error::command(
                            ErrorCode::BadValue,
                            format!("{op} needs an array, not {}", other.type_name()),
                        ));
                    }
                };
                let (member_sql, member_args) = in_array(field, op == "$nin", list, p)?;
                sql.push_str(&member_sql);
                args.extend(member_args);
            }
            "$eq" | "$ne" | "$lt" | "$lte" | "$gt" | "$gte" => {
                let cmp = match op {
                    "$eq" => "=",
                    "$ne" => "<>",
                    "$lt" => "<",
                    "$lte" => "<=",
                    "$gt" => ">",
                    _ => ">=",
                };
                sql.push_str(&format!("_jsonb->{} {cmp} ", p.next()));
                args.push(SqlArg::Text(field.to_owned()));
                let (scalar_sql, scalar_args) = scalar(value, p)?;
                sql.push_str(&scalar_sql);
                args.extend(scalar_args);
            }
            "$regex" => {
                let mut options = String::new();
                if let Some(opts) = expr.get("$options") {
                    options = match opts {
                        Value::String(s) => s.clone(),
                        _ => {
                            return Err(Error::command(
                                ErrorCode::BadValue,
                                "$options has to be a string",
                            ));
                        }
                    };
                }

                let re = match value {
                    Value::String(pattern) => Regex::new(pattern.clone(), options),
                    Value::Regex(re) => {
                        if !options.is_empty() {
                            if !re.options.is_empty() {
                                return Err(Error::command(
                                    ErrorCode::RegexOptions,
                                    "options set in both $regex and $options",
                                ));
                            }
                            Regex::new(re.pattern.clone(), options)
                        } else {
                            re.clone()
                        }
                    }
                    _ => {
                        return Err(Error::command(
                            ErrorCode::BadValue,
                            "$regex has to be a string",
                        ));
                    }
                };

                sql.push_str(&format!("_jsonb->>{} ~ ", p.next()));
                args.push(SqlArg::Text(field.to_owned()));
                let (scalar_sql, scalar_args) = regex_scalar(&re, p)?;
                sql.push_str(&scalar_sql);
                args.extend(scalar_args);
            }
            _ => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    format!("unknown operator: {op}"),
                ));
            }
        }
    }

    if sql.is_empty() {
        return Err(Error::command(
            ErrorCode::BadValue,
            format!("{field}: empty expression"),
        ));
    }

    Ok((sql, args))
}

/// `$in` / `$nin` membership. An empty `$in` list matches nothing and an
/// empty `$nin` list matches everything; `IN ()` is not valid SQL, so those
/// compile to constants.
fn in_array(
    field: &str,
    negate: bool,
    list: &Array,
    p: &mut Placeholder,
) -> Result<(String, Vec<SqlArg>)> {
    if list.is_empty() {
        return Ok((if negate { "TRUE" } else { "FALSE" }.to_owned(), Vec::new()));
    }

    let mut sql = format!(
        "_jsonb->{} {} (",
        p.next(),
        if negate { "NOT IN" } else { "IN" }
    );
    let mut args = vec![SqlArg::Text(field.to_owned())];

    for (i, value) in list.iter().enumerate() {
        if i != 0 {
            sql.push_str(", ");
        }
        let (scalar_sql, scalar_args) = scalar(value, p)?;
        sql.push_str(&scalar_sql);
        args.extend(scalar_args);
    }
    sql.push(')');
    Ok((sql, args))
}

/// A scalar comparison operand as a jsonb expression. Plain-JSON types cast
/// through `to_jsonb` so the comparison is typed; enveloped types compare
/// against their stored envelope.
fn scalar(value: &Value, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    let (sql, arg) = match value {
        Value::Int32(n) => (format!("to_jsonb({}::int4)", p.next()), SqlArg::Int4(*n)),
        Value::Int64(n) => (format!("{}::jsonb", p.next()), envelope(&Value::Int64(*n))?),
        Value::Double(f) => (format!("{}::jsonb", p.next()), envelope(&Value::Double(*f))?),
        Value::String(s) => (
            format!("to_jsonb({}::text)", p.next()),
            SqlArg::Text(s.clone()),
        ),
        Value::Bool(b) => (format!("to_jsonb({}::bool)", p.next()), SqlArg::Bool(*b)),
        Value::Null => return Ok(("'null'::jsonb".to_owned(), Vec::new())),
        Value::ObjectId(_) | Value::DateTime(_) => {
            (format!("{}::jsonb", p.next()), envelope(value)?)
        }
        Value::Regex(_) | Value::Document(_) | Value::Array(_) => {
            return Err(Error::command(
                ErrorCode::BadValue,
                format!("cannot compare against a {}", value.type_name()),
            ));
        }
    };
    Ok((sql, vec![arg]))
}

/// A regex operand as the text pattern, with supported options folded into
/// an inline `(?i)` group.
fn regex_scalar(re: &Regex, p: &mut Placeholder) -> Result<(String, Vec<SqlArg>)> {
    let mut inline = String::new();
    for o in re.options.chars() {
        match o {
            'i' => inline.push('i'),
            other => {
                return Err(Error::command(
                    ErrorCode::BadValue,
                    format!("unsupported regex option {other:?}"),
                ));
            }
        }
    }

    let pattern = if inline.is_empty() {
        re.pattern.clone()
    } else {
        format!("(?{inline}){}", re.pattern)
    };
    Ok((p.next(), vec![SqlArg::Text(pattern)]))
}

/// The fjson envelope of a value, bound as a jsonb parameter.
fn envelope(value: &Value) -> Result<SqlArg> {
    Ok(SqlArg::Jsonb(fjson::encode(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quokka_core::doc;
    use quokka_core::types::ObjectId;

    fn compile(filter: &Document) -> (String, Vec<SqlArg>) {
        let mut p = Placeholder::new();
        let (sql, args) = where_clause(filter, &mut p).unwrap();
        assert_eq!(
            p.count() as usize,
            args.len(),
            "placeholder count must equal argument count for {sql:?}"
        );
        (sql, args)
    }

    #[test]
    fn empty_filter_compiles_to_nothing() {
        let (sql, args) = compile(&doc! {});
        assert!(sql.is_empty());
        assert!(args.is_empty());
    }

    #[test]
    fn implicit_equality() {
        let (sql, args) = compile(&doc! { "a": "x" });
        assert_eq!(sql, " WHERE (_jsonb->$1 = to_jsonb($2::text))");
        assert_eq!(
            args,
            vec![SqlArg::Text("a".into()), SqlArg::Text("x".into())]
        );
    }

    #[test]
    fn int32_equality_is_typed() {
        let (sql, args) = compile(&doc! { "n": 7i32 });
        assert_eq!(sql, " WHERE (_jsonb->$1 = to_jsonb($2::int4))");
        assert_eq!(args, vec![SqlArg::Text("n".into()), SqlArg::Int4(7)]);
    }

    #[test]
    fn int64_compares_against_envelope() {
        let (sql, args) = compile(&doc! { "n": doc! { "$gt": 5i64 } });
        assert_eq!(sql, " WHERE (_jsonb->$1 > $2::jsonb)");
        assert_eq!(
            args,
            vec![
                SqlArg::Text("n".into()),
                SqlArg::Jsonb(serde_json::json!({ "$l": 5 })),
            ]
        );
    }

    #[test]
    fn objectid_equality_uses_envelope() {
        let oid = ObjectId::new();
        let (sql, args) = compile(&doc! { "_id": oid });
        assert_eq!(sql, " WHERE (_jsonb->$1 = $2::jsonb)");
        assert_eq!(
            args,
            vec![
                SqlArg::Text("_id".into()),
                SqlArg::Jsonb(serde_json::json!({ "$o": oid.to_hex() })),
            ]
        );
    }

    #[test]
    fn null_needs_no_placeholder() {
        let (sql, args) = compile(&doc! { "a": Value::Null });
        assert_eq!(sql, " WHERE (_jsonb->$1 = 'null'::jsonb)");
        assert_eq!(args, vec![SqlArg::Text("a".into())]);
    }

    #[test]
    fn comparison_operators() {
        let (sql, _) = compile(&doc! { "n": doc! { "$gte": 1i32, "$lt": 10i32 } });
        assert_eq!(
            sql,
            " WHERE (_jsonb->$1 >= to_jsonb($2::int4) AND _jsonb->$3 < to_jsonb($4::int4))"
        );
    }

    #[test]
    fn in_membership() {
        let list: Array = vec![Value::String("ab".into()), Value::String("ac".into())].into();
        let (sql, args) = compile(&doc! { "tag": doc! { "$in": list } });
        assert_eq!(
            sql,
            " WHERE (_jsonb->$1 IN (to_jsonb($2::text), to_jsonb($3::text)))"
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn nin_membership() {
        let list: Array = vec![Value::Int32(1)].into();
        let (sql, _) = compile(&doc! { "n": doc! { "$nin": list } });
        assert_eq!(sql, " WHERE (_jsonb->$1 NOT IN (to_jsonb($2::int4)))");
    }

    #[test]
    fn empty_in_matches_nothing() {
        let (sql, args) = compile(&doc! { "n": doc! { "$in": Array::new() } });
        assert_eq!(sql, " WHERE (FALSE)");
        assert!(args.is_empty());
        let (sql, _) = compile(&doc! { "n": doc! { "$nin": Array::new() } });
        assert_eq!(sql, " WHERE (TRUE)");
    }

    #[test]
    fn regex_value_matches_text() {
        let (sql, args) = compile(&doc! { "name": Regex::new("^A", "i") });
        assert_eq!(sql, " WHERE (_jsonb->>$1 ~ $2)");
        assert_eq!(
            args,
            vec![SqlArg::Text("name".into()), SqlArg::Text("(?i)^A".into())]
        );
    }

    #[test]
    fn regex_operator_with_options() {
        let (sql, args) = compile(&doc! { "name": doc! { "$regex": "^A", "$options": "i" } });
        assert_eq!(sql, " WHERE (_jsonb->>$1 ~ $2)");
        assert_eq!(
            args,
            vec![SqlArg::Text("name".into()), SqlArg::Text("(?i)^A".into())]
        );
    }

    #[test]
    fn duplicate_regex_options_rejected() {
        let filter = doc! { "name": doc! { "$regex": Regex::new("^A", "i"), "$options": "i" } };
        let mut p = Placeholder::new();
        match where_clause(&filter, &mut p) {
            Err(Error::Command(ErrorCode::RegexOptions, _)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unsupported_regex_option_rejected() {
        let filter = doc! { "name": Regex::new("^A", "x") };
        let mut p = Placeholder::new();
        match where_clause(&filter, &mut p) {
            Err(Error::Command(ErrorCode::BadValue, _)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn not_nests() {
        let (sql, _) = compile(&doc! { "n": doc! { "$not": doc! { "$eq": 1i32 } } });
        assert_eq!(sql, " WHERE (NOT(_jsonb->$1 = to_jsonb($2::int4)))");
    }

    #[test]
    fn and_or_nor_compose() {
        let exprs: Array = vec![
            Value::Document(doc! { "a": 1i32 }),
            Value::Document(doc! { "b": 2i32 }),
        ]
        .into();
        let (sql, args) = compile(&doc! { "$and": exprs.clone() });
        assert_eq!(
            sql,
            " WHERE (((_jsonb->$1 = to_jsonb($2::int4)) AND (_jsonb->$3 = to_jsonb($4::int4))))"
        );
        assert_eq!(args.len(), 4);

        let (sql, _) = compile(&doc! { "$or": exprs.clone() });
        assert!(sql.contains(") OR ("));

        let (sql, _) = compile(&doc! { "$nor": exprs });
        assert!(sql.starts_with(" WHERE (NOT ("));
    }

    #[test]
    fn nested_logic_is_reentrant() {
        let inner: Array = vec![
            Value::Document(doc! { "a": 1i32 }),
            Value::Document(doc! { "b": doc! { "$lt": 5i32 } }),
        ]
        .into();
        let filter = doc! {
            "$or": Array::from(vec![
                Value::Document(doc! { "$and": inner }),
                Value::Document(doc! { "c": "x" }),
            ])
        };
        let (_, args) = compile(&filter);
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn unknown_operator_rejected() {
        let filter = doc! { "n": doc! { "$exists": true } };
        let mut p = Placeholder::new();
        match where_clause(&filter, &mut p) {
            Err(Error::Command(ErrorCode::BadValue, msg)) => {
                assert!(msg.contains("$exists"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn multiple_top_level_fields_join_with_and() {
        let (sql, _) = compile(&doc! { "a": 1i32, "b": 2i32 });
        assert_eq!(
            sql,
            " WHERE (_jsonb->$1 = to_jsonb($2::int4)) AND (_jsonb->$3 = to_jsonb($4::int4))"
        );
    }
}
