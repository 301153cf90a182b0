use crate::error::CoreError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn db(code: &'static str, e: rusqlite::Error, table: &str) -> Self {
        HandlerErr {
            code,
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

impl From<CoreError> for HandlerErr {
    fn from(e: CoreError) -> Self {
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details: None,
        }
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerErr>;
pub type Handler = fn(&Connection, &serde_json::Value) -> HandlerResult;

/// Runs `handler` against the open workspace and wraps its outcome in a response.
pub fn run(state: &mut AppState, req: &Request, handler: Handler) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match handler(conn, &req.params) {
        Ok(result) => crate::ipc::error::ok(&req.id, result),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code, "{}", e.message);
            e.response(&req.id)
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn get_patch(
    params: &serde_json::Value,
) -> Result<&serde_json::Map<String, serde_json::Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

/// `YYYY-MM-DD`, validated as a calendar date.
pub fn parse_date(key: &str, raw: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key)))
}

pub fn get_optional_date(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key)? {
        None => Ok(None),
        Some(s) => Ok(Some(parse_date(key, &s)?.format("%Y-%m-%d").to_string())),
    }
}

pub fn get_string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "{} must contain only strings",
                key
            )));
        };
        out.push(s.trim().to_string());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// Fails with `not_found` unless `table` has a row with this id.
pub fn require_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    label: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(format!("{} not found", label)))
    }
}

/// Fails with `bad_params` when an optional reference points nowhere.
pub fn require_reference(
    conn: &Connection,
    table: &str,
    id: Option<&str>,
    label: &str,
) -> Result<(), HandlerErr> {
    match id {
        Some(id) if !row_exists(conn, table, id)? => Err(HandlerErr::bad_params(format!(
            "unknown {} {}",
            label, id
        ))),
        _ => Ok(()),
    }
}

/// Refuses a delete while other tables still reference the row.
pub fn refuse_if_referenced(
    conn: &Connection,
    refs: &[(&'static str, &'static str)],
    id: &str,
    label: &str,
) -> Result<(), HandlerErr> {
    let hits = crate::db::referencing_tables(conn, refs, id)?;
    if hits.is_empty() {
        return Ok(());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: format!("{} is still referenced", label),
        details: Some(json!({ "referencedBy": hits })),
    })
}

/// Applies `UPDATE table SET ... WHERE id = ?` built from collected parts.
pub fn apply_update(
    conn: &Connection,
    table: &str,
    id: &str,
    set_parts: Vec<&'static str>,
    mut bind_values: Vec<Value>,
) -> Result<(), HandlerErr> {
    if set_parts.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?",
        table,
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(id.to_string()));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::db("db_update_failed", e, table))?;
    Ok(())
}

/// Reads a patch field that must be a non-empty string.
pub fn patch_text(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = patch.get(key) else {
        return Ok(None);
    };
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params(format!(
            "patch.{} must be a string",
            key
        )));
    };
    let s = s.trim().to_string();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(Some(s))
}

/// Reads a nullable patch field. `Some(None)` clears the column.
pub fn patch_nullable_text(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<Option<String>>, HandlerErr> {
    let Some(v) = patch.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(Some(None));
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params(format!(
            "patch.{} must be string or null",
            key
        )));
    };
    let t = s.trim();
    Ok(Some(if t.is_empty() { None } else { Some(t.to_string()) }))
}

pub fn nullable_value(v: Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}
