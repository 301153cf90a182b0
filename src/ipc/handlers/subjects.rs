use crate::ipc::helpers::{
    self, get_optional_str, get_patch, get_required_str, patch_nullable_text, patch_text,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const SUBJECT_REFERENCES: &[(&str, &str)] = &[
    ("grades", "subject_id"),
    ("report_card_subjects", "subject_id"),
    ("courses", "subject_id"),
];

const SUBJECT_SELECT: &str = "SELECT sub.id, sub.name, sub.coefficient, sub.class_id, c.name
     FROM subjects sub
     LEFT JOIN classes c ON c.id = sub.class_id";

fn subject_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let name: String = r.get(1)?;
    let coefficient: Option<f64> = r.get(2)?;
    let class_id: Option<String> = r.get(3)?;
    let class_name: Option<String> = r.get(4)?;
    Ok(json!({
        "id": id,
        "name": name,
        "coefficient": coefficient,
        "classId": class_id,
        "className": class_name
    }))
}

/// Coefficients are optional; when present they must be finite and not negative.
fn parse_coefficient(v: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(c) if c.is_finite() && c >= 0.0 => Ok(Some(c)),
            _ => Err(HandlerErr::bad_params(
                "coefficient must be a non-negative number",
            )),
        },
    }
}

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_id = get_optional_str(params, "classId")?;
    let mut sql = String::from(SUBJECT_SELECT);
    let mut bind: Vec<Value> = Vec::new();
    if let Some(cid) = class_id {
        sql.push_str(" WHERE sub.class_id = ?");
        bind.push(Value::Text(cid));
    }
    sql.push_str(" ORDER BY sub.name");

    let mut stmt = conn.prepare(&sql)?;
    let subjects = stmt
        .query_map(params_from_iter(bind), subject_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let coefficient = parse_coefficient(params.get("coefficient"))?;
    let class_id = get_optional_str(params, "classId")?;
    helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, coefficient, class_id) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, coefficient, &class_id),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "subjects"))?;

    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let subject_id = get_required_str(params, "subjectId")?;
    let patch = get_patch(params)?;
    helpers::require_exists(conn, "subjects", &subject_id, "subject")?;

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(name) = patch_text(patch, "name")? {
        set_parts.push("name = ?");
        bind_values.push(Value::Text(name));
    }
    if patch.contains_key("coefficient") {
        set_parts.push("coefficient = ?");
        bind_values.push(match parse_coefficient(patch.get("coefficient"))? {
            Some(c) => Value::Real(c),
            None => Value::Null,
        });
    }
    if let Some(class_id) = patch_nullable_text(patch, "classId")? {
        helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;
        set_parts.push("class_id = ?");
        bind_values.push(helpers::nullable_value(class_id));
    }
    helpers::apply_update(conn, "subjects", &subject_id, set_parts, bind_values)?;

    let sql = format!("{} WHERE sub.id = ?", SUBJECT_SELECT);
    let subject = conn.query_row(&sql, [&subject_id], subject_json)?;
    Ok(json!({ "subject": subject }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let subject_id = get_required_str(params, "subjectId")?;
    helpers::require_exists(conn, "subjects", &subject_id, "subject")?;
    helpers::refuse_if_referenced(conn, SUBJECT_REFERENCES, &subject_id, "subject")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e, "subjects"))?;
    tx.execute(
        "DELETE FROM teacher_subjects WHERE subject_id = ?",
        [&subject_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e, "teacher_subjects"))?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "subjects"))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e, "subjects"))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "subjects.list" => subjects_list,
        "subjects.create" => subjects_create,
        "subjects.update" => subjects_update,
        "subjects.delete" => subjects_delete,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
