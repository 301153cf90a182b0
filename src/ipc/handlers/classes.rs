use crate::ipc::helpers::{
    self, get_optional_str, get_patch, get_required_str, patch_nullable_text, patch_text,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const CLASS_REFERENCES: &[(&str, &str)] = &[
    ("students", "class_id"),
    ("subjects", "class_id"),
    ("courses", "class_id"),
    ("grades", "class_id"),
    ("report_cards", "class_id"),
];

fn class_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let name: String = r.get(1)?;
    let level: Option<String> = r.get(2)?;
    let section: Option<String> = r.get(3)?;
    let student_count: i64 = r.get(4)?;
    let subject_count: i64 = r.get(5)?;
    Ok(json!({
        "id": id,
        "name": name,
        "level": level,
        "section": section,
        "studentCount": student_count,
        "subjectCount": subject_count
    }))
}

fn classes_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.level,
           c.section,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.level, c.name",
    )?;
    let classes = stmt
        .query_map([], class_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let level = get_optional_str(params, "level")?;
    let section = get_optional_str(params, "section")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, level, section) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &level, &section),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "classes"))?;

    Ok(json!({ "classId": class_id, "name": name, "level": level, "section": section }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_id = get_required_str(params, "classId")?;
    let patch = get_patch(params)?;
    helpers::require_exists(conn, "classes", &class_id, "class")?;

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(name) = patch_text(patch, "name")? {
        set_parts.push("name = ?");
        bind_values.push(Value::Text(name));
    }
    if let Some(level) = patch_nullable_text(patch, "level")? {
        set_parts.push("level = ?");
        bind_values.push(helpers::nullable_value(level));
    }
    if let Some(section) = patch_nullable_text(patch, "section")? {
        set_parts.push("section = ?");
        bind_values.push(helpers::nullable_value(section));
    }
    helpers::apply_update(conn, "classes", &class_id, set_parts, bind_values)?;

    let class = conn.query_row(
        "SELECT c.id, c.name, c.level, c.section,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id),
           (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id)
         FROM classes c WHERE c.id = ?",
        [&class_id],
        class_json,
    )?;
    Ok(json!({ "class": class }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_id = get_required_str(params, "classId")?;
    helpers::require_exists(conn, "classes", &class_id, "class")?;
    helpers::refuse_if_referenced(conn, CLASS_REFERENCES, &class_id, "class")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e, "classes"))?;
    tx.execute("DELETE FROM teacher_classes WHERE class_id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "teacher_classes"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "classes"))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e, "classes"))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.update" => classes_update,
        "classes.delete" => classes_delete,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
