use crate::ipc::helpers::{
    self, get_optional_str, get_patch, get_required_str, get_string_list, patch_nullable_text,
    patch_text, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const TEACHER_REFERENCES: &[(&str, &str)] = &[("grades", "teacher_id"), ("courses", "teacher_id")];

fn linked_ids(conn: &Connection, sql: &str, teacher_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn teacher_json(conn: &Connection, teacher_id: &str) -> HandlerResult {
    let (name, email, charge_sheet): (String, Option<String>, String) = conn.query_row(
        "SELECT name, email, charge_sheet FROM teachers WHERE id = ?",
        [teacher_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let class_ids = linked_ids(
        conn,
        "SELECT class_id FROM teacher_classes WHERE teacher_id = ? ORDER BY class_id",
        teacher_id,
    )?;
    let subject_ids = linked_ids(
        conn,
        "SELECT subject_id FROM teacher_subjects WHERE teacher_id = ? ORDER BY subject_id",
        teacher_id,
    )?;
    Ok(json!({
        "id": teacher_id,
        "name": name,
        "email": email,
        "chargeSheet": charge_sheet,
        "classIds": class_ids,
        "subjectIds": subject_ids
    }))
}

fn teachers_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let mut stmt = conn.prepare("SELECT id FROM teachers ORDER BY name")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut teachers = Vec::with_capacity(ids.len());
    for id in ids {
        teachers.push(teacher_json(conn, &id)?);
    }
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let email = get_optional_str(params, "email")?;

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, name, email) VALUES(?, ?, ?)",
        (&teacher_id, &name, &email),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "teachers"))?;

    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    let patch = get_patch(params)?;
    helpers::require_exists(conn, "teachers", &teacher_id, "teacher")?;

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(name) = patch_text(patch, "name")? {
        set_parts.push("name = ?");
        bind_values.push(Value::Text(name));
    }
    if let Some(email) = patch_nullable_text(patch, "email")? {
        set_parts.push("email = ?");
        bind_values.push(helpers::nullable_value(email));
    }
    helpers::apply_update(conn, "teachers", &teacher_id, set_parts, bind_values)?;

    Ok(json!({ "teacher": teacher_json(conn, &teacher_id)? }))
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    helpers::require_exists(conn, "teachers", &teacher_id, "teacher")?;
    helpers::refuse_if_referenced(conn, TEACHER_REFERENCES, &teacher_id, "teacher")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e, "teachers"))?;
    tx.execute("DELETE FROM teacher_classes WHERE teacher_id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "teacher_classes"))?;
    tx.execute("DELETE FROM teacher_subjects WHERE teacher_id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "teacher_subjects"))?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "teachers"))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e, "teachers"))?;

    Ok(json!({ "ok": true }))
}

/// Replaces a teacher's links in `link_table` with `ids`, all of which must exist in `target`.
fn replace_links(
    conn: &Connection,
    teacher_id: &str,
    ids: &[String],
    link_table: &str,
    link_column: &str,
    target: &str,
    label: &str,
) -> Result<(), HandlerErr> {
    helpers::require_exists(conn, "teachers", teacher_id, "teacher")?;
    for id in ids {
        helpers::require_reference(conn, target, Some(id), label)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e, link_table))?;
    tx.execute(
        &format!("DELETE FROM {} WHERE teacher_id = ?", link_table),
        [teacher_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e, link_table))?;
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {}(teacher_id, {}) VALUES(?, ?)",
                link_table, link_column
            ))
            .map_err(|e| HandlerErr::db("db_insert_failed", e, link_table))?;
        for id in ids {
            stmt.execute((teacher_id, id))
                .map_err(|e| HandlerErr::db("db_insert_failed", e, link_table))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e, link_table))?;
    Ok(())
}

fn teachers_assign_classes(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    let class_ids = get_string_list(params, "classIds")?;
    replace_links(
        conn,
        &teacher_id,
        &class_ids,
        "teacher_classes",
        "class_id",
        "classes",
        "class",
    )?;
    Ok(json!({ "teacher": teacher_json(conn, &teacher_id)? }))
}

fn teachers_assign_subjects(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    let subject_ids = get_string_list(params, "subjectIds")?;
    replace_links(
        conn,
        &teacher_id,
        &subject_ids,
        "teacher_subjects",
        "subject_id",
        "subjects",
        "subject",
    )?;
    Ok(json!({ "teacher": teacher_json(conn, &teacher_id)? }))
}

fn teachers_set_charge_sheet(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    let Some(text) = params.get("chargeSheet").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing chargeSheet"));
    };
    helpers::require_exists(conn, "teachers", &teacher_id, "teacher")?;

    conn.execute(
        "UPDATE teachers SET charge_sheet = ? WHERE id = ?",
        (text, &teacher_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e, "teachers"))?;
    Ok(json!({ "teacher": teacher_json(conn, &teacher_id)? }))
}

/// Classes a teacher is assigned to, with their student counts.
fn teachers_classes(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let teacher_id = get_required_str(params, "teacherId")?;
    helpers::require_exists(conn, "teachers", &teacher_id, "teacher")?;

    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.level, c.section,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM teacher_classes tc
         JOIN classes c ON c.id = tc.class_id
         WHERE tc.teacher_id = ?
         ORDER BY c.level, c.name",
    )?;
    let classes = stmt
        .query_map([&teacher_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let level: Option<String> = r.get(2)?;
            let section: Option<String> = r.get(3)?;
            let student_count: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "level": level,
                "section": section,
                "studentCount": student_count
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "teachers.list" => teachers_list,
        "teachers.create" => teachers_create,
        "teachers.update" => teachers_update,
        "teachers.delete" => teachers_delete,
        "teachers.assignClasses" => teachers_assign_classes,
        "teachers.assignSubjects" => teachers_assign_subjects,
        "teachers.setChargeSheet" => teachers_set_charge_sheet,
        "teachers.classes" => teachers_classes,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
