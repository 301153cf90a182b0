use crate::db;
use crate::ipc::helpers::{self, get_optional_str, get_required_str, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const COURSE_REFERENCES: &[(&str, &str)] = &[("attendance", "course_id")];

const COURSE_SELECT: &str = "SELECT
       co.id, co.title, co.content, co.subject_id, sub.name, co.class_id, c.name,
       co.teacher_id, t.name, co.created_at
     FROM courses co
     LEFT JOIN subjects sub ON sub.id = co.subject_id
     LEFT JOIN classes c ON c.id = co.class_id
     LEFT JOIN teachers t ON t.id = co.teacher_id";

fn course_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let title: String = r.get(1)?;
    let content: String = r.get(2)?;
    let subject_id: Option<String> = r.get(3)?;
    let subject_name: Option<String> = r.get(4)?;
    let class_id: Option<String> = r.get(5)?;
    let class_name: Option<String> = r.get(6)?;
    let teacher_id: Option<String> = r.get(7)?;
    let teacher_name: Option<String> = r.get(8)?;
    let created_at: String = r.get(9)?;
    Ok(json!({
        "id": id,
        "title": title,
        "content": content,
        "subjectId": subject_id,
        "subjectName": subject_name,
        "classId": class_id,
        "className": class_name,
        "teacherId": teacher_id,
        "teacherName": teacher_name,
        "createdAt": created_at
    }))
}

fn courses_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    for (key, column) in [
        ("classId", "co.class_id = ?"),
        ("teacherId", "co.teacher_id = ?"),
        ("subjectId", "co.subject_id = ?"),
    ] {
        if let Some(v) = get_optional_str(params, key)? {
            where_parts.push(column);
            bind.push(Value::Text(v));
        }
    }

    let mut sql = String::from(COURSE_SELECT);
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY co.created_at DESC, co.title");

    let mut stmt = conn.prepare(&sql)?;
    let courses = stmt
        .query_map(params_from_iter(bind), course_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": courses }))
}

fn courses_get(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let course_id = get_required_str(params, "courseId")?;
    helpers::require_exists(conn, "courses", &course_id, "course")?;
    let sql = format!("{} WHERE co.id = ?", COURSE_SELECT);
    let course = conn.query_row(&sql, [&course_id], course_json)?;
    Ok(json!({ "course": course }))
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let title = get_required_str(params, "title")?;
    let content = params
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let subject_id = get_optional_str(params, "subjectId")?;
    let class_id = get_optional_str(params, "classId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    helpers::require_reference(conn, "subjects", subject_id.as_deref(), "subject")?;
    helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;
    helpers::require_reference(conn, "teachers", teacher_id.as_deref(), "teacher")?;

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, title, content, subject_id, class_id, teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &title,
            &content,
            &subject_id,
            &class_id,
            &teacher_id,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "courses"))?;

    Ok(json!({ "courseId": course_id }))
}

fn courses_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let course_id = get_required_str(params, "courseId")?;
    helpers::require_exists(conn, "courses", &course_id, "course")?;
    helpers::refuse_if_referenced(conn, COURSE_REFERENCES, &course_id, "course")?;

    conn.execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "courses"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "courses.list" => courses_list,
        "courses.get" => courses_get,
        "courses.create" => courses_create,
        "courses.delete" => courses_delete,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
