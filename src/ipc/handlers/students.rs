use crate::ipc::helpers::{
    self, get_optional_date, get_optional_str, get_patch, get_required_str, patch_nullable_text,
    patch_text, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const STUDENT_REFERENCES: &[(&str, &str)] = &[
    ("grades", "student_id"),
    ("attendance", "student_id"),
    ("report_cards", "student_id"),
];

const STUDENT_SELECT: &str = "SELECT
       s.id, s.last_name, s.first_name, s.registration_no, s.gender, s.birth_date,
       s.class_id, c.name
     FROM students s
     LEFT JOIN classes c ON c.id = s.class_id";

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let last: String = r.get(1)?;
    let first: String = r.get(2)?;
    let registration_no: Option<String> = r.get(3)?;
    let gender: Option<String> = r.get(4)?;
    let birth_date: Option<String> = r.get(5)?;
    let class_id: Option<String> = r.get(6)?;
    let class_name: Option<String> = r.get(7)?;
    Ok(json!({
        "id": id,
        "displayName": format!("{}, {}", last, first),
        "lastName": last,
        "firstName": first,
        "registrationNo": registration_no,
        "gender": gender,
        "birthDate": birth_date,
        "classId": class_id,
        "className": class_name
    }))
}

fn load_student(conn: &Connection, student_id: &str) -> HandlerResult {
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    Ok(conn.query_row(&sql, [student_id], student_json)?)
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_id = get_optional_str(params, "classId")?;
    let mut sql = String::from(STUDENT_SELECT);
    let mut bind: Vec<Value> = Vec::new();
    if let Some(cid) = class_id {
        sql.push_str(" WHERE s.class_id = ?");
        bind.push(Value::Text(cid));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name");

    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map(params_from_iter(bind), student_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let registration_no = get_optional_str(params, "registrationNo")?;
    let gender = get_optional_str(params, "gender")?;
    let birth_date = get_optional_date(params, "birthDate")?;
    let class_id = get_optional_str(params, "classId")?;
    helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, registration_no, gender, birth_date)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &registration_no,
            &gender,
            &birth_date,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "students"))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let patch = get_patch(params)?;
    helpers::require_exists(conn, "students", &student_id, "student")?;

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(v) = patch_text(patch, "lastName")? {
        set_parts.push("last_name = ?");
        bind_values.push(Value::Text(v));
    }
    if let Some(v) = patch_text(patch, "firstName")? {
        set_parts.push("first_name = ?");
        bind_values.push(Value::Text(v));
    }
    if let Some(v) = patch_nullable_text(patch, "registrationNo")? {
        set_parts.push("registration_no = ?");
        bind_values.push(helpers::nullable_value(v));
    }
    if let Some(v) = patch_nullable_text(patch, "gender")? {
        set_parts.push("gender = ?");
        bind_values.push(helpers::nullable_value(v));
    }
    if let Some(v) = patch_nullable_text(patch, "birthDate")? {
        let v = match v {
            Some(raw) => Some(
                helpers::parse_date("birthDate", &raw)?
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
            None => None,
        };
        set_parts.push("birth_date = ?");
        bind_values.push(helpers::nullable_value(v));
    }
    if let Some(v) = patch_nullable_text(patch, "classId")? {
        helpers::require_reference(conn, "classes", v.as_deref(), "class")?;
        set_parts.push("class_id = ?");
        bind_values.push(helpers::nullable_value(v));
    }
    helpers::apply_update(conn, "students", &student_id, set_parts, bind_values)?;

    Ok(json!({ "student": load_student(conn, &student_id)? }))
}

/// Moves a student into a class, or out of any class with `classId: null`.
fn students_assign_class(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_optional_str(params, "classId")?;
    helpers::require_exists(conn, "students", &student_id, "student")?;
    helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;

    conn.execute(
        "UPDATE students SET class_id = ? WHERE id = ?",
        (&class_id, &student_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e, "students"))?;

    Ok(json!({ "student": load_student(conn, &student_id)? }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    helpers::require_exists(conn, "students", &student_id, "student")?;
    helpers::refuse_if_referenced(conn, STUDENT_REFERENCES, &student_id, "student")?;

    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "students"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "students.list" => students_list,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.assignClass" => students_assign_class,
        "students.delete" => students_delete,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
