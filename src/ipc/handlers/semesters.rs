use crate::ipc::helpers::{
    self, get_patch, get_required_str, parse_date, patch_text, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value, Connection};
use serde_json::json;
use uuid::Uuid;

const SEMESTER_REFERENCES: &[(&str, &str)] =
    &[("grades", "semester_id"), ("report_cards", "semester_id")];

fn semester_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let name: String = r.get(1)?;
    let start_date: String = r.get(2)?;
    let end_date: String = r.get(3)?;
    Ok(json!({
        "id": id,
        "name": name,
        "startDate": start_date,
        "endDate": end_date
    }))
}

fn check_range(start: chrono::NaiveDate, end: chrono::NaiveDate) -> Result<(), HandlerErr> {
    if start > end {
        return Err(HandlerErr::bad_params(
            "startDate must not be after endDate",
        ));
    }
    Ok(())
}

fn semesters_list(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let mut stmt = conn.prepare(
        "SELECT id, name, start_date, end_date FROM semesters ORDER BY start_date, name",
    )?;
    let semesters = stmt
        .query_map([], semester_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "semesters": semesters }))
}

fn semesters_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let start = parse_date("startDate", &get_required_str(params, "startDate")?)?;
    let end = parse_date("endDate", &get_required_str(params, "endDate")?)?;
    check_range(start, end)?;

    let semester_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (
            &semester_id,
            &name,
            start.format("%Y-%m-%d").to_string(),
            end.format("%Y-%m-%d").to_string(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "semesters"))?;

    Ok(json!({ "semesterId": semester_id }))
}

fn semesters_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let semester_id = get_required_str(params, "semesterId")?;
    let patch = get_patch(params)?;
    let (cur_start, cur_end): (String, String) = match conn.query_row(
        "SELECT start_date, end_date FROM semesters WHERE id = ?",
        [&semester_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            return Err(HandlerErr::not_found("semester not found"))
        }
        Err(e) => return Err(e.into()),
    };

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(name) = patch_text(patch, "name")? {
        set_parts.push("name = ?");
        bind_values.push(Value::Text(name));
    }
    let start = match patch_text(patch, "startDate")? {
        Some(raw) => parse_date("startDate", &raw)?,
        None => parse_date("startDate", &cur_start)?,
    };
    let end = match patch_text(patch, "endDate")? {
        Some(raw) => parse_date("endDate", &raw)?,
        None => parse_date("endDate", &cur_end)?,
    };
    check_range(start, end)?;
    if patch.contains_key("startDate") {
        set_parts.push("start_date = ?");
        bind_values.push(Value::Text(start.format("%Y-%m-%d").to_string()));
    }
    if patch.contains_key("endDate") {
        set_parts.push("end_date = ?");
        bind_values.push(Value::Text(end.format("%Y-%m-%d").to_string()));
    }
    helpers::apply_update(conn, "semesters", &semester_id, set_parts, bind_values)?;

    let semester = conn.query_row(
        "SELECT id, name, start_date, end_date FROM semesters WHERE id = ?",
        [&semester_id],
        semester_json,
    )?;
    Ok(json!({ "semester": semester }))
}

fn semesters_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let semester_id = get_required_str(params, "semesterId")?;
    helpers::require_exists(conn, "semesters", &semester_id, "semester")?;
    helpers::refuse_if_referenced(conn, SEMESTER_REFERENCES, &semester_id, "semester")?;

    conn.execute("DELETE FROM semesters WHERE id = ?", [&semester_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "semesters"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "semesters.list" => semesters_list,
        "semesters.create" => semesters_create,
        "semesters.update" => semesters_update,
        "semesters.delete" => semesters_delete,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
