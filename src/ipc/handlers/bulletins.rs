use crate::bulletin::{self, NewReportCard, ReportCardFilter, SubjectAverage};
use crate::ipc::helpers::{self, get_optional_str, get_required_str, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn parse_entries(params: &serde_json::Value) -> Result<Vec<SubjectAverage>, HandlerErr> {
    let Some(raw) = params.get("entries") else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    serde_json::from_value::<Vec<SubjectAverage>>(raw.clone()).map_err(|e| {
        HandlerErr::bad_params(format!(
            "entries must be a list of {{subjectId, average}}: {}",
            e
        ))
    })
}

fn remarks_param(params: &serde_json::Value) -> String {
    params
        .get("remarks")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

fn parse_filter(params: &serde_json::Value) -> Result<ReportCardFilter, HandlerErr> {
    Ok(ReportCardFilter {
        student_id: get_optional_str(params, "studentId")?,
        class_id: get_optional_str(params, "classId")?,
        semester_id: get_optional_str(params, "semesterId")?,
        level: get_optional_str(params, "level")?,
    })
}

fn bulletins_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let cards = bulletin::list(conn, &parse_filter(params)?)?;
    Ok(json!({ "reportCards": cards }))
}

fn bulletins_get(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let id = get_required_str(params, "reportCardId")?;
    Ok(json!({ "reportCard": bulletin::fetch(conn, &id)? }))
}

fn bulletins_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let semester_id = get_required_str(params, "semesterId")?;
    let entries = parse_entries(params)?;
    let remarks = remarks_param(params);

    let card = bulletin::build(
        conn,
        &NewReportCard {
            student_id: &student_id,
            class_id: &class_id,
            semester_id: &semester_id,
            entries: &entries,
            remarks: &remarks,
        },
    )?;
    Ok(json!({ "reportCardId": card.id, "reportCard": card }))
}

fn bulletins_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let id = get_required_str(params, "reportCardId")?;
    let entries = parse_entries(params)?;
    let remarks = remarks_param(params);
    let card = bulletin::update(conn, &id, &entries, &remarks)?;
    Ok(json!({ "reportCard": card }))
}

fn bulletins_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let id = get_required_str(params, "reportCardId")?;
    bulletin::delete(conn, &id)?;
    Ok(json!({ "ok": true }))
}

fn bulletins_generate(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let semester_id = get_required_str(params, "semesterId")?;
    let remarks = remarks_param(params);
    let card = bulletin::generate(conn, &student_id, &semester_id, &remarks)?;
    Ok(json!({ "reportCardId": card.id, "reportCard": card }))
}

fn bulletins_by_level(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let cards = bulletin::list(conn, &parse_filter(params)?)?;
    Ok(json!({ "levels": bulletin::group_by_level(&cards) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "bulletins.list" => bulletins_list,
        "bulletins.get" => bulletins_get,
        "bulletins.create" => bulletins_create,
        "bulletins.update" => bulletins_update,
        "bulletins.delete" => bulletins_delete,
        "bulletins.generate" => bulletins_generate,
        "bulletins.byLevel" => bulletins_by_level,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
