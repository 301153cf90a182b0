use crate::attendance::{self, AttendanceFilter};
use crate::ipc::helpers::{
    self, get_optional_date, get_optional_str, get_required_str, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let status = attendance::status_from_params(params)?;
    let date = get_optional_date(params, "date")?;

    let record = attendance::mark(conn, &student_id, &course_id, status, date.as_deref())?;
    Ok(json!({ "record": record }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let filter = AttendanceFilter {
        student_id: get_optional_str(params, "studentId")?,
        course_id: get_optional_str(params, "courseId")?,
        class_id: get_optional_str(params, "classId")?,
    };
    let records = attendance::list(conn, &filter)?;
    let summary = attendance::summarize(records.iter().map(|r| r.status));
    Ok(json!({ "records": records, "summary": summary }))
}

/// Per-student rates for a class, plus the class-wide summary.
fn attendance_class_summary(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_id = get_required_str(params, "classId")?;
    helpers::require_exists(conn, "classes", &class_id, "class")?;

    let records = attendance::list(
        conn,
        &AttendanceFilter {
            class_id: Some(class_id.clone()),
            course_id: get_optional_str(params, "courseId")?,
            ..AttendanceFilter::default()
        },
    )?;
    let students = attendance::summarize_by_student(&records);
    let overall = attendance::summarize(records.iter().map(|r| r.status));
    Ok(json!({
        "classId": class_id,
        "students": students,
        "summary": overall
    }))
}

fn attendance_student_history(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    helpers::require_exists(conn, "students", &student_id, "student")?;

    let records = attendance::list(
        conn,
        &AttendanceFilter {
            student_id: Some(student_id.clone()),
            ..AttendanceFilter::default()
        },
    )?;
    let summary = attendance::summarize(records.iter().map(|r| r.status));
    Ok(json!({
        "studentId": student_id,
        "records": records,
        "summary": summary
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "attendance.mark" => attendance_mark,
        "attendance.list" => attendance_list,
        "attendance.classSummary" => attendance_class_summary,
        "attendance.studentHistory" => attendance_student_history,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
