use crate::calc::{self, Dimension, GradeFilter, GradeKind, GroupKey};
use crate::db;
use crate::ipc::helpers::{
    self, get_optional_date, get_optional_str, get_patch, get_required_str, patch_nullable_text,
    patch_text, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_value(v: Option<&serde_json::Value>) -> Result<f64, HandlerErr> {
    let Some(value) = v.and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("value must be a number"));
    };
    if !calc::is_valid_grade(value) {
        return Err(HandlerErr::bad_params(format!(
            "value must be between {} and {}",
            calc::GRADE_MIN,
            calc::GRADE_MAX
        )));
    }
    Ok(value)
}

fn parse_kind(raw: &str) -> Result<GradeKind, HandlerErr> {
    GradeKind::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("kind must be one of: homework, test, composition")
    })
}

/// Optional id filters shared by the listing and analysis methods.
fn grade_filter(params: &serde_json::Value) -> Result<GradeFilter, HandlerErr> {
    Ok(GradeFilter {
        student_id: get_optional_str(params, "studentId")?,
        subject_id: get_optional_str(params, "subjectId")?,
        semester_id: get_optional_str(params, "semesterId")?,
        class_id: get_optional_str(params, "classId")?,
        teacher_id: get_optional_str(params, "teacherId")?,
    })
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let filter = grade_filter(params)?;
    let grades = calc::load_grades(conn, &filter)?;
    Ok(json!({ "grades": grades }))
}

fn grades_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let value = parse_value(params.get("value"))?;
    let kind = parse_kind(&get_required_str(params, "kind")?)?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_optional_str(params, "subjectId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let semester_id = get_optional_str(params, "semesterId")?;
    let mut class_id = get_optional_str(params, "classId")?;
    let date = get_optional_date(params, "date")?.unwrap_or_else(db::today);

    let student_class: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(student_class) = student_class else {
        return Err(HandlerErr::bad_params(format!(
            "unknown student {}",
            student_id
        )));
    };
    if class_id.is_none() {
        class_id = student_class;
    }
    helpers::require_reference(conn, "subjects", subject_id.as_deref(), "subject")?;
    helpers::require_reference(conn, "teachers", teacher_id.as_deref(), "teacher")?;
    helpers::require_reference(conn, "semesters", semester_id.as_deref(), "semester")?;
    helpers::require_reference(conn, "classes", class_id.as_deref(), "class")?;

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, value, kind, student_id, subject_id, teacher_id, semester_id, class_id, date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            value,
            kind.as_str(),
            &student_id,
            &subject_id,
            &teacher_id,
            &semester_id,
            &class_id,
            &date,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e, "grades"))?;
    tracing::debug!(grade = %grade_id, student = %student_id, value, "grade recorded");

    Ok(json!({ "gradeId": grade_id, "grade": calc::load_grade(conn, &grade_id)? }))
}

fn grades_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let grade_id = get_required_str(params, "gradeId")?;
    let patch = get_patch(params)?;
    calc::load_grade(conn, &grade_id)?;

    let mut set_parts: Vec<&'static str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if patch.contains_key("value") {
        set_parts.push("value = ?");
        bind_values.push(Value::Real(parse_value(patch.get("value"))?));
    }
    if let Some(raw) = patch_text(patch, "kind")? {
        set_parts.push("kind = ?");
        bind_values.push(Value::Text(parse_kind(&raw)?.as_str().to_string()));
    }
    if let Some(raw) = patch_text(patch, "date")? {
        set_parts.push("date = ?");
        bind_values.push(Value::Text(
            helpers::parse_date("date", &raw)?
                .format("%Y-%m-%d")
                .to_string(),
        ));
    }
    for (key, column, table, label) in [
        ("subjectId", "subject_id = ?", "subjects", "subject"),
        ("teacherId", "teacher_id = ?", "teachers", "teacher"),
        ("semesterId", "semester_id = ?", "semesters", "semester"),
        ("classId", "class_id = ?", "classes", "class"),
    ] {
        if let Some(v) = patch_nullable_text(patch, key)? {
            helpers::require_reference(conn, table, v.as_deref(), label)?;
            set_parts.push(column);
            bind_values.push(helpers::nullable_value(v));
        }
    }
    helpers::apply_update(conn, "grades", &grade_id, set_parts, bind_values)?;

    Ok(json!({ "grade": calc::load_grade(conn, &grade_id)? }))
}

fn grades_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let grade_id = get_required_str(params, "gradeId")?;
    let n = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e, "grades"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("grade not found"));
    }
    Ok(json!({ "ok": true }))
}

fn grades_student_averages(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let semester_id = get_optional_str(params, "semesterId")?;
    helpers::require_exists(conn, "students", &student_id, "student")?;

    let averages = calc::student_subject_averages(conn, &student_id, semester_id.as_deref())?;
    Ok(json!(averages))
}

fn grades_class_analysis(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let filter = grade_filter(params)?;
    let analysis = calc::class_semester_analysis(conn, &filter)?;
    Ok(json!(analysis))
}

fn parse_dimensions(params: &serde_json::Value) -> Result<Vec<Dimension>, HandlerErr> {
    let Some(arr) = params.get("dimensions").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("dimensions must be an array"));
    };
    let mut dims = Vec::with_capacity(arr.len());
    for v in arr {
        let d = v.as_str().and_then(Dimension::parse).ok_or_else(|| {
            HandlerErr::bad_params("dimensions may contain: student, subject, semester, class")
        })?;
        dims.push(d);
    }
    if dims.is_empty() {
        return Err(HandlerErr::bad_params("dimensions must not be empty"));
    }
    Ok(calc::normalize_dimensions(&dims))
}

/// Expected keys are objects such as `{ "subjectId": "..." }` carrying one
/// id per requested dimension.
fn parse_expected(
    params: &serde_json::Value,
    dims: &[Dimension],
) -> Result<Vec<GroupKey>, HandlerErr> {
    let Some(v) = params.get("expected") else {
        return Ok(Vec::new());
    };
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("expected must be an array"));
    };
    let mut keys = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let mut parts = Vec::with_capacity(dims.len());
        for d in dims {
            let field = format!("{}Id", d.as_str());
            let Some(id) = item
                .get(&field)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                return Err(HandlerErr::bad_params(format!(
                    "expected[{}] is missing {}",
                    i, field
                )));
            };
            parts.push((*d, id.to_string()));
        }
        keys.push(GroupKey::new(parts));
    }
    Ok(keys)
}

fn grades_aggregate(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let dims = parse_dimensions(params)?;
    let expected = parse_expected(params, &dims)?;
    let filter = grade_filter(params)?;

    let grades = calc::load_grades(conn, &filter)?;
    let agg = calc::aggregate(&grades, &dims, &expected);
    if agg.excluded.total > 0 {
        tracing::debug!(
            excluded = agg.excluded.total,
            "grades skipped for missing references"
        );
    }
    Ok(json!(agg))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "grades.list" => grades_list,
        "grades.create" => grades_create,
        "grades.update" => grades_update,
        "grades.delete" => grades_delete,
        "grades.studentAverages" => grades_student_averages,
        "grades.classAnalysis" => grades_class_analysis,
        "grades.aggregate" => grades_aggregate,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
