use crate::db;
use crate::error::{CoreError, CoreResult};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    JustifiedAbsent,
    UnjustifiedAbsent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::JustifiedAbsent => "justified_absent",
            AttendanceStatus::UnjustifiedAbsent => "unjustified_absent",
        }
    }

    /// Stored tags plus the French tags written by the first web client.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "present" | "présent" => Some(AttendanceStatus::Present),
            "justified_absent" | "absent_justifie" => Some(AttendanceStatus::JustifiedAbsent),
            "unjustified_absent" | "absent_non_justifie" | "absent" => {
                Some(AttendanceStatus::UnjustifiedAbsent)
            }
            _ => None,
        }
    }
}

/// Reads `status` (a tag) or, failing that, the boolean `present` toggle.
/// `present: false` records an unjustified absence.
pub fn status_from_params(params: &serde_json::Value) -> CoreResult<AttendanceStatus> {
    if let Some(v) = params.get("status").filter(|v| !v.is_null()) {
        let Some(s) = v.as_str() else {
            return Err(CoreError::validation("status must be a string"));
        };
        return AttendanceStatus::parse(s).ok_or_else(|| {
            CoreError::validation(
                "status must be one of: present, justified_absent, unjustified_absent",
            )
        });
    }
    match params.get("present").and_then(|v| v.as_bool()) {
        Some(true) => Ok(AttendanceStatus::Present),
        Some(false) => Ok(AttendanceStatus::UnjustifiedAbsent),
        None => Err(CoreError::validation("missing status")),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total: usize,
    pub present: usize,
    pub justified: usize,
    pub unjustified: usize,
    /// Percentage of present records, one decimal. 0 when there are no records.
    pub rate: f64,
}

pub fn attendance_rate(present: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (1000.0 * present as f64 / total as f64).round() / 10.0
}

pub fn summarize<I>(statuses: I) -> AttendanceSummary
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut s = AttendanceSummary::default();
    for status in statuses {
        s.total += 1;
        match status {
            AttendanceStatus::Present => s.present += 1,
            AttendanceStatus::JustifiedAbsent => s.justified += 1,
            AttendanceStatus::UnjustifiedAbsent => s.unjustified += 1,
        }
    }
    s.rate = attendance_rate(s.present, s.total);
    s
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_id: Option<String>,
    pub course_id: String,
    pub course_title: String,
    pub status: AttendanceStatus,
    pub date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub student_name: String,
    #[serde(flatten)]
    pub summary: AttendanceSummary,
}

/// One summary per student, ordered by student id.
pub fn summarize_by_student(records: &[AttendanceRecord]) -> Vec<StudentAttendance> {
    let mut by_student: BTreeMap<&str, (&str, Vec<AttendanceStatus>)> = BTreeMap::new();
    for r in records {
        by_student
            .entry(r.student_id.as_str())
            .or_insert_with(|| (r.student_name.as_str(), Vec::new()))
            .1
            .push(r.status);
    }
    by_student
        .into_iter()
        .map(|(id, (name, statuses))| StudentAttendance {
            student_id: id.to_string(),
            student_name: name.to_string(),
            summary: summarize(statuses),
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub student_id: Option<String>,
    pub course_id: Option<String>,
    pub class_id: Option<String>,
}

const RECORD_SELECT: &str = "SELECT
       a.id, a.student_id, COALESCE(s.last_name || ', ' || s.first_name, ''), s.class_id,
       a.course_id, COALESCE(c.title, ''), a.status, a.date
     FROM attendance a
     LEFT JOIN students s ON s.id = a.student_id
     LEFT JOIN courses c ON c.id = a.course_id";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = r.get(6)?;
    let status = AttendanceStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown attendance status {:?}", status).into(),
        )
    })?;
    Ok(AttendanceRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_id: r.get(3)?,
        course_id: r.get(4)?,
        course_title: r.get(5)?,
        status,
        date: r.get(7)?,
    })
}

/// Records `status` for the (student, course) pair. A second mark for the
/// same pair overwrites the first; the table's unique constraint makes the
/// upsert atomic.
pub fn mark(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    status: AttendanceStatus,
    date: Option<&str>,
) -> CoreResult<AttendanceRecord> {
    db::require_row(conn, "students", student_id, "student")?;
    db::require_row(conn, "courses", course_id, "course")?;
    let date = date.map(|d| d.to_string()).unwrap_or_else(db::today);

    conn.execute(
        "INSERT INTO attendance(id, student_id, course_id, status, date)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id)
         DO UPDATE SET status = excluded.status, date = excluded.date",
        (
            Uuid::new_v4().to_string(),
            student_id,
            course_id,
            status.as_str(),
            &date,
        ),
    )?;
    tracing::debug!(
        student = student_id,
        course = course_id,
        status = status.as_str(),
        "attendance marked"
    );

    let sql = format!("{} WHERE a.student_id = ? AND a.course_id = ?", RECORD_SELECT);
    let record = conn.query_row(&sql, (student_id, course_id), record_from_row)?;
    Ok(record)
}

pub fn list(conn: &Connection, filter: &AttendanceFilter) -> CoreResult<Vec<AttendanceRecord>> {
    let mut sql = String::from(RECORD_SELECT);
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    let pairs = [
        ("a.student_id = ?", &filter.student_id),
        ("a.course_id = ?", &filter.course_id),
        ("s.class_id = ?", &filter.class_id),
    ];
    for (clause, v) in pairs {
        if let Some(v) = v {
            clauses.push(clause);
            bind.push(Value::Text(v.clone()));
        }
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.date DESC, s.last_name, s.first_name");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
