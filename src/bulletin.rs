use crate::calc::{self, Dimension, GradeFilter, GroupKey};
use crate::db;
use crate::error::{CoreError, CoreResult};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Level label for report cards whose class carries no level.
pub const UNKNOWN_LEVEL: &str = "Inconnu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardSubject {
    pub subject_id: String,
    pub subject_name: String,
    pub coefficient: Option<f64>,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub class_name: String,
    pub class_level: Option<String>,
    pub semester_id: String,
    pub semester_name: String,
    pub subjects: Vec<ReportCardSubject>,
    pub overall_average: f64,
    pub remarks: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct NewReportCard<'a> {
    pub student_id: &'a str,
    pub class_id: &'a str,
    pub semester_id: &'a str,
    pub entries: &'a [SubjectAverage],
    pub remarks: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct ReportCardFilter {
    pub student_id: Option<String>,
    pub class_id: Option<String>,
    pub semester_id: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelGroup {
    pub level: String,
    pub report_cards: Vec<ReportCard>,
}

/// Checks the subject list before anything is written: non-empty, no
/// duplicate subjects, every average a grade in [0,20].
pub fn validate_entries(entries: &[SubjectAverage]) -> CoreResult<()> {
    if entries.is_empty() {
        return Err(CoreError::validation(
            "a report card needs at least one subject average",
        ));
    }
    let mut seen = HashSet::new();
    for (i, e) in entries.iter().enumerate() {
        if e.subject_id.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "entries[{}].subjectId must not be empty",
                i
            )));
        }
        if !calc::is_valid_grade(e.average) {
            return Err(CoreError::validation(format!(
                "entries[{}].average must be between {} and {}",
                i,
                calc::GRADE_MIN,
                calc::GRADE_MAX
            )));
        }
        if !seen.insert(e.subject_id.as_str()) {
            return Err(CoreError::validation(format!(
                "subject {} listed twice",
                e.subject_id
            )));
        }
    }
    Ok(())
}

/// Coefficient-weighted mean of the subject averages. Subjects absent from
/// `coefficients` weigh 1. Weights are scaled by the largest coefficient so
/// huge coefficients cannot overflow the sums.
pub fn overall_average(
    entries: &[SubjectAverage],
    coefficients: &HashMap<String, f64>,
) -> CoreResult<f64> {
    if entries.is_empty() {
        return Err(CoreError::validation(
            "overall average is undefined for an empty subject list",
        ));
    }
    let mut weights = Vec::with_capacity(entries.len());
    for e in entries {
        let coef = coefficients.get(&e.subject_id).copied().unwrap_or(1.0);
        if !coef.is_finite() || coef < 0.0 {
            return Err(CoreError::validation(format!(
                "subject {} has an invalid coefficient",
                e.subject_id
            )));
        }
        weights.push(coef);
    }
    let max_weight = weights.iter().copied().fold(0.0, f64::max);
    if max_weight <= 0.0 {
        return Err(CoreError::validation(
            "overall average is undefined when every coefficient is 0",
        ));
    }

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (e, coef) in entries.iter().zip(weights) {
        let w = coef / max_weight;
        weighted += e.average * w;
        total_weight += w;
    }
    let overall = weighted / total_weight;
    if !overall.is_finite() {
        return Err(CoreError::validation("overall average is not a number"));
    }
    Ok(overall.clamp(calc::GRADE_MIN, calc::GRADE_MAX))
}

/// Known coefficients for the listed subjects. Fails on subjects that do not exist.
fn load_coefficients(
    conn: &Connection,
    entries: &[SubjectAverage],
) -> CoreResult<HashMap<String, f64>> {
    let mut out = HashMap::new();
    let mut stmt = conn.prepare("SELECT coefficient FROM subjects WHERE id = ?")?;
    for e in entries {
        let row: Option<Option<f64>> = stmt
            .query_row([&e.subject_id], |r| r.get(0))
            .optional()?;
        match row {
            None => {
                return Err(CoreError::validation(format!(
                    "unknown subject {}",
                    e.subject_id
                )))
            }
            Some(Some(c)) => {
                out.insert(e.subject_id.clone(), c);
            }
            Some(None) => {}
        }
    }
    Ok(out)
}

fn write_entries(conn: &Connection, card_id: &str, entries: &[SubjectAverage]) -> CoreResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO report_card_subjects(report_card_id, position, subject_id, average)
         VALUES(?, ?, ?, ?)",
    )?;
    for (i, e) in entries.iter().enumerate() {
        stmt.execute((card_id, i as i64, &e.subject_id, e.average))?;
    }
    Ok(())
}

pub fn build(conn: &Connection, card: &NewReportCard<'_>) -> CoreResult<ReportCard> {
    validate_entries(card.entries)?;
    db::require_row(conn, "students", card.student_id, "student")?;
    db::require_row(conn, "classes", card.class_id, "class")?;
    db::require_row(conn, "semesters", card.semester_id, "semester")?;
    let coefficients = load_coefficients(conn, card.entries)?;
    let overall = overall_average(card.entries, &coefficients)?;

    let id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO report_cards(id, student_id, class_id, semester_id, overall_average, remarks, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            card.student_id,
            card.class_id,
            card.semester_id,
            overall,
            card.remarks,
            &now,
            &now,
        ),
    )?;
    write_entries(&tx, &id, card.entries)?;
    tx.commit()?;

    tracing::info!(report_card = %id, student = card.student_id, overall, "report card created");
    fetch(conn, &id)
}

pub fn update(
    conn: &Connection,
    id: &str,
    entries: &[SubjectAverage],
    remarks: &str,
) -> CoreResult<ReportCard> {
    if !exists(conn, id)? {
        return Err(CoreError::NotFound("report card"));
    }
    validate_entries(entries)?;
    let coefficients = load_coefficients(conn, entries)?;
    let overall = overall_average(entries, &coefficients)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM report_card_subjects WHERE report_card_id = ?",
        [id],
    )?;
    write_entries(&tx, id, entries)?;
    tx.execute(
        "UPDATE report_cards SET overall_average = ?, remarks = ?, updated_at = ? WHERE id = ?",
        (overall, remarks, db::now_timestamp(), id),
    )?;
    tx.commit()?;

    tracing::info!(report_card = %id, overall, "report card updated");
    fetch(conn, id)
}

pub fn delete(conn: &Connection, id: &str) -> CoreResult<()> {
    if !exists(conn, id)? {
        return Err(CoreError::NotFound("report card"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM report_card_subjects WHERE report_card_id = ?",
        [id],
    )?;
    tx.execute("DELETE FROM report_cards WHERE id = ?", [id])?;
    tx.commit()?;
    tracing::info!(report_card = %id, "report card deleted");
    Ok(())
}

fn exists(conn: &Connection, id: &str) -> CoreResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM report_cards WHERE id = ?", [id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

const CARD_SELECT: &str = "SELECT
       rc.id, rc.student_id, COALESCE(s.last_name || ', ' || s.first_name, ''),
       rc.class_id, COALESCE(c.name, ''), c.level,
       rc.semester_id, COALESCE(sem.name, ''),
       rc.overall_average, rc.remarks, rc.created_at, rc.updated_at
     FROM report_cards rc
     LEFT JOIN students s ON s.id = rc.student_id
     LEFT JOIN classes c ON c.id = rc.class_id
     LEFT JOIN semesters sem ON sem.id = rc.semester_id";

fn card_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ReportCard> {
    Ok(ReportCard {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_id: r.get(3)?,
        class_name: r.get(4)?,
        class_level: r.get(5)?,
        semester_id: r.get(6)?,
        semester_name: r.get(7)?,
        subjects: Vec::new(),
        overall_average: r.get(8)?,
        remarks: r.get(9)?,
        created_at: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

fn attach_subjects(conn: &Connection, card: &mut ReportCard) -> CoreResult<()> {
    let mut stmt = conn.prepare(
        "SELECT rcs.subject_id, COALESCE(sub.name, ''), sub.coefficient, rcs.average
         FROM report_card_subjects rcs
         LEFT JOIN subjects sub ON sub.id = rcs.subject_id
         WHERE rcs.report_card_id = ?
         ORDER BY rcs.position",
    )?;
    card.subjects = stmt
        .query_map([&card.id], |r| {
            Ok(ReportCardSubject {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                coefficient: r.get(2)?,
                average: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

pub fn fetch(conn: &Connection, id: &str) -> CoreResult<ReportCard> {
    let sql = format!("{} WHERE rc.id = ?", CARD_SELECT);
    let mut card = conn
        .query_row(&sql, [id], card_from_row)
        .optional()?
        .ok_or(CoreError::NotFound("report card"))?;
    attach_subjects(conn, &mut card)?;
    Ok(card)
}

pub fn list(conn: &Connection, filter: &ReportCardFilter) -> CoreResult<Vec<ReportCard>> {
    let mut sql = String::from(CARD_SELECT);
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    let pairs = [
        ("rc.student_id = ?", &filter.student_id),
        ("rc.class_id = ?", &filter.class_id),
        ("rc.semester_id = ?", &filter.semester_id),
        ("c.level = ?", &filter.level),
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
    sql.push_str(" ORDER BY c.level, c.name, s.last_name, s.first_name, rc.created_at");

    let mut stmt = conn.prepare(&sql)?;
    let mut cards = stmt
        .query_map(params_from_iter(bind), card_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for card in cards.iter_mut() {
        attach_subjects(conn, card)?;
    }
    Ok(cards)
}

/// Groups report cards by class level for display. Levels come out sorted,
/// cards keep their incoming order within a level.
pub fn group_by_level(cards: &[ReportCard]) -> Vec<LevelGroup> {
    let mut by_level: BTreeMap<String, Vec<ReportCard>> = BTreeMap::new();
    for card in cards {
        let level = card
            .class_level
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(UNKNOWN_LEVEL);
        by_level
            .entry(level.to_string())
            .or_default()
            .push(card.clone());
    }
    by_level
        .into_iter()
        .map(|(level, report_cards)| LevelGroup {
            level,
            report_cards,
        })
        .collect()
}

/// Builds a report card from the student's stored grades for one semester:
/// one entry per subject with at least one grade, ordered by subject name.
pub fn generate(
    conn: &Connection,
    student_id: &str,
    semester_id: &str,
    remarks: &str,
) -> CoreResult<ReportCard> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| CoreError::validation(format!("unknown student {}", student_id)))?;
    let Some(class_id) = class_id else {
        return Err(CoreError::validation("student is not assigned to a class"));
    };
    db::require_row(conn, "semesters", semester_id, "semester")?;

    let mut subjects: Vec<(String, String)> = conn
        .prepare("SELECT id, name FROM subjects WHERE class_id = ?")?
        .query_map([&class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let grades = calc::load_grades(
        conn,
        &GradeFilter {
            student_id: Some(student_id.to_string()),
            semester_id: Some(semester_id.to_string()),
            ..GradeFilter::default()
        },
    )?;
    let expected: Vec<GroupKey> = subjects
        .iter()
        .map(|(id, _)| GroupKey::new([(Dimension::Subject, id.clone())]))
        .collect();
    let agg = calc::aggregate(&grades, &[Dimension::Subject], &expected);
    if agg.excluded.total > 0 {
        tracing::debug!(
            student = student_id,
            excluded = agg.excluded.total,
            "grades without subject left out of report card"
        );
    }

    // Graded subjects outside the class list still count; look up their names.
    let known: HashSet<String> = subjects.iter().map(|(id, _)| id.clone()).collect();
    for g in &agg.groups {
        if let Some(id) = g.key.get(Dimension::Subject) {
            if !known.contains(id) {
                let name: String = conn
                    .query_row("SELECT name FROM subjects WHERE id = ?", [id], |r| r.get(0))
                    .optional()?
                    .unwrap_or_default();
                subjects.push((id.to_string(), name));
            }
        }
    }
    let names: HashMap<&str, &str> = subjects
        .iter()
        .map(|(id, name)| (id.as_str(), name.as_str()))
        .collect();

    let mut entries: Vec<(&str, SubjectAverage)> = agg
        .groups
        .iter()
        .filter_map(|g| {
            let id = g.key.get(Dimension::Subject)?;
            let average = g.average?;
            Some((
                names.get(id).copied().unwrap_or(""),
                SubjectAverage {
                    subject_id: id.to_string(),
                    average,
                },
            ))
        })
        .collect();
    if entries.is_empty() {
        return Err(CoreError::validation(
            "no grades recorded for this student in this semester",
        ));
    }
    entries.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.subject_id.cmp(&b.1.subject_id)));
    let entries: Vec<SubjectAverage> = entries.into_iter().map(|(_, e)| e).collect();

    build(
        conn,
        &NewReportCard {
            student_id,
            class_id: &class_id,
            semester_id,
            entries: &entries,
            remarks,
        },
    )
}
