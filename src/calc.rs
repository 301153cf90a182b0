use crate::error::{CoreError, CoreResult};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

pub const GRADE_MIN: f64 = 0.0;
pub const GRADE_MAX: f64 = 20.0;

pub fn is_valid_grade(v: f64) -> bool {
    v.is_finite() && (GRADE_MIN..=GRADE_MAX).contains(&v)
}

/// Arithmetic mean, or `None` when there is nothing to average.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Student,
    Subject,
    Semester,
    Class,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Student => "student",
            Dimension::Subject => "subject",
            Dimension::Semester => "semester",
            Dimension::Class => "class",
        }
    }

    fn key_field(self) -> &'static str {
        match self {
            Dimension::Student => "studentId",
            Dimension::Subject => "subjectId",
            Dimension::Semester => "semesterId",
            Dimension::Class => "classId",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" | "studentid" => Some(Dimension::Student),
            "subject" | "subjectid" => Some(Dimension::Subject),
            "semester" | "semesterid" => Some(Dimension::Semester),
            "class" | "classid" => Some(Dimension::Class),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeKind {
    Homework,
    Test,
    Composition,
}

impl GradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeKind::Homework => "homework",
            GradeKind::Test => "test",
            GradeKind::Composition => "composition",
        }
    }

    /// Accepts the stored tags and the French labels used by older clients.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "homework" | "devoir" => Some(GradeKind::Homework),
            "test" | "interrogation" => Some(GradeKind::Test),
            "composition" => Some(GradeKind::Composition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub value: f64,
    pub kind: GradeKind,
    pub student_id: String,
    pub subject_id: Option<String>,
    pub teacher_id: Option<String>,
    pub semester_id: Option<String>,
    pub class_id: Option<String>,
    pub date: String,
}

impl GradeRecord {
    pub fn dimension(&self, d: Dimension) -> Option<&str> {
        match d {
            Dimension::Student => Some(self.student_id.as_str()),
            Dimension::Subject => self.subject_id.as_deref(),
            Dimension::Semester => self.semester_id.as_deref(),
            Dimension::Class => self.class_id.as_deref(),
        }
    }
}

/// Composite grouping key. Components are kept in `Dimension` order so the
/// same set of ids always produces the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey(Vec<(Dimension, String)>);

impl GroupKey {
    pub fn new(parts: impl IntoIterator<Item = (Dimension, String)>) -> Self {
        let mut v: Vec<(Dimension, String)> = parts.into_iter().collect();
        v.sort();
        v.dedup_by(|a, b| a.0 == b.0);
        GroupKey(v)
    }

    pub fn get(&self, d: Dimension) -> Option<&str> {
        self.0
            .iter()
            .find(|(dim, _)| *dim == d)
            .map(|(_, id)| id.as_str())
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (d, id) in &self.0 {
            map.serialize_entry(d.key_field(), id)?;
        }
        map.end()
    }
}

/// Sorted, de-duplicated dimension list.
pub fn normalize_dimensions(dims: &[Dimension]) -> Vec<Dimension> {
    let mut v = dims.to_vec();
    v.sort();
    v.dedup();
    v
}

/// Builds the key of `record` over `dims`, or reports the first dimension the
/// record has no reference for.
pub fn group_key(record: &GradeRecord, dims: &[Dimension]) -> Result<GroupKey, Dimension> {
    let mut parts = Vec::with_capacity(dims.len());
    for &d in dims {
        match record.dimension(d) {
            Some(id) if !id.is_empty() => parts.push((d, id.to_string())),
            _ => return Err(d),
        }
    }
    Ok(GroupKey::new(parts))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAverage {
    pub key: GroupKey,
    pub average: Option<f64>,
    pub count: usize,
    pub no_data: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exclusions {
    pub total: usize,
    pub by_missing_dimension: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    pub dimensions: Vec<&'static str>,
    pub groups: Vec<GroupAverage>,
    pub included: usize,
    pub excluded: Exclusions,
}

/// Groups grade records over `dims` and averages each group.
///
/// Records missing one of the requested references are skipped and counted in
/// `excluded`. Keys listed in `expected` always appear in the output, with
/// `average: None` when no record fell into them. Output is ordered by key.
pub fn aggregate<'a, I>(records: I, dims: &[Dimension], expected: &[GroupKey]) -> Aggregation
where
    I: IntoIterator<Item = &'a GradeRecord>,
{
    let dims = normalize_dimensions(dims);
    let mut buckets: BTreeMap<GroupKey, Vec<f64>> = BTreeMap::new();
    for k in expected {
        buckets.entry(k.clone()).or_default();
    }

    let mut included = 0usize;
    let mut excluded = Exclusions::default();
    for r in records {
        match group_key(r, &dims) {
            Ok(k) => {
                included += 1;
                buckets.entry(k).or_default().push(r.value);
            }
            Err(missing) => {
                excluded.total += 1;
                *excluded
                    .by_missing_dimension
                    .entry(missing.as_str())
                    .or_insert(0) += 1;
            }
        }
    }

    let groups = buckets
        .into_iter()
        .map(|(key, values)| {
            let average = mean(&values);
            GroupAverage {
                key,
                average,
                count: values.len(),
                no_data: average.is_none(),
            }
        })
        .collect();

    Aggregation {
        dimensions: dims.iter().map(|d| d.as_str()).collect(),
        groups,
        included,
        excluded,
    }
}

#[derive(Debug, Clone, Default)]
pub struct GradeFilter {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
    pub semester_id: Option<String>,
    pub class_id: Option<String>,
    pub teacher_id: Option<String>,
}

fn grade_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GradeRecord> {
    let kind: String = r.get(2)?;
    let kind = GradeKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown grade kind {:?}", kind).into(),
        )
    })?;
    Ok(GradeRecord {
        id: r.get(0)?,
        value: r.get(1)?,
        kind,
        student_id: r.get(3)?,
        subject_id: r.get(4)?,
        teacher_id: r.get(5)?,
        semester_id: r.get(6)?,
        class_id: r.get(7)?,
        date: r.get(8)?,
    })
}

pub fn load_grades(conn: &Connection, filter: &GradeFilter) -> CoreResult<Vec<GradeRecord>> {
    let mut sql = String::from(
        "SELECT id, value, kind, student_id, subject_id, teacher_id, semester_id, class_id, date
         FROM grades",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    let pairs = [
        ("student_id = ?", &filter.student_id),
        ("subject_id = ?", &filter.subject_id),
        ("semester_id = ?", &filter.semester_id),
        ("class_id = ?", &filter.class_id),
        ("teacher_id = ?", &filter.teacher_id),
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
    sql.push_str(" ORDER BY date, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), grade_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_grade(conn: &Connection, grade_id: &str) -> CoreResult<GradeRecord> {
    conn.query_row(
        "SELECT id, value, kind, student_id, subject_id, teacher_id, semester_id, class_id, date
         FROM grades WHERE id = ?",
        [grade_id],
        grade_from_row,
    )
    .optional()?
    .ok_or(CoreError::NotFound("grade"))
}

/// `id -> name` for a lookup table.
fn names_by_id(conn: &Connection, sql: &str) -> CoreResult<HashMap<String, String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverageRow {
    pub subject_id: String,
    pub subject: String,
    pub semester_id: String,
    pub semester: String,
    pub average: Option<f64>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverages {
    pub student_id: String,
    pub averages: Vec<SubjectAverageRow>,
    pub excluded: Exclusions,
}

/// Per-subject, per-semester averages for one student.
pub fn student_subject_averages(
    conn: &Connection,
    student_id: &str,
    semester_id: Option<&str>,
) -> CoreResult<StudentAverages> {
    let filter = GradeFilter {
        student_id: Some(student_id.to_string()),
        semester_id: semester_id.map(|s| s.to_string()),
        ..GradeFilter::default()
    };
    let grades = load_grades(conn, &filter)?;
    let agg = aggregate(
        &grades,
        &[Dimension::Student, Dimension::Subject, Dimension::Semester],
        &[],
    );

    let subjects = names_by_id(conn, "SELECT id, name FROM subjects")?;
    let semesters = names_by_id(conn, "SELECT id, name FROM semesters")?;

    let averages = agg
        .groups
        .into_iter()
        .map(|g| {
            let subject_id = g.key.get(Dimension::Subject).unwrap_or_default().to_string();
            let semester_id = g.key.get(Dimension::Semester).unwrap_or_default().to_string();
            SubjectAverageRow {
                subject: subjects.get(&subject_id).cloned().unwrap_or_default(),
                semester: semesters.get(&semester_id).cloned().unwrap_or_default(),
                subject_id,
                semester_id,
                average: g.average,
                count: g.count,
            }
        })
        .collect();

    Ok(StudentAverages {
        student_id: student_id.to_string(),
        averages,
        excluded: agg.excluded,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSemesterRow {
    pub class_id: String,
    pub class_name: String,
    pub level: Option<String>,
    pub semester_id: String,
    pub semester: String,
    pub average: Option<f64>,
    pub total_grades: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAnalysis {
    pub rows: Vec<ClassSemesterRow>,
    pub excluded: Exclusions,
}

/// Per-class, per-semester averages for the statistics view.
pub fn class_semester_analysis(conn: &Connection, filter: &GradeFilter) -> CoreResult<ClassAnalysis> {
    let grades = load_grades(conn, filter)?;
    let agg = aggregate(&grades, &[Dimension::Class, Dimension::Semester], &[]);

    let semesters = names_by_id(conn, "SELECT id, name FROM semesters")?;
    let mut classes: HashMap<String, (String, Option<String>)> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT id, name, level FROM classes")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, name, level) in rows {
            classes.insert(id, (name, level));
        }
    }

    let rows = agg
        .groups
        .into_iter()
        .map(|g| {
            let class_id = g.key.get(Dimension::Class).unwrap_or_default().to_string();
            let semester_id = g.key.get(Dimension::Semester).unwrap_or_default().to_string();
            let (class_name, level) = classes.get(&class_id).cloned().unwrap_or_default();
            ClassSemesterRow {
                class_name,
                level,
                semester: semesters.get(&semester_id).cloned().unwrap_or_default(),
                class_id,
                semester_id,
                average: g.average,
                total_grades: g.count,
            }
        })
        .collect();

    Ok(ClassAnalysis {
        rows,
        excluded: agg.excluded,
    })
}
