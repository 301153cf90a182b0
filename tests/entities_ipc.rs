use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .env_remove("BULLETIND_WORKSPACE")
        .env_remove("BULLETIND_DB_FILE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_at<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
}

#[test]
fn entity_crud_and_delete_guards() {
    let workspace = temp_dir("bulletind-entities");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "6ème A", "level": "6ème", "section": "A" }),
    );
    let class_id = str_at(&class, "classId").to_string();
    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.update",
        json!({ "classId": class_id, "patch": { "name": "6ème A1", "section": null } }),
    );
    assert_eq!(renamed["class"]["name"].as_str(), Some("6ème A1"));
    assert!(renamed["class"]["section"].is_null());

    let orphan = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "lastName": "Sy", "firstName": "Ibrahima", "birthDate": "2012-03-09" }),
    );
    let student_id = str_at(&orphan, "studentId").to_string();
    let bad_class = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.assignClass",
        json!({ "studentId": student_id, "classId": "nope" }),
    );
    assert_eq!(error_code(&bad_class), "bad_params");
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.assignClass",
        json!({ "studentId": student_id, "classId": class_id }),
    );
    assert_eq!(assigned["student"]["className"].as_str(), Some("6ème A1"));
    let in_class = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(in_class["students"].as_array().map(|a| a.len()), Some(1));
    let bad_date = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": student_id, "patch": { "birthDate": "09/03/2012" } }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    let negative = request(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.create",
        json!({ "name": "SVT", "coefficient": -1, "classId": class_id }),
    );
    assert_eq!(error_code(&negative), "bad_params");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.create",
        json!({ "name": "SVT", "classId": class_id }),
    );
    let subject_id = str_at(&subject, "subjectId").to_string();
    let weighted = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.update",
        json!({ "subjectId": subject_id, "patch": { "coefficient": 3 } }),
    );
    assert_eq!(weighted["subject"]["coefficient"].as_f64(), Some(3.0));

    let inverted = request(
        &mut stdin,
        &mut reader,
        "12",
        "semesters.create",
        json!({ "name": "S2", "startDate": "2025-06-30", "endDate": "2025-02-01" }),
    );
    assert_eq!(error_code(&inverted), "bad_params");
    let semester = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "semesters.create",
        json!({ "name": "S2", "startDate": "2025-02-01", "endDate": "2025-06-30" }),
    );
    let semester_id = str_at(&semester, "semesterId").to_string();
    let shrunk = request(
        &mut stdin,
        &mut reader,
        "14",
        "semesters.update",
        json!({ "semesterId": semester_id, "patch": { "endDate": "2025-01-01" } }),
    );
    assert_eq!(error_code(&shrunk), "bad_params");

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "teachers.create",
        json!({ "name": "M. Ndiaye", "email": "ndiaye@example.org" }),
    );
    let teacher_id = str_at(&teacher, "teacherId").to_string();
    let linked = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "teachers.assignClasses",
        json!({ "teacherId": teacher_id, "classIds": [class_id, class_id] }),
    );
    assert_eq!(linked["teacher"]["classIds"].as_array().map(|a| a.len()), Some(1));
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "teachers.assignSubjects",
        json!({ "teacherId": teacher_id, "subjectIds": [subject_id] }),
    );
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "teachers.setChargeSheet",
        json!({ "teacherId": teacher_id, "chargeSheet": "18h / semaine" }),
    );
    assert_eq!(sheet["teacher"]["chargeSheet"].as_str(), Some("18h / semaine"));
    let taught = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "teachers.classes",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(taught["classes"][0]["studentCount"].as_i64(), Some(1));

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "courses.create",
        json!({
            "title": "La cellule",
            "subjectId": subject_id,
            "classId": class_id,
            "teacherId": teacher_id
        }),
    );
    let course_id = str_at(&course, "courseId").to_string();
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "courses.get",
        json!({ "courseId": course_id }),
    );
    assert_eq!(fetched["course"]["teacherName"].as_str(), Some("M. Ndiaye"));
    let by_teacher = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "courses.list",
        json!({ "teacherId": teacher_id, "subjectId": subject_id }),
    );
    assert_eq!(by_teacher["courses"].as_array().map(|a| a.len()), Some(1));

    let class_in_use = request(
        &mut stdin,
        &mut reader,
        "23",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    assert_eq!(error_code(&class_in_use), "bad_params");
    let referenced_by: Vec<&str> = class_in_use["error"]["details"]["referencedBy"]
        .as_array()
        .expect("referencedBy")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(referenced_by, vec!["students", "subjects", "courses"]);

    let teacher_in_use = request(
        &mut stdin,
        &mut reader,
        "24",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(error_code(&teacher_in_use), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "courses.delete",
        json!({ "courseId": course_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "teachers.delete",
        json!({ "teacherId": teacher_id }),
    );
    let missing_course = request(
        &mut stdin,
        &mut reader,
        "27",
        "courses.get",
        json!({ "courseId": course_id }),
    );
    assert_eq!(error_code(&missing_course), "not_found");
    request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "semesters.delete",
        json!({ "semesterId": semester_id }),
    );

    let counts = request_ok(&mut stdin, &mut reader, "29", "stats.counts", json!({}));
    assert_eq!(counts["counts"]["students"].as_i64(), Some(1));
    assert_eq!(counts["counts"]["teachers"].as_i64(), Some(0));
    assert_eq!(counts["counts"]["semesters"].as_i64(), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn subject_linked_to_teacher_deletes_with_its_links() {
    let workspace = temp_dir("bulletind-subject-links");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Philosophie", "coefficient": 2 }),
    );
    let subject_id = str_at(&subject, "subjectId").to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "name": "Mme Faye" }),
    );
    let teacher_id = str_at(&teacher, "teacherId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.assignSubjects",
        json!({ "teacherId": teacher_id, "subjectIds": [subject_id] }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "6", "teachers.list", json!({}));
    assert_eq!(
        listed["teachers"][0]["subjectIds"].as_array().map(|a| a.len()),
        Some(0)
    );
    let subjects = request_ok(&mut stdin, &mut reader, "7", "subjects.list", json!({}));
    assert_eq!(subjects["subjects"].as_array().map(|a| a.len()), Some(0));
    let again = request(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(error_code(&again), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
