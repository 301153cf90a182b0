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

fn create_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    title: &str,
    class_id: &str,
) -> String {
    let r = request_ok(
        stdin,
        reader,
        id,
        "courses.create",
        json!({ "title": title, "content": "Chapitre 1", "classId": class_id }),
    );
    str_at(&r, "courseId").to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    last_name: &str,
    class_id: &str,
) -> String {
    let r = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "lastName": last_name, "firstName": "Aïcha", "classId": class_id }),
    );
    str_at(&r, "studentId").to_string()
}

fn student_entry<'a>(summary: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    summary["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|s| s["studentId"].as_str() == Some(student_id))
        .unwrap_or_else(|| panic!("no entry for {} in {}", student_id, summary))
}

#[test]
fn attendance_marks_upsert_and_summaries_report_rates() {
    let workspace = temp_dir("bulletind-attendance");
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
        json!({ "name": "CM2 A", "level": "CM2" }),
    );
    let class_id = str_at(&class, "classId").to_string();
    let s1 = create_student(&mut stdin, &mut reader, "3", "Bah", &class_id);
    let s2 = create_student(&mut stdin, &mut reader, "4", "Cissé", &class_id);
    let k1 = create_course(&mut stdin, &mut reader, "5", "Fractions", &class_id);
    let k2 = create_course(&mut stdin, &mut reader, "6", "Géographie", &class_id);

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.studentHistory",
        json!({ "studentId": s1 }),
    );
    assert_eq!(empty["summary"]["total"].as_u64(), Some(0));
    assert_eq!(empty["summary"]["rate"].as_f64(), Some(0.0));

    let marks = [
        (&s1, &k1, json!({ "status": "present" })),
        (&s1, &k2, json!({ "status": "unjustified_absent" })),
        (&s1, &k2, json!({ "status": "absent_justifie", "date": "2024-11-05" })),
        (&s2, &k1, json!({ "present": false })),
        (&s2, &k2, json!({ "present": true })),
    ];
    for (i, (student, course, extra)) in marks.into_iter().enumerate() {
        let mut params = json!({ "studentId": student, "courseId": course });
        if let (Some(obj), Some(more)) = (params.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            params,
        );
    }

    let pair = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.list",
        json!({ "studentId": s1, "courseId": k2 }),
    );
    let records = pair["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"].as_str(), Some("justified_absent"));
    assert_eq!(records[0]["date"].as_str(), Some("2024-11-05"));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.classSummary",
        json!({ "classId": class_id }),
    );
    let overall = &summary["summary"];
    assert_eq!(overall["total"].as_u64(), Some(4));
    assert_eq!(overall["present"].as_u64(), Some(2));
    assert_eq!(overall["justified"].as_u64(), Some(1));
    assert_eq!(overall["unjustified"].as_u64(), Some(1));
    assert_eq!(overall["rate"].as_f64(), Some(50.0));
    let first = student_entry(&summary, &s1);
    assert_eq!(first["studentName"].as_str(), Some("Bah, Aïcha"));
    assert_eq!(first["justified"].as_u64(), Some(1));
    assert_eq!(first["rate"].as_f64(), Some(50.0));
    let second = student_entry(&summary, &s2);
    assert_eq!(second["unjustified"].as_u64(), Some(1));

    let by_course = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.list",
        json!({ "courseId": k1 }),
    );
    assert_eq!(by_course["summary"]["total"].as_u64(), Some(2));
    assert_eq!(by_course["summary"]["present"].as_u64(), Some(1));

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.mark",
        json!({ "studentId": s1, "courseId": k1, "status": "late" }),
    );
    assert_eq!(error_code(&bad_status), "bad_params");
    let no_status = request(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.mark",
        json!({ "studentId": s1, "courseId": k1 }),
    );
    assert_eq!(error_code(&no_status), "bad_params");
    let unknown_course = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.mark",
        json!({ "studentId": s1, "courseId": "missing", "status": "present" }),
    );
    assert_eq!(error_code(&unknown_course), "bad_params");

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.studentHistory",
        json!({ "studentId": s2 }),
    );
    assert_eq!(history["records"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(history["summary"]["rate"].as_f64(), Some(50.0));

    let blocked = request(
        &mut stdin,
        &mut reader,
        "15",
        "courses.delete",
        json!({ "courseId": k1 }),
    );
    assert_eq!(error_code(&blocked), "bad_params");
    assert_eq!(
        blocked["error"]["details"]["referencedBy"][0].as_str(),
        Some("attendance")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
