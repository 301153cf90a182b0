use crate::ipc::helpers::{self, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const COUNTED_TABLES: &[(&str, &str)] = &[
    ("classes", "classes"),
    ("students", "students"),
    ("teachers", "teachers"),
    ("subjects", "subjects"),
    ("semesters", "semesters"),
    ("courses", "courses"),
    ("grades", "grades"),
    ("report_cards", "reportCards"),
    ("attendance", "attendance"),
];

fn stats_counts(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let mut counts = serde_json::Map::new();
    for (table, key) in COUNTED_TABLES {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
            r.get(0)
        })?;
        counts.insert((*key).to_string(), json!(n));
    }
    Ok(json!({ "counts": counts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: helpers::Handler = match req.method.as_str() {
        "stats.counts" => stats_counts,
        _ => return None,
    };
    Some(helpers::run(state, req, handler))
}
