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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_correctord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn correctord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn fragments_crud_and_usage_ordering() {
    let workspace = temp_dir("correctord-fragments");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "prof", "password": "prof-pass" }),
    );

    let f1 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fragments.create",
        json!({ "category": "praise", "content": "Solid reasoning." }),
    );
    let f1_id = f1
        .get("fragmentId")
        .and_then(|v| v.as_str())
        .expect("fragmentId")
        .to_string();
    let f2 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fragments.create",
        json!({ "category": "praise", "content": "Great improvement." }),
    );
    let f2_id = f2
        .get("fragmentId")
        .and_then(|v| v.as_str())
        .expect("fragmentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fragments.create",
        json!({ "category": "todo", "content": "Revise chapter 3." }),
    );

    // Categories keep independent sort orders.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fragments.list",
        json!({ "category": "praise" }),
    );
    let fragments = listed
        .get("fragments")
        .and_then(|v| v.as_array())
        .expect("fragments");
    assert_eq!(fragments.len(), 2);
    assert_eq!(
        fragments[0].get("id").and_then(|v| v.as_str()),
        Some(f1_id.as_str())
    );
    assert_eq!(
        fragments[0].get("sortOrder").and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(
        fragments[1].get("sortOrder").and_then(|v| v.as_i64()),
        Some(1)
    );

    let used = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fragments.markUsed",
        json!({ "fragmentId": f2_id }),
    );
    assert_eq!(used.get("usageCount").and_then(|v| v.as_i64()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fragments.update",
        json!({ "fragmentId": f1_id, "content": "Solid, well-argued reasoning." }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "fragments.delete",
        json!({ "fragmentId": f2_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "fragments.list",
        json!({ "category": "praise" }),
    );
    let fragments = listed
        .get("fragments")
        .and_then(|v| v.as_array())
        .expect("fragments");
    assert_eq!(fragments.len(), 1);
    assert_eq!(
        fragments[0].get("content").and_then(|v| v.as_str()),
        Some("Solid, well-argued reasoning.")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn log_records_mutations_and_filters_by_entity() {
    let workspace = temp_dir("correctord-log");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "prof", "password": "prof-pass" }),
    );

    let activity = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({ "title": "Lab report", "points": [10.0], "partsNames": ["Report"] }),
    );
    let activity_id = activity
        .get("activityId")
        .and_then(|v| v.as_str())
        .expect("activityId")
        .to_string();
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "corrections.create",
        json!({ "activityId": activity_id }),
    );
    let correction_id = created
        .get("correction")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("correction id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "corrections.updatePoints",
        json!({ "correctionId": correction_id, "pointsEarned": [9.0] }),
    );

    let log = request_ok(&mut stdin, &mut reader, "7", "log.list", json!({}));
    let entries = log
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries");
    assert!(entries.len() >= 3, "expected create+create+grade entries");

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "log.list",
        json!({ "entityType": "correction", "entityId": correction_id }),
    );
    let entries = filtered
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries");
    assert_eq!(entries.len(), 2);
    for e in entries {
        assert_eq!(
            e.get("entityId").and_then(|v| v.as_str()),
            Some(correction_id.as_str())
        );
    }
    let actions: Vec<&str> = entries
        .iter()
        .filter_map(|e| e.get("action").and_then(|v| v.as_str()))
        .collect();
    assert!(actions.contains(&"create"));
    assert!(actions.contains(&"grade"));

    drop(stdin);
    let _ = child.wait();
}
