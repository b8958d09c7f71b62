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

fn send(
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
    value
}

fn send_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = send(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

#[test]
fn mutations_require_a_session() {
    let workspace = temp_dir("correctord-auth-required");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    // No workspace selected yet.
    let res = send(
        &mut stdin,
        &mut reader,
        "1",
        "classes.list",
        json!({}),
    );
    assert_eq!(error_code(&res), "no_workspace");

    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Workspace selected but nobody signed in.
    let res = send(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "5A" }),
    );
    assert_eq!(error_code(&res), "unauthorized");
    let res = send(&mut stdin, &mut reader, "4", "activities.list", json!({}));
    assert_eq!(error_code(&res), "unauthorized");

    // Bad credentials never reveal which half was wrong.
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.register",
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let bad_pass = send(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "username": "prof", "password": "wrong" }),
    );
    let bad_user = send(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "username": "ghost", "password": "prof-pass" }),
    );
    assert_eq!(error_code(&bad_pass), "unauthorized");
    assert_eq!(error_code(&bad_user), "unauthorized");
    let msg = |v: &serde_json::Value| {
        v.get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    };
    assert_eq!(msg(&bad_pass), msg(&bad_user));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn users_cannot_see_each_others_data() {
    let workspace = temp_dir("correctord-auth-scope");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "alice", "password": "alice-pass" }),
    );
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.register",
        json!({ "username": "bob", "password": "bob-pass" }),
    );

    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "alice", "password": "alice-pass" }),
    );
    let created = send_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "name": "Alice's class" }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let activity = send_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.create",
        json!({ "title": "Alice's quiz", "points": [10.0], "partsNames": ["Q"] }),
    );
    let activity_id = activity
        .get("activityId")
        .and_then(|v| v.as_str())
        .expect("activityId")
        .to_string();

    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "username": "bob", "password": "bob-pass" }),
    );

    let classes = send_ok(&mut stdin, &mut reader, "8", "classes.list", json!({}));
    assert!(classes
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes")
        .is_empty());

    // Other users' resources answer as if they did not exist.
    let res = send(
        &mut stdin,
        &mut reader,
        "9",
        "activities.get",
        json!({ "activityId": activity_id }),
    );
    assert_eq!(error_code(&res), "not_found");
    let res = send(
        &mut stdin,
        &mut reader,
        "10",
        "students.create",
        json!({ "classId": class_id, "lastName": "Martin", "firstName": "Paul" }),
    );
    assert_eq!(error_code(&res), "not_found");
    let res = send(
        &mut stdin,
        &mut reader,
        "11",
        "share.create",
        json!({ "resourceType": "activity", "resourceId": activity_id }),
    );
    assert_eq!(error_code(&res), "not_found");

    // Duplicate usernames are refused outright.
    let res = send(
        &mut stdin,
        &mut reader,
        "12",
        "auth.register",
        json!({ "username": "alice", "password": "other" }),
    );
    assert_eq!(error_code(&res), "conflict");

    drop(stdin);
    let _ = child.wait();
}
