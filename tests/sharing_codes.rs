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
fn share_code_lifecycle() {
    let workspace = temp_dir("correctord-share");
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
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "prof", "password": "prof-pass" }),
    );

    let activity = send_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({
            "title": "Oral exam",
            "points": [10.0, 10.0],
            "partsNames": ["Fluency", "Content"]
        }),
    );
    let activity_id = activity
        .get("activityId")
        .and_then(|v| v.as_str())
        .expect("activityId")
        .to_string();
    let created = send_ok(
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
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "6",
        "corrections.updatePoints",
        json!({ "correctionId": correction_id, "pointsEarned": [7.0, 6.0] }),
    );

    let shared = send_ok(
        &mut stdin,
        &mut reader,
        "7",
        "share.create",
        json!({ "resourceType": "correction", "resourceId": correction_id }),
    );
    let code = shared
        .get("code")
        .and_then(|v| v.as_str())
        .expect("code")
        .to_string();
    assert_eq!(code.len(), 8);

    // Resolution needs no session at all.
    let _ = send_ok(&mut stdin, &mut reader, "8", "auth.logout", json!({}));
    let resolved = send_ok(
        &mut stdin,
        &mut reader,
        "9",
        "share.resolve",
        json!({ "code": code }),
    );
    assert_eq!(
        resolved.get("resourceType").and_then(|v| v.as_str()),
        Some("correction")
    );
    let snapshot = resolved.get("correction").expect("correction snapshot");
    assert_eq!(snapshot.get("grade").and_then(|v| v.as_f64()), Some(13.0));
    assert!(resolved
        .get("activity")
        .and_then(|a| a.get("title"))
        .and_then(|v| v.as_str())
        .is_some());

    // Revocation is owner-only, then the code stops resolving.
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.login",
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "11",
        "share.revoke",
        json!({ "code": code }),
    );
    let resolved = send(
        &mut stdin,
        &mut reader,
        "12",
        "share.resolve",
        json!({ "code": code }),
    );
    assert_eq!(error_code(&resolved), "not_found");

    let listed = send_ok(&mut stdin, &mut reader, "13", "share.list", json!({}));
    let codes = listed
        .get("codes")
        .and_then(|v| v.as_array())
        .expect("codes");
    assert_eq!(codes.len(), 1);
    assert_eq!(
        codes[0].get("revoked").and_then(|v| v.as_bool()),
        Some(true)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn expired_and_unknown_codes_do_not_resolve() {
    let workspace = temp_dir("correctord-share-expiry");
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
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let _ = send_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "prof", "password": "prof-pass" }),
    );
    let activity = send_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.create",
        json!({ "title": "Quiz", "points": [10.0], "partsNames": ["Q"] }),
    );
    let activity_id = activity
        .get("activityId")
        .and_then(|v| v.as_str())
        .expect("activityId")
        .to_string();

    let shared = send_ok(
        &mut stdin,
        &mut reader,
        "5",
        "share.create",
        json!({
            "resourceType": "activity",
            "resourceId": activity_id,
            "expiresAt": "2000-01-01T00:00:00Z"
        }),
    );
    let code = shared
        .get("code")
        .and_then(|v| v.as_str())
        .expect("code")
        .to_string();

    let resolved = send(
        &mut stdin,
        &mut reader,
        "6",
        "share.resolve",
        json!({ "code": code }),
    );
    assert_eq!(error_code(&resolved), "not_found");

    let resolved = send(
        &mut stdin,
        &mut reader,
        "7",
        "share.resolve",
        json!({ "code": "ZZZZZZZZ" }),
    );
    assert_eq!(error_code(&resolved), "not_found");

    let malformed = send(
        &mut stdin,
        &mut reader,
        "8",
        "share.create",
        json!({
            "resourceType": "activity",
            "resourceId": activity_id,
            "expiresAt": "tomorrow"
        }),
    );
    assert_eq!(error_code(&malformed), "bad_params");

    drop(stdin);
    let _ = child.wait();
}
