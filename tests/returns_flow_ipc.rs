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
    let exe = env!("CARGO_BIN_EXE_humbuchd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn humbuchd");
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
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_at<'a>(v: &'a serde_json::Value, path: &[&str]) -> &'a str {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key).unwrap_or_else(|| panic!("missing {} in {}", key, v));
    }
    cur.as_str().unwrap_or_else(|| panic!("not a string at {:?}", path))
}

fn create_material(
    title: &str,
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> String {
    let created = request_ok(stdin, reader, id, "materials.create", json!({ "name": title }));
    str_at(&created, &["materialId"]).to_string()
}

fn lend(
    student: &str,
    material: &str,
    until: &str,
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "loans.create",
        json!({
            "studentId": student,
            "materialId": material,
            "borrowFrom": "2024-09-01",
            "borrowUntil": until
        }),
    );
    str_at(&created, &["borrowedMaterialId"]).to_string()
}

#[test]
fn return_flow_groups_prints_and_returns_materials() {
    let workspace = temp_dir("humbuch-returns-flow");
    let roster = workspace.join("schueler.csv");
    std::fs::write(
        &roster,
        "Nachname;Vorname;Geburtsdatum;Geschlecht;Klasse\n\
Anders;Alice;01.02.2013;w;5a\n\
Brandt;Bob;03.04.2013;m;5a\n\
Albers;Carol;05.06.2012;w;6a\n",
    )
    .expect("write roster");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let mut n = 0u32;
    let mut next_id = || {
        n += 1;
        n.to_string()
    };

    request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(imported["created"], json!(3));

    let students = request_ok(&mut stdin, &mut reader, &next_id(), "students.list", json!({}));
    let students = students["students"].as_array().expect("students").clone();
    let names: Vec<&str> = students
        .iter()
        .map(|s| s["firstName"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    let alice = students[0]["id"].as_str().expect("alice").to_string();
    let bob = students[1]["id"].as_str().expect("bob").to_string();
    let carol = students[2]["id"].as_str().expect("carol").to_string();

    let mathe = create_material("Mathematik 5", &mut stdin, &mut reader, "m-1");
    let deutsch = create_material("Deutsch 6", &mut stdin, &mut reader, "m-2");
    let englisch = create_material("Englisch 5", &mut stdin, &mut reader, "m-3");
    let bio = create_material("Biologie 5", &mut stdin, &mut reader, "m-4");

    let m4 = lend(&alice, &mathe, "2025-07-31", &mut stdin, &mut reader, "l-1");
    let m3 = lend(&carol, &deutsch, "2026-07-31", &mut stdin, &mut reader, "l-2");
    let m2 = lend(&bob, &englisch, "2025-07-31", &mut stdin, &mut reader, "l-3");
    let m1 = lend(&alice, &bio, "2025-07-31", &mut stdin, &mut reader, "l-4");

    // Return list: grade 5a before 6a, Alice before Bob, titles sorted.
    let list = request_ok(&mut stdin, &mut reader, &next_id(), "returns.list", json!({}));
    let grades = list["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 2);
    assert_eq!(grades[0]["grade"]["name"], json!("5a"));
    assert_eq!(grades[1]["grade"]["name"], json!("6a"));
    let five_a = grades[0]["students"].as_array().expect("5a students");
    assert_eq!(five_a[0]["displayName"], json!("Anders, Alice"));
    let alice_titles: Vec<&str> = five_a[0]["materials"]
        .as_array()
        .expect("alice materials")
        .iter()
        .map(|m| m["teachingMaterial"]["name"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(alice_titles, vec!["Biologie 5", "Mathematik 5"]);

    let due = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.list",
        json!({ "dueBefore": "2025-08-01" }),
    );
    assert_eq!(due["grades"].as_array().expect("grades").len(), 1);

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.list",
        json!({ "filter": "bob" }),
    );
    let filtered = filtered["grades"].as_array().expect("grades");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["students"].as_array().expect("students").len(), 1);

    // Nothing selected yet.
    let actions = request_ok(&mut stdin, &mut reader, &next_id(), "returns.actions", json!({}));
    assert_eq!(actions["actions"]["saveReturned"], json!(false));
    assert_eq!(actions["actions"]["manualReturn"], json!(true));
    assert_eq!(actions["actions"]["studentList"], json!(false));
    assert_eq!(actions["manualReturn"]["kind"], json!("pickStudent"));

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.select",
        json!({
            "studentIds": [carol, bob, alice],
            "materialIds": [m4, m3, m2, m1]
        }),
    );
    assert_eq!(selected["actions"]["saveReturned"], json!(true));
    assert_eq!(selected["actions"]["manualReturn"], json!(false));
    assert_eq!(selected["actions"]["studentList"], json!(true));
    assert_eq!(selected["manualReturn"]["kind"], json!("disabled"));

    let printed = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.studentListModel",
        json!({}),
    );
    assert!(printed["fileName"]
        .as_str()
        .expect("fileName")
        .ends_with("_SchuelerRueckgabeListe.pdf"));
    let sections = printed["model"]["sections"].as_array().expect("sections");
    let order: Vec<&str> = sections
        .iter()
        .map(|s| s["studentId"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(order, vec![alice.as_str(), bob.as_str(), carol.as_str()]);
    let alice_rows: Vec<&str> = sections[0]["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["borrowedMaterialId"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(alice_rows, vec![m1.as_str(), m4.as_str()]);
    assert_eq!(printed["model"]["materialCount"], json!(4));

    // Explicit ids: Carol's material is dropped because Carol is not selected.
    let only_alice = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.studentListModel",
        json!({ "studentIds": [alice], "materialIds": [m3, m4] }),
    );
    let sections = only_alice["model"]["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0]["rows"].as_array().expect("rows").len(), 1);

    let unconfirmed = request(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.markReturned",
        json!({}),
    );
    assert_eq!(error_code(&unconfirmed), "not_confirmed");

    request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.select",
        json!({ "studentIds": [alice], "materialIds": [m1, m4, m3] }),
    );
    let returned = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.markReturned",
        json!({ "confirmed": true, "returnDate": "2025-07-15" }),
    );
    assert_eq!(returned["returned"], json!(3));
    assert_eq!(returned["actions"]["saveReturned"], json!(false));

    let after = request_ok(&mut stdin, &mut reader, &next_id(), "returns.list", json!({}));
    let grades = after["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0]["students"][0]["id"], json!(bob));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "loans.listForStudent",
        json!({ "studentId": alice, "includeReturned": true }),
    );
    let items = history["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["returnDate"] == json!("2025-07-15")));

    let again = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.markReturned",
        json!({ "confirmed": true, "materialIds": [m1] }),
    );
    assert_eq!(again["returned"], json!(0));
    assert_eq!(again["alreadyReturned"], json!([m1]));

    let unknown = request(
        &mut stdin,
        &mut reader,
        &next_id(),
        "returns.markReturned",
        json!({ "confirmed": true, "materialIds": [m2, "missing-id"] }),
    );
    assert_eq!(error_code(&unknown), "not_found");
    // The failed call must not have returned Bob's material.
    let still_open = request_ok(
        &mut stdin,
        &mut reader,
        &next_id(),
        "loans.listForStudent",
        json!({ "studentId": bob }),
    );
    assert_eq!(still_open["items"].as_array().expect("items").len(), 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn select_rejects_unknown_ids() {
    let workspace = temp_dir("humbuch-returns-select");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "1", "returns.list", json!({}));
    assert_eq!(error_code(&before), "no_workspace");

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "returns.select",
        json!({ "studentIds": ["nope"], "materialIds": [] }),
    );
    assert_eq!(error_code(&resp), "not_found");
    assert_eq!(resp["error"]["details"]["ids"], json!(["nope"]));

    let bad = request(
        &mut stdin,
        &mut reader,
        "4",
        "returns.select",
        json!({ "studentIds": "nope" }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "returns.studentListModel",
        json!({}),
    );
    assert_eq!(empty["model"]["sections"], json!([]));

    let _ = std::fs::remove_dir_all(workspace);
}
