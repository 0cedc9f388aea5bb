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

#[test]
fn roster_import_reports_warnings_and_upserts_on_reimport() {
    let workspace = temp_dir("humbuch-roster-import");
    let roster = workspace.join("schueler_stamm.csv");
    std::fs::write(
        &roster,
        "Nachname;Vorname;Geburtsdatum;Geschlecht;Klasse;Sprachen\n\
Abel;Jonas;14.03.2013;m;5b;E F\n\
Zivko;Adelina;02.01.2013;w;5a;E\n\
;Ohne;01.01.2013;w;5a;E\n\
Kurz;Karl;31.02.2013;m;5a;\n",
    )
    .expect("write roster");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(first["rowsTotal"], json!(4));
    assert_eq!(first["created"], json!(3));
    assert_eq!(first["updated"], json!(0));
    assert_eq!(first["skipped"], json!(1));
    assert_eq!(first["gradesCreated"], json!(2));
    let warned_rows: Vec<i64> = first["warnings"]
        .as_array()
        .expect("warnings")
        .iter()
        .map(|w| w["row"].as_i64().unwrap_or(0))
        .collect();
    assert_eq!(warned_rows, vec![4, 5]);
    assert_eq!(first["sha256"].as_str().map(|s| s.len()), Some(64));

    let grades = request_ok(&mut stdin, &mut reader, "3", "grades.list", json!({}));
    let names: Vec<&str> = grades["grades"]
        .as_array()
        .expect("grades")
        .iter()
        .map(|g| g["name"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(names, vec!["5a", "5b"]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "filter": "zivko" }),
    );
    let listed = listed["students"].as_array().expect("students");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["grade"], json!("5a"));
    assert_eq!(listed[0]["birthday"], json!("2013-01-02"));
    assert_eq!(listed[0]["gender"], json!("w"));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(second["created"], json!(0));
    assert_eq!(second["updated"], json!(3));
    assert_eq!(second["sha256"], first["sha256"]);

    let all = request_ok(&mut stdin, &mut reader, "6", "students.list", json!({}));
    assert_eq!(all["students"].as_array().expect("students").len(), 3);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn roster_delimiter_comes_from_settings() {
    let workspace = temp_dir("humbuch-roster-settings");
    let roster = workspace.join("roster.csv");
    std::fs::write(
        &roster,
        "student_id,last_name,first_name,grade\nS-1,Lovelace,Ada,10c\nS-2,Turing,Alan,10c\n",
    )
    .expect("write roster");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Default delimiter is ';', so the header is one unknown column.
    let wrong = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(error_code(&wrong), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "settings.set",
        json!({ "key": "roster.delimiter", "value": "," }),
    );
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "settings.get",
        json!({ "key": "roster.delimiter" }),
    );
    assert_eq!(stored["value"], json!(","));

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(imported["created"], json!(2));

    // Same external id on re-import updates the row in place.
    std::fs::write(
        &roster,
        "student_id,last_name,first_name,grade\nS-1,King,Ada,11a\n",
    )
    .expect("rewrite roster");
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(moved["updated"], json!(1));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "filter": "11a" }),
    );
    let listed = listed["students"].as_array().expect("students");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["displayName"], json!("King, Ada"));
    assert_eq!(listed[0]["externalId"], json!("S-1"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.importCsv",
        json!({ "path": workspace.join("nope.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "io_failed");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn windows_1252_roster_imports_umlauts_and_matches_on_reimport() {
    let workspace = temp_dir("humbuch-roster-cp1252");
    let roster = workspace.join("stamm_excel.csv");
    std::fs::write(&roster, b"Nachname;Vorname;Klasse\nM\xFCller;J\xF6rg;5a\n")
        .expect("write roster");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(first["created"], json!(1));
    assert_eq!(first["encoding"], json!("windows-1252"));
    assert_eq!(first["warnings"], json!([]));

    let listed = request_ok(&mut stdin, &mut reader, "3", "students.list", json!({}));
    let listed = listed["students"].as_array().expect("students");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["displayName"], json!("Müller, Jörg"));

    // The same student saved as UTF-8 matches the stored name.
    std::fs::write(&roster, "Nachname;Vorname;Klasse\nMüller;Jörg;6a\n").expect("rewrite roster");
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy() }),
    );
    assert_eq!(second["encoding"], json!("UTF-8"));
    assert_eq!(second["created"], json!(0));
    assert_eq!(second["updated"], json!(1));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn literal_tab_delimiter_is_kept() {
    let workspace = temp_dir("humbuch-roster-tab");
    let roster = workspace.join("roster.tsv");
    std::fs::write(
        &roster,
        "Nachname\tVorname\tKlasse\nAbel\tJonas\t5b\nZivko\tAdelina\t5a\n",
    )
    .expect("write roster");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy(), "delimiter": "\t" }),
    );
    assert_eq!(imported["created"], json!(2));

    let by_keyword = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy(), "delimiter": "TAB" }),
    );
    assert_eq!(by_keyword["updated"], json!(2));

    let too_long = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.importCsv",
        json!({ "path": roster.to_string_lossy(), "delimiter": ";;" }),
    );
    assert_eq!(error_code(&too_long), "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
