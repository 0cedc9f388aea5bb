use crate::db;
use crate::ipc::error::{err, loan_err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut, optional_date, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::loans::{self, NewStudent};
use crate::model::Grade;
use crate::returns::student_matches;
use crate::roster::{self, RosterOptions};
use serde_json::json;
use std::path::PathBuf;

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match loans::list_grades(conn) {
        Ok(grades) => {
            let rows: Vec<serde_json::Value> = grades
                .iter()
                .map(|g| {
                    json!({
                        "id": g.id,
                        "year": g.year,
                        "suffix": g.suffix,
                        "name": g.full_name()
                    })
                })
                .collect();
            ok(&req.id, json!({ "grades": rows }))
        }
        Err(e) => loan_err(&req.id, e),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = optional_str(req, "gradeId");
    let filter = optional_str(req, "filter").unwrap_or_default();

    let students = match loans::load_students(conn, grade_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    let rows: Vec<serde_json::Value> = students
        .iter()
        .filter(|s| student_matches(s, &filter))
        .map(|s| {
            json!({
                "id": s.id,
                "displayName": s.display_name(),
                "lastName": s.last_name,
                "firstName": s.first_name,
                "grade": s.grade.full_name(),
                "gradeId": s.grade.id,
                "birthday": s.birthday.map(loans::format_date),
                "gender": s.gender,
                "profile": s.profile,
                "externalId": s.external_id
            })
        })
        .collect();
    ok(&req.id, json!({ "students": rows }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_text = match required_str(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let birthday = match optional_date(req, "birthday") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some((year, suffix)) = Grade::parse_full(&grade_text) else {
        return err(
            &req.id,
            "bad_params",
            "grade must look like 5a",
            Some(json!({ "grade": grade_text })),
        );
    };

    let (grade, _) = match loans::ensure_grade(conn, year, &suffix) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    let new_student = NewStudent {
        grade_id: grade.id.clone(),
        last_name,
        first_name,
        birthday,
        gender: optional_str(req, "gender").map(|g| g.to_lowercase()),
        profile: optional_str(req, "profile"),
        external_id: optional_str(req, "externalId"),
    };
    match loans::insert_student(conn, &new_student) {
        Ok(student_id) => ok(
            &req.id,
            json!({ "studentId": student_id, "gradeId": grade.id }),
        ),
        Err(e) => loan_err(&req.id, e),
    }
}

fn roster_options(state: &AppState, req: &Request) -> Result<RosterOptions, serde_json::Value> {
    let mut options = RosterOptions::default();
    let conn = db_conn(state, req)?;
    // Not trimmed: a literal tab is a valid delimiter.
    let raw = req
        .params
        .get("delimiter")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let delimiter = raw.unwrap_or_else(|| {
        db::settings_get_str(
            conn,
            "roster.delimiter",
            &roster::DEFAULT_DELIMITER.to_string(),
        )
    });
    let delimiter = if delimiter.eq_ignore_ascii_case("tab") {
        "\t".to_string()
    } else {
        delimiter
    };
    match delimiter.as_bytes() {
        [b] => options.delimiter = *b,
        _ => {
            return Err(err(
                &req.id,
                "bad_params",
                "delimiter must be a single ASCII character",
                Some(json!({ "delimiter": delimiter })),
            ))
        }
    }
    options.date_format = db::settings_get_str(conn, "roster.dateFormat", roster::DEFAULT_DATE_FORMAT);
    Ok(options)
}

fn handle_students_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match required_str(req, "path") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    let options = match roster_options(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bytes = match std::fs::read(&path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };
    let sha256 = roster::file_sha256(&bytes);
    let parsed = match roster::parse_roster_bytes(&bytes, &options) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                e.to_string(),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };

    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match roster::import_roster(conn, &path, &sha256, parsed) {
        Ok(summary) => ok(&req.id, json!(summary)),
        Err(e) => loan_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.importCsv" => Some(handle_students_import_csv(state, req)),
        _ => None,
    }
}
