use crate::db;
use crate::ipc::error::{loan_err, ok};
use crate::ipc::helpers::{db_conn, optional_id_list, today};
use crate::ipc::types::{AppState, Request};
use crate::loans;
use crate::report;
use serde_json::json;

const DEFAULT_FILE_NAME: &str = "SchuelerRueckgabeListe.pdf";
const DEFAULT_TITLE: &str = "Schüler Rückgabe Liste";

/// Model for the printable student return list. Ids default to the current
/// selection; the renderer on the other side turns it into a PDF.
fn handle_returns_student_list_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_ids = match optional_id_list(req, "studentIds") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let material_ids = match optional_id_list(req, "materialIds") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let snapshot = state.returns.snapshot();
    let student_ids: Vec<String> =
        student_ids.unwrap_or_else(|| snapshot.student_ids.into_iter().collect());
    let material_ids: Vec<String> =
        material_ids.unwrap_or_else(|| snapshot.material_ids.into_iter().collect());

    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let students = match loans::load_students_by_ids(conn, &student_ids) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    let materials = match loans::load_loans_by_ids(conn, &material_ids) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };

    let groups = report::group_student_list(&students, &materials);
    let title = db::settings_get_str(conn, "reports.studentListTitle", DEFAULT_TITLE);
    let file_name = db::settings_get_str(conn, "reports.studentListFileName", DEFAULT_FILE_NAME);
    let model = report::student_list_model(&groups, &title, today());
    tracing::info!(
        students = model.student_count,
        materials = model.material_count,
        "student return list prepared"
    );

    ok(
        &req.id,
        json!({
            "fileName": format!("{}_{}", chrono::Local::now().format("%Y%m%d%H%M%S"), file_name),
            "model": model
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "returns.studentListModel" => Some(handle_returns_student_list_model(state, req)),
        _ => None,
    }
}
