use crate::ipc::error::{err, loan_err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut, optional_date, optional_id_list, optional_str, today};
use crate::ipc::types::{AppState, Request};
use crate::loans;
use crate::returns;
use crate::selection::{manual_return_target, Selection};
use serde_json::json;

fn handle_returns_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filter = optional_str(req, "filter").unwrap_or_default();
    let due_before = match optional_date(req, "dueBefore") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let students = match loans::load_students(conn, None) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    let open = match loans::open_loans(conn, due_before) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    let groups = returns::return_list(&students, &open, &filter);

    let grades: Vec<serde_json::Value> = groups
        .iter()
        .map(|g| {
            json!({
                "grade": { "id": g.grade.id, "name": g.grade.full_name() },
                "students": g.students.iter().map(|s| json!({
                    "id": s.student.id,
                    "displayName": s.student.display_name(),
                    "materials": s.materials
                })).collect::<Vec<_>>()
            })
        })
        .collect();
    ok(&req.id, json!({ "grades": grades }))
}

fn actions_json(state: &AppState) -> serde_json::Value {
    json!({
        "selection": state.returns.selection(),
        "actions": state.returns.flags(),
        "manualReturn": manual_return_target(state.returns.selection())
    })
}

fn handle_returns_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_ids = match optional_id_list(req, "studentIds") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    let material_ids = match optional_id_list(req, "materialIds") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        if let Err(e) = loans::load_students_by_ids(conn, &student_ids) {
            return loan_err(&req.id, e);
        }
        if let Err(e) = loans::load_loans_by_ids(conn, &material_ids) {
            return loan_err(&req.id, e);
        }
    }

    state.returns.select(Selection {
        student_ids: student_ids.into_iter().collect(),
        material_ids: material_ids.into_iter().collect(),
    });
    ok(&req.id, actions_json(state))
}

fn handle_returns_actions(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, actions_json(state))
}

fn handle_returns_mark_returned(state: &mut AppState, req: &Request) -> serde_json::Value {
    let confirmed = req
        .params
        .get("confirmed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !confirmed {
        return err(
            &req.id,
            "not_confirmed",
            "confirm that signed lists exist for the selected materials",
            None,
        );
    }
    let material_ids: Vec<String> = match optional_id_list(req, "materialIds") {
        Ok(Some(v)) => v,
        Ok(None) => state.returns.snapshot().material_ids.into_iter().collect(),
        Err(e) => return e,
    };
    if material_ids.is_empty() {
        return err(&req.id, "bad_params", "no borrowed materials selected", None);
    }
    let on = match optional_date(req, "returnDate") {
        Ok(v) => v.unwrap_or_else(today),
        Err(e) => return e,
    };

    let outcome = {
        let conn = match db_conn_mut(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        match returns::mark_returned(conn, &material_ids, on) {
            Ok(v) => v,
            Err(e) => return loan_err(&req.id, e),
        }
    };
    state.returns.forget_materials(&material_ids);

    ok(
        &req.id,
        json!({
            "returned": outcome.returned,
            "alreadyReturned": outcome.already_returned,
            "returnDate": loans::format_date(on),
            "actions": state.returns.flags()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "returns.list" => Some(handle_returns_list(state, req)),
        "returns.select" => Some(handle_returns_select(state, req)),
        "returns.actions" => Some(handle_returns_actions(state, req)),
        "returns.markReturned" => Some(handle_returns_mark_returned(state, req)),
        _ => None,
    }
}
