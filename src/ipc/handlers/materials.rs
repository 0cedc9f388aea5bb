use crate::ipc::error::{loan_err, ok};
use crate::ipc::helpers::{db_conn, optional_date, optional_i64, optional_str, required_str, today};
use crate::ipc::types::{AppState, Request};
use crate::loans;
use serde_json::json;

fn handle_materials_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match loans::list_teaching_materials(conn) {
        Ok(materials) => ok(&req.id, json!({ "materials": materials })),
        Err(e) => loan_err(&req.id, e),
    }
}

fn handle_materials_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let from_grade = match optional_i64(req, "fromGrade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let to_grade = match optional_i64(req, "toGrade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let producer = optional_str(req, "producer");

    match loans::insert_teaching_material(conn, &name, producer.as_deref(), from_grade, to_grade) {
        Ok(material) => ok(&req.id, json!({ "materialId": material.id, "material": material })),
        Err(e) => loan_err(&req.id, e),
    }
}

/// Manual lending: records one borrowed material for a student.
fn handle_loans_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let material_id = match required_str(req, "materialId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let borrow_from = match optional_date(req, "borrowFrom") {
        Ok(v) => v.unwrap_or_else(today),
        Err(e) => return e,
    };
    let borrow_until = match optional_date(req, "borrowUntil") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match loans::create_loan(conn, &student_id, &material_id, borrow_from, borrow_until) {
        Ok(loan) => {
            tracing::info!(student = %student_id, material = %material_id, "material lent");
            ok(&req.id, json!({ "borrowedMaterialId": loan.id, "borrowedMaterial": loan }))
        }
        Err(e) => loan_err(&req.id, e),
    }
}

fn handle_loans_list_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_returned = req
        .params
        .get("includeReturned")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let student = match loans::get_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return loan_err(&req.id, e),
    };
    match loans::loans_for_student(conn, &student_id, include_returned) {
        Ok(items) => ok(
            &req.id,
            json!({
                "student": {
                    "id": student.id,
                    "displayName": student.display_name(),
                    "grade": student.grade.full_name()
                },
                "items": items
            }),
        ),
        Err(e) => loan_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "materials.list" => Some(handle_materials_list(state, req)),
        "materials.create" => Some(handle_materials_create(state, req)),
        "loans.create" => Some(handle_loans_create(state, req)),
        "loans.listForStudent" => Some(handle_loans_list_for_student(state, req)),
        _ => None,
    }
}
