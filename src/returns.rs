use crate::loans::{format_date, LoanError};
use crate::model::{BorrowedMaterial, Grade, Student};
use crate::report::StudentMaterials;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeGroup {
    pub grade: Grade,
    pub students: Vec<StudentMaterials>,
}

/// Case-insensitive substring match on the student's names and grade.
/// A blank filter matches everyone.
pub fn student_matches(student: &Student, filter: &str) -> bool {
    let needle = filter.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    [
        student.display_name(),
        student.first_name.clone(),
        student.last_name.clone(),
        format!("{} {}", student.first_name, student.last_name),
        student.grade.full_name(),
    ]
    .iter()
    .any(|hay| hay.to_lowercase().contains(&needle))
}

/// Open loans grouped by grade, then student. Students without an open loan
/// and students rejected by `filter` are left out.
pub fn return_list(students: &[Student], loans: &[BorrowedMaterial], filter: &str) -> Vec<GradeGroup> {
    let mut by_student: BTreeMap<&str, Vec<&BorrowedMaterial>> = BTreeMap::new();
    for loan in loans.iter().filter(|l| l.is_open()) {
        by_student.entry(loan.student_id.as_str()).or_default().push(loan);
    }

    let mut grades: BTreeMap<&Grade, Vec<&Student>> = BTreeMap::new();
    for student in students {
        if !by_student.contains_key(student.id.as_str()) || !student_matches(student, filter) {
            continue;
        }
        let in_grade = grades.entry(&student.grade).or_default();
        if !in_grade.iter().any(|s| s.id == student.id) {
            in_grade.push(student);
        }
    }

    grades
        .into_iter()
        .map(|(grade, mut in_grade)| {
            in_grade.sort();
            let students = in_grade
                .into_iter()
                .map(|student| {
                    let mut materials: Vec<BorrowedMaterial> = by_student
                        .get(student.id.as_str())
                        .map(|v| v.iter().map(|m| (*m).clone()).collect())
                        .unwrap_or_default();
                    materials.sort_by(|a, b| a.cmp_title(b));
                    StudentMaterials {
                        student: student.clone(),
                        materials,
                    }
                })
                .collect();
            GradeGroup {
                grade: grade.clone(),
                students,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnOutcome {
    pub returned: usize,
    pub already_returned: Vec<String>,
}

/// Sets the return date on every listed loan that is still open. Repeated ids
/// count once. Fails without touching anything when an id is unknown.
pub fn mark_returned(
    conn: &mut Connection,
    material_ids: &[String],
    on: NaiveDate,
) -> Result<ReturnOutcome, LoanError> {
    let tx = conn.transaction().map_err(LoanError::query)?;
    let mut returned = 0usize;
    let mut already_returned: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in material_ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let changed = tx
            .execute(
                "UPDATE borrowed_materials SET return_date = ? WHERE id = ? AND return_date IS NULL",
                (format_date(on), id),
            )
            .map_err(|e| LoanError::update(e, "borrowed_materials"))?;
        if changed > 0 {
            returned += changed;
            continue;
        }
        let exists = tx
            .query_row(
                "SELECT COUNT(*) FROM borrowed_materials WHERE id = ?",
                [id],
                |r| r.get::<_, i64>(0),
            )
            .map_err(LoanError::query)?
            > 0;
        if exists {
            already_returned.push(id.clone());
        } else {
            missing.push(id.clone());
        }
    }
    if !missing.is_empty() {
        // Dropping the transaction rolls back the updates above.
        return Err(LoanError::new("not_found", "borrowed material not found")
            .with_details(json!({ "ids": missing })));
    }
    tx.commit()
        .map_err(|e| LoanError::update(e, "borrowed_materials"))?;
    tracing::info!(returned, skipped = already_returned.len(), "materials returned");
    Ok(ReturnOutcome {
        returned,
        already_returned,
    })
}
