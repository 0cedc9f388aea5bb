use crate::model::{BorrowedMaterial, Grade, Student};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMaterials {
    pub student: Student,
    pub materials: Vec<BorrowedMaterial>,
}

/// Groups the selected materials under the selected students for the printed
/// return list: grade order first, then student order, then material title.
///
/// Students without a matching material get no entry. Materials whose owner is
/// not among `students` are dropped.
pub fn group_student_list(
    students: &[Student],
    materials: &[BorrowedMaterial],
) -> Vec<StudentMaterials> {
    let mut by_grade: BTreeMap<&Grade, Vec<&Student>> = BTreeMap::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for student in students {
        if !seen.insert(student.id.as_str()) {
            continue;
        }
        by_grade.entry(&student.grade).or_default().push(student);
    }

    let mut out: Vec<StudentMaterials> = Vec::new();
    for in_grade in by_grade.values_mut() {
        in_grade.sort();
        for student in in_grade.iter() {
            let mut matched: Vec<BorrowedMaterial> = materials
                .iter()
                .filter(|m| m.student_id == student.id)
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            // Vec::sort_by is stable; equal titles keep their input order.
            matched.sort_by(|a, b| a.cmp_title(b));
            out.push(StudentMaterials {
                student: (*student).clone(),
                materials: matched,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentListRow {
    pub borrowed_material_id: String,
    pub title: String,
    pub borrow_from: NaiveDate,
    pub borrow_until: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentListSection {
    pub student_id: String,
    pub display_name: String,
    pub grade: String,
    pub rows: Vec<StudentListRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentListModel {
    pub title: String,
    pub generated_on: NaiveDate,
    pub student_count: usize,
    pub material_count: usize,
    pub sections: Vec<StudentListSection>,
}

/// Flattens a grouping into the shape handed to the PDF renderer.
pub fn student_list_model(
    groups: &[StudentMaterials],
    title: &str,
    generated_on: NaiveDate,
) -> StudentListModel {
    let sections: Vec<StudentListSection> = groups
        .iter()
        .map(|g| StudentListSection {
            student_id: g.student.id.clone(),
            display_name: g.student.display_name(),
            grade: g.student.grade.full_name(),
            rows: g
                .materials
                .iter()
                .map(|m| StudentListRow {
                    borrowed_material_id: m.id.clone(),
                    title: m.teaching_material.name.clone(),
                    borrow_from: m.borrow_from,
                    borrow_until: m.borrow_until,
                })
                .collect(),
        })
        .collect();
    let material_count = sections.iter().map(|s| s.rows.len()).sum();

    StudentListModel {
        title: title.to_string(),
        generated_on,
        student_count: sections.len(),
        material_count,
        sections,
    }
}
