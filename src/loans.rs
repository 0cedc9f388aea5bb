use crate::model::{BorrowedMaterial, Grade, MaterialRef, Student, TeachingMaterial};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct LoanError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LoanError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn update(e: rusqlite::Error, table: &str) -> Self {
        Self::new("db_update_failed", e.to_string()).with_details(json!({ "table": table }))
    }
}

pub const DATE_FMT: &str = "%Y-%m-%d";

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FMT).ok()
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_date))
}

const STUDENT_COLUMNS: &str = "s.id, s.last_name, s.first_name, s.birth_date, s.gender, s.profile, s.external_id,
     g.id, g.year, g.suffix
     FROM students s
     JOIN grades g ON g.id = s.grade_id";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        last_name: r.get(1)?,
        first_name: r.get(2)?,
        birthday: date_col(r, 3)?,
        gender: r.get(4)?,
        profile: r.get(5)?,
        external_id: r.get(6)?,
        grade: Grade {
            id: r.get(7)?,
            year: r.get(8)?,
            suffix: r.get(9)?,
        },
    })
}

const LOAN_COLUMNS: &str = "bm.id, bm.student_id, tm.id, tm.name, bm.borrow_from, bm.borrow_until, bm.return_date, bm.received
     FROM borrowed_materials bm
     JOIN teaching_materials tm ON tm.id = bm.teaching_material_id";

fn loan_from_row(r: &Row<'_>) -> rusqlite::Result<BorrowedMaterial> {
    let Some(borrow_from) = date_col(r, 4)? else {
        return Err(rusqlite::Error::InvalidColumnType(
            4,
            "borrow_from".to_string(),
            rusqlite::types::Type::Text,
        ));
    };
    Ok(BorrowedMaterial {
        id: r.get(0)?,
        student_id: r.get(1)?,
        teaching_material: MaterialRef {
            id: r.get(2)?,
            name: r.get(3)?,
        },
        borrow_from,
        borrow_until: date_col(r, 5)?,
        return_date: date_col(r, 6)?,
        received: r.get::<_, i64>(7)? != 0,
    })
}

pub fn list_grades(conn: &Connection) -> Result<Vec<Grade>, LoanError> {
    let mut stmt = conn
        .prepare("SELECT id, year, suffix FROM grades")
        .map_err(LoanError::query)?;
    let mut grades = stmt
        .query_map([], |r| {
            Ok(Grade {
                id: r.get(0)?,
                year: r.get(1)?,
                suffix: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(LoanError::query)?;
    grades.sort();
    Ok(grades)
}

/// Looks up a grade by year and suffix, creating it when missing.
/// The flag is true when a new row was inserted.
pub fn ensure_grade(conn: &Connection, year: i64, suffix: &str) -> Result<(Grade, bool), LoanError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades WHERE year = ? AND suffix = ?",
            (year, suffix),
            |r| r.get(0),
        )
        .optional()
        .map_err(LoanError::query)?;
    if let Some(id) = existing {
        return Ok((
            Grade {
                id,
                year,
                suffix: suffix.to_string(),
            },
            false,
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, year, suffix) VALUES(?, ?, ?)",
        (&id, year, suffix),
    )
    .map_err(|e| LoanError::update(e, "grades"))?;
    Ok((
        Grade {
            id,
            year,
            suffix: suffix.to_string(),
        },
        true,
    ))
}

pub fn load_students(conn: &Connection, grade_id: Option<&str>) -> Result<Vec<Student>, LoanError> {
    let mut students = match grade_id {
        Some(gid) => {
            let sql = format!("SELECT {} WHERE s.grade_id = ?", STUDENT_COLUMNS);
            let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
            let rows = stmt
                .query_map([gid], student_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(LoanError::query)?;
            rows
        }
        None => {
            let sql = format!("SELECT {}", STUDENT_COLUMNS);
            let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
            let rows = stmt
                .query_map([], student_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(LoanError::query)?;
            rows
        }
    };
    students.sort_by(|a, b| a.grade.cmp(&b.grade).then_with(|| a.cmp(b)));
    Ok(students)
}

/// Loads the given students; every id must exist.
pub fn load_students_by_ids<'a, I>(conn: &Connection, ids: I) -> Result<Vec<Student>, LoanError>
where
    I: IntoIterator<Item = &'a String>,
{
    let ids: Vec<&String> = ids.into_iter().collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {} WHERE s.id IN ({})", STUDENT_COLUMNS, placeholders);
    let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
    let students = stmt
        .query_map(params_from_iter(ids.iter()), student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(LoanError::query)?;
    ensure_all_found(&ids, students.iter().map(|s| s.id.as_str()), "student")?;
    Ok(students)
}

pub fn get_student(conn: &Connection, student_id: &str) -> Result<Student, LoanError> {
    let sql = format!("SELECT {} WHERE s.id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], student_from_row)
        .optional()
        .map_err(LoanError::query)?
        .ok_or_else(|| LoanError::new("not_found", "student not found"))
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub grade_id: String,
    pub last_name: String,
    pub first_name: String,
    pub birthday: Option<NaiveDate>,
    pub gender: Option<String>,
    pub profile: Option<String>,
    pub external_id: Option<String>,
}

pub fn insert_student(conn: &Connection, s: &NewStudent) -> Result<String, LoanError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, grade_id, last_name, first_name, birth_date, gender, profile, external_id, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        (
            &id,
            &s.grade_id,
            &s.last_name,
            &s.first_name,
            s.birthday.map(format_date),
            s.gender.as_deref(),
            s.profile.as_deref(),
            s.external_id.as_deref(),
        ),
    )
    .map_err(|e| LoanError::update(e, "students"))?;
    Ok(id)
}

pub fn list_teaching_materials(conn: &Connection) -> Result<Vec<TeachingMaterial>, LoanError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, producer, from_grade, to_grade
             FROM teaching_materials
             ORDER BY name COLLATE NOCASE, id",
        )
        .map_err(LoanError::query)?;
    stmt.query_map([], |r| {
        Ok(TeachingMaterial {
            id: r.get(0)?,
            name: r.get(1)?,
            producer: r.get(2)?,
            from_grade: r.get(3)?,
            to_grade: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(LoanError::query)
}

pub fn insert_teaching_material(
    conn: &Connection,
    name: &str,
    producer: Option<&str>,
    from_grade: Option<i64>,
    to_grade: Option<i64>,
) -> Result<TeachingMaterial, LoanError> {
    if let (Some(from), Some(to)) = (from_grade, to_grade) {
        if from > to {
            return Err(LoanError::new("bad_params", "fromGrade must not exceed toGrade")
                .with_details(json!({ "fromGrade": from, "toGrade": to })));
        }
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teaching_materials(id, name, producer, from_grade, to_grade) VALUES(?, ?, ?, ?, ?)",
        (&id, name, producer, from_grade, to_grade),
    )
    .map_err(|e| LoanError::update(e, "teaching_materials"))?;
    Ok(TeachingMaterial {
        id,
        name: name.to_string(),
        producer: producer.map(|s| s.to_string()),
        from_grade,
        to_grade,
    })
}

pub fn create_loan(
    conn: &Connection,
    student_id: &str,
    teaching_material_id: &str,
    borrow_from: NaiveDate,
    borrow_until: Option<NaiveDate>,
) -> Result<BorrowedMaterial, LoanError> {
    get_student(conn, student_id)?;
    let material_name: Option<String> = conn
        .query_row(
            "SELECT name FROM teaching_materials WHERE id = ?",
            [teaching_material_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(LoanError::query)?;
    let Some(material_name) = material_name else {
        return Err(LoanError::new("not_found", "teaching material not found"));
    };
    if let Some(until) = borrow_until {
        if until < borrow_from {
            return Err(LoanError::new("bad_params", "borrowUntil is before borrowFrom"));
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO borrowed_materials(id, student_id, teaching_material_id, borrow_from, borrow_until, return_date, received)
         VALUES(?, ?, ?, ?, ?, NULL, 1)",
        (
            &id,
            student_id,
            teaching_material_id,
            format_date(borrow_from),
            borrow_until.map(format_date),
        ),
    )
    .map_err(|e| LoanError::update(e, "borrowed_materials"))?;

    Ok(BorrowedMaterial {
        id,
        student_id: student_id.to_string(),
        teaching_material: MaterialRef {
            id: teaching_material_id.to_string(),
            name: material_name,
        },
        borrow_from,
        borrow_until,
        return_date: None,
        received: true,
    })
}

pub fn loans_for_student(
    conn: &Connection,
    student_id: &str,
    include_returned: bool,
) -> Result<Vec<BorrowedMaterial>, LoanError> {
    get_student(conn, student_id)?;
    let sql = if include_returned {
        format!("SELECT {} WHERE bm.student_id = ? ORDER BY bm.rowid", LOAN_COLUMNS)
    } else {
        format!(
            "SELECT {} WHERE bm.student_id = ? AND bm.return_date IS NULL ORDER BY bm.rowid",
            LOAN_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
    let mut loans = stmt
        .query_map([student_id], loan_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(LoanError::query)?;
    loans.sort_by(|a, b| a.cmp_title(b));
    Ok(loans)
}

/// Open, received loans in insertion order, optionally only those due on or
/// before `due_before`.
pub fn open_loans(conn: &Connection, due_before: Option<NaiveDate>) -> Result<Vec<BorrowedMaterial>, LoanError> {
    let rows = match due_before {
        Some(day) => {
            let sql = format!(
                "SELECT {} WHERE bm.return_date IS NULL AND bm.received = 1
                   AND bm.borrow_until IS NOT NULL AND bm.borrow_until <= ?
                 ORDER BY bm.rowid",
                LOAN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
            let rows = stmt
                .query_map([format_date(day)], loan_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(LoanError::query)?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} WHERE bm.return_date IS NULL AND bm.received = 1 ORDER BY bm.rowid",
                LOAN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
            let rows = stmt
                .query_map([], loan_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(LoanError::query)?;
            rows
        }
    };
    Ok(rows)
}

/// Loads the given borrowed materials in insertion order; every id must exist.
pub fn load_loans_by_ids<'a, I>(conn: &Connection, ids: I) -> Result<Vec<BorrowedMaterial>, LoanError>
where
    I: IntoIterator<Item = &'a String>,
{
    let ids: Vec<&String> = ids.into_iter().collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} WHERE bm.id IN ({}) ORDER BY bm.rowid",
        LOAN_COLUMNS, placeholders
    );
    let mut stmt = conn.prepare(&sql).map_err(LoanError::query)?;
    let loans = stmt
        .query_map(params_from_iter(ids.iter()), loan_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(LoanError::query)?;
    ensure_all_found(&ids, loans.iter().map(|l| l.id.as_str()), "borrowed material")?;
    Ok(loans)
}

fn ensure_all_found<'a>(
    wanted: &[&String],
    found: impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<(), LoanError> {
    let found: HashSet<&str> = found.collect();
    let mut missing: Vec<&str> = wanted
        .iter()
        .map(|s| s.as_str())
        .filter(|id| !found.contains(id))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    missing.dedup();
    Err(LoanError::new("not_found", format!("{} not found", what))
        .with_details(json!({ "ids": missing })))
}
