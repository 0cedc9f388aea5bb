use crate::loans::{ensure_grade, format_date, insert_student, LoanError, NewStudent};
use crate::model::Grade;
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::path::Path;
use uuid::Uuid;

pub const DEFAULT_DELIMITER: char = ';';
pub const DEFAULT_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone)]
pub struct RosterOptions {
    pub delimiter: u8,
    pub date_format: String,
}

impl Default for RosterOptions {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER as u8,
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterStudent {
    pub row: usize,
    pub last_name: String,
    pub first_name: String,
    pub grade_year: i64,
    pub grade_suffix: String,
    pub birthday: Option<NaiveDate>,
    pub gender: Option<String>,
    pub profile: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterWarning {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRoster {
    pub students: Vec<RosterStudent>,
    pub warnings: Vec<RosterWarning>,
    pub rows_total: usize,
    /// Encoding the file was read with, `UTF-8` or `windows-1252`.
    pub encoding: String,
}

#[derive(Debug, Default)]
struct Columns {
    last_name: Option<usize>,
    first_name: Option<usize>,
    birthday: Option<usize>,
    gender: Option<usize>,
    grade: Option<usize>,
    profile: Option<usize>,
    external_id: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut cols = Columns::default();
        for (idx, raw) in headers.iter().enumerate() {
            let key: String = raw
                .trim()
                .trim_start_matches('\u{feff}')
                .to_lowercase()
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect();
            let slot = match key.as_str() {
                "nachname" | "lastname" | "last_name" => &mut cols.last_name,
                "vorname" | "firstname" | "first_name" => &mut cols.first_name,
                "geburtsdatum" | "birthday" | "birth_date" | "birthdate" => &mut cols.birthday,
                "geschlecht" | "gender" => &mut cols.gender,
                "klasse" | "grade" => &mut cols.grade,
                "profil" | "sprachen" | "profile" => &mut cols.profile,
                "id" | "schueler_id" | "schülerid" | "schuelerid" | "student_id" => {
                    &mut cols.external_id
                }
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        cols
    }

    fn missing_required(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.last_name.is_none() {
            out.push("last name");
        }
        if self.first_name.is_none() {
            out.push("first name");
        }
        if self.grade.is_none() {
            out.push("grade");
        }
        out
    }
}

fn field(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Reads a student master data CSV. Rows that cannot become a student are
/// reported as warnings; a bad header is an error.
pub fn parse_roster_csv(text: &str, options: &RosterOptions) -> anyhow::Result<ParsedRoster> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let cols = Columns::from_headers(&headers);
    let missing = cols.missing_required();
    if !missing.is_empty() {
        anyhow::bail!("CSV header lacks required columns: {}", missing.join(", "));
    }

    let mut out = ParsedRoster::default();
    for (i, record) in reader.records().enumerate() {
        // Row 1 is the header.
        let row = i + 2;
        out.rows_total += 1;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                out.warnings.push(RosterWarning {
                    row,
                    reason: format!("unreadable row: {}", e),
                });
                continue;
            }
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            out.rows_total -= 1;
            continue;
        }

        let (Some(last_name), Some(first_name)) =
            (field(&record, cols.last_name), field(&record, cols.first_name))
        else {
            out.warnings.push(RosterWarning {
                row,
                reason: "missing first or last name".to_string(),
            });
            continue;
        };
        let grade_text = field(&record, cols.grade).unwrap_or_default();
        let Some((grade_year, grade_suffix)) = Grade::parse_full(&grade_text) else {
            out.warnings.push(RosterWarning {
                row,
                reason: format!("invalid grade '{}'", grade_text),
            });
            continue;
        };

        let birthday = match field(&record, cols.birthday) {
            Some(raw) => match NaiveDate::parse_from_str(&raw, &options.date_format) {
                Ok(d) => Some(d),
                Err(_) => {
                    out.warnings.push(RosterWarning {
                        row,
                        reason: format!("invalid birthday '{}'", raw),
                    });
                    None
                }
            },
            None => None,
        };

        out.students.push(RosterStudent {
            row,
            last_name,
            first_name,
            grade_year,
            grade_suffix,
            birthday,
            gender: field(&record, cols.gender).map(|g| g.to_lowercase()),
            profile: field(&record, cols.profile),
            external_id: field(&record, cols.external_id),
        });
    }
    Ok(out)
}

/// Decodes roster bytes. Valid UTF-8 (with or without BOM) is taken as is;
/// anything else is read as Windows-1252, the default of German spreadsheet
/// exports.
pub fn decode_roster(bytes: &[u8]) -> (Cow<'_, str>, &'static encoding_rs::Encoding) {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), encoding_rs::UTF_8),
        Err(_) => {
            let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
            (text, encoding_rs::WINDOWS_1252)
        }
    }
}

/// Decodes and parses a roster file's raw bytes.
pub fn parse_roster_bytes(bytes: &[u8], options: &RosterOptions) -> anyhow::Result<ParsedRoster> {
    let (text, encoding) = decode_roster(bytes);
    if encoding != encoding_rs::UTF_8 {
        tracing::info!(encoding = encoding.name(), "roster is not UTF-8");
    }
    let mut parsed = parse_roster_csv(&text, options)?;
    parsed.encoding = encoding.name().to_string();
    Ok(parsed)
}

pub fn file_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub import_id: String,
    pub sha256: String,
    pub rows_total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub grades_created: usize,
    pub encoding: String,
    pub warnings: Vec<RosterWarning>,
}

fn find_existing_student(conn: &Connection, s: &RosterStudent) -> Result<Option<String>, LoanError> {
    if let Some(ext) = s.external_id.as_deref() {
        return conn
            .query_row(
                "SELECT id FROM students WHERE external_id = ?",
                [ext],
                |r| r.get(0),
            )
            .optional()
            .map_err(LoanError::query);
    }
    conn.query_row(
        "SELECT id FROM students
         WHERE last_name = ? AND first_name = ? AND COALESCE(birth_date, '') = ?",
        (
            &s.last_name,
            &s.first_name,
            s.birthday.map(format_date).unwrap_or_default(),
        ),
        |r| r.get(0),
    )
    .optional()
    .map_err(LoanError::query)
}

/// Writes a parsed roster into the workspace in one transaction.
pub fn import_roster(
    conn: &mut Connection,
    source_path: &Path,
    sha256: &str,
    parsed: ParsedRoster,
) -> Result<ImportSummary, LoanError> {
    let tx = conn.transaction().map_err(LoanError::query)?;
    let mut summary = ImportSummary {
        import_id: Uuid::new_v4().to_string(),
        sha256: sha256.to_string(),
        rows_total: parsed.rows_total,
        skipped: parsed.rows_total - parsed.students.len(),
        encoding: parsed.encoding,
        warnings: parsed.warnings,
        ..ImportSummary::default()
    };

    for s in &parsed.students {
        tracing::debug!(row = s.row, last_name = %s.last_name, "roster row");
        let (grade, grade_created) = ensure_grade(&tx, s.grade_year, &s.grade_suffix)?;
        if grade_created {
            summary.grades_created += 1;
        }
        match find_existing_student(&tx, s)? {
            Some(id) => {
                tx.execute(
                    "UPDATE students
                     SET grade_id = ?, last_name = ?, first_name = ?, birth_date = ?,
                         gender = ?, profile = ?, external_id = COALESCE(?, external_id),
                         updated_at = datetime('now')
                     WHERE id = ?",
                    (
                        &grade.id,
                        &s.last_name,
                        &s.first_name,
                        s.birthday.map(format_date),
                        s.gender.as_deref(),
                        s.profile.as_deref(),
                        s.external_id.as_deref(),
                        &id,
                    ),
                )
                .map_err(|e| LoanError::update(e, "students"))?;
                summary.updated += 1;
            }
            None => {
                insert_student(
                    &tx,
                    &NewStudent {
                        grade_id: grade.id.clone(),
                        last_name: s.last_name.clone(),
                        first_name: s.first_name.clone(),
                        birthday: s.birthday,
                        gender: s.gender.clone(),
                        profile: s.profile.clone(),
                        external_id: s.external_id.clone(),
                    },
                )?;
                summary.created += 1;
            }
        }
    }

    tx.execute(
        "INSERT INTO roster_imports(id, source_path, sha256, rows_total, created, updated, skipped, imported_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        (
            &summary.import_id,
            source_path.to_string_lossy().to_string(),
            &summary.sha256,
            summary.rows_total as i64,
            summary.created as i64,
            summary.updated as i64,
            summary.skipped as i64,
        ),
    )
    .map_err(|e| LoanError::update(e, "roster_imports"))?;
    tx.commit()
        .map_err(|e| LoanError::update(e, "roster_imports"))?;

    tracing::info!(
        path = %source_path.display(),
        created = summary.created,
        updated = summary.updated,
        skipped = summary.skipped,
        "roster imported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Nachname;Vorname;Geburtsdatum;Geschlecht;Klasse;Sprachen\n\
Abel;Jonas;14.03.1990;m;5b;E F\n\
Zivko;Adelina;02.01.1989;M;5a;E\n\
;Ohne;01.01.1990;w;5a;E\n\
Kurz;Karl;31.02.1990;m;6c;\n\
Falsch;Klasse;01.01.1990;w;abc;E\n";

    #[test]
    fn parses_semicolon_roster() {
        let parsed = parse_roster_csv(SAMPLE, &RosterOptions::default()).expect("parse");
        assert_eq!(parsed.rows_total, 5);
        assert_eq!(parsed.students.len(), 3);

        let second = &parsed.students[1];
        assert_eq!(second.last_name, "Zivko");
        assert_eq!(second.first_name, "Adelina");
        assert_eq!(format!("{}{}", second.grade_year, second.grade_suffix), "5a");
        assert_eq!(second.birthday, NaiveDate::from_ymd_opt(1989, 1, 2));
        assert_eq!(second.gender.as_deref(), Some("m"));
        assert_eq!(second.profile.as_deref(), Some("E"));
    }

    #[test]
    fn bad_rows_become_warnings() {
        let parsed = parse_roster_csv(SAMPLE, &RosterOptions::default()).expect("parse");
        let rows: Vec<usize> = parsed.warnings.iter().map(|w| w.row).collect();
        assert_eq!(rows, vec![4, 5, 6]);
        // Invalid birthday keeps the student.
        let kurz = parsed
            .students
            .iter()
            .find(|s| s.last_name == "Kurz")
            .expect("Kurz kept");
        assert_eq!(kurz.birthday, None);
        assert_eq!(kurz.profile, None);
    }

    #[test]
    fn english_headers_and_comma_delimiter() {
        let text = "student_id,first_name,last_name,grade\nX-1,Ada,Lovelace,10 c\n";
        let opts = RosterOptions {
            delimiter: b',',
            ..RosterOptions::default()
        };
        let parsed = parse_roster_csv(text, &opts).expect("parse");
        assert_eq!(parsed.students.len(), 1);
        let s = &parsed.students[0];
        assert_eq!(s.external_id.as_deref(), Some("X-1"));
        assert_eq!(s.grade_year, 10);
        assert_eq!(s.grade_suffix, "c");
    }

    #[test]
    fn missing_required_header_is_an_error() {
        let err = parse_roster_csv("Nachname;Vorname\nA;B\n", &RosterOptions::default())
            .expect_err("grade column required");
        assert!(err.to_string().contains("grade"));
    }

    #[test]
    fn windows_1252_roster_keeps_umlauts() {
        let bytes = b"Nachname;Vorname;Klasse\nM\xFCller;J\xF6rg;5a\nStra\xDFer;Bj\xF6rn;6b\n";
        let parsed = parse_roster_bytes(bytes, &RosterOptions::default()).expect("parse");
        assert_eq!(parsed.encoding, "windows-1252");
        assert!(parsed.warnings.is_empty());
        let names: Vec<(&str, &str)> = parsed
            .students
            .iter()
            .map(|s| (s.last_name.as_str(), s.first_name.as_str()))
            .collect();
        assert_eq!(names, vec![("Müller", "Jörg"), ("Straßer", "Björn")]);
    }

    #[test]
    fn utf8_roster_with_bom_is_read_as_utf8() {
        let text = "\u{feff}Nachname;Vorname;Klasse\nMüller;Jörg;5a\n";
        let parsed = parse_roster_bytes(text.as_bytes(), &RosterOptions::default()).expect("parse");
        assert_eq!(parsed.encoding, "UTF-8");
        assert_eq!(parsed.students[0].last_name, "Müller");
    }

    #[test]
    fn ambiguous_name_header_is_not_a_last_name() {
        let err = parse_roster_csv("Name;Vorname;Class\nA;B;5a\n", &RosterOptions::default())
            .expect_err("no last name or grade column");
        let msg = err.to_string();
        assert!(msg.contains("last name"), "{}", msg);
        assert!(msg.contains("grade"), "{}", msg);
    }

    #[test]
    fn sha256_is_hex() {
        let h = file_sha256(b"abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
