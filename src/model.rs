use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;

/// A school class: year plus section letter(s), e.g. `5a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: String,
    pub year: i64,
    pub suffix: String,
}

impl Grade {
    /// Splits a full grade like `10b` into year and suffix.
    /// Returns `None` when the text does not start with a year.
    pub fn parse_full(text: &str) -> Option<(i64, String)> {
        let t = text.trim();
        let digits_end = t
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(t.len());
        if digits_end == 0 {
            return None;
        }
        let year = t[..digits_end].parse::<i64>().ok()?;
        Some((year, t[digits_end..].trim().to_string()))
    }

    pub fn full_name(&self) -> String {
        format!("{}{}", self.year, self.suffix)
    }
}

impl Ord for Grade {
    fn cmp(&self, other: &Self) -> Ordering {
        self.year
            .cmp(&other.year)
            .then_with(|| self.suffix.cmp(&other.suffix))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Grade {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub grade: Grade,
    pub last_name: String,
    pub first_name: String,
    pub birthday: Option<NaiveDate>,
    pub gender: Option<String>,
    pub profile: Option<String>,
    pub external_id: Option<String>,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

impl PartialEq for Student {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Student {}

impl Ord for Student {
    fn cmp(&self, other: &Self) -> Ordering {
        name_cmp(&self.last_name, &other.last_name)
            .then_with(|| name_cmp(&self.first_name, &other.first_name))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Student {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeachingMaterial {
    pub id: String,
    pub name: String,
    pub producer: Option<String>,
    pub from_grade: Option<i64>,
    pub to_grade: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowedMaterial {
    pub id: String,
    pub student_id: String,
    pub teaching_material: MaterialRef,
    pub borrow_from: NaiveDate,
    pub borrow_until: Option<NaiveDate>,
    pub return_date: Option<NaiveDate>,
    pub received: bool,
}

impl BorrowedMaterial {
    /// Order within one student's list. Equal titles compare equal, so callers
    /// must use a stable sort to keep insertion order for ties.
    pub fn cmp_title(&self, other: &Self) -> Ordering {
        name_cmp(&self.teaching_material.name, &other.teaching_material.name)
    }

    pub fn is_open(&self) -> bool {
        self.return_date.is_none()
    }
}

fn name_cmp(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
