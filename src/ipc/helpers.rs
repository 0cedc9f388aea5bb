use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::loans;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be an integer", key),
                None,
            )
        }),
    }
}

/// ISO `YYYY-MM-DD` date param; absent or null yields `None`.
pub fn optional_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .and_then(loans::parse_date)
            .map(Some)
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must be a YYYY-MM-DD date", key),
                    Some(json!({ key: v })),
                )
            }),
    }
}

/// Array of string ids; `None` when the key is absent.
pub fn optional_id_list(req: &Request, key: &str) -> Result<Option<Vec<String>>, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        return Ok(None);
    };
    let bad = || {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an array of strings", key),
            None,
        )
    };
    let arr = v.as_array().ok_or_else(bad)?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(item.as_str().ok_or_else(bad)?.to_string());
    }
    Ok(Some(out))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_conn_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<&'a mut Connection, serde_json::Value> {
    state
        .db
        .as_mut()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
