use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::selection::ReturnSession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub returns: ReturnSession,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            returns: ReturnSession::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
