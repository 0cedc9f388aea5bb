use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "humbuch.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/humbuch.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "humbuch-workspace-v1";
pub const PLAIN_SQLITE_FORMAT: &str = "sqlite3";

/// Tables a database needs before it may replace a workspace.
const REQUIRED_TABLES: [&str; 4] = ["grades", "students", "teaching_materials", "borrowed_materials"];

/// Row counts recorded in the manifest and reported after a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceCounts {
    pub grades: u64,
    pub students: u64,
    pub teaching_materials: u64,
    pub borrowed_materials: u64,
    pub open_loans: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub counts: WorkspaceCounts,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub counts: WorkspaceCounts,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn count(conn: &Connection, sql: &str) -> anyhow::Result<u64> {
    let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
    Ok(n.max(0) as u64)
}

/// Opens `path` read-only, checks it holds a loan workspace and counts its rows.
pub fn inspect_database(path: &Path) -> anyhow::Result<WorkspaceCounts> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("cannot open {} as SQLite", path.display()))?;
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
        .context("not a SQLite database")?;
    let tables: BTreeSet<String> = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect())
        .context("not a SQLite database")?;
    let missing: Vec<&str> = REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|t| !tables.contains(*t))
        .collect();
    if !missing.is_empty() {
        bail!(
            "not a textbook workspace, missing tables: {}",
            missing.join(", ")
        );
    }

    Ok(WorkspaceCounts {
        grades: count(&conn, "SELECT COUNT(*) FROM grades")?,
        students: count(&conn, "SELECT COUNT(*) FROM students")?,
        teaching_materials: count(&conn, "SELECT COUNT(*) FROM teaching_materials")?,
        borrowed_materials: count(&conn, "SELECT COUNT(*) FROM borrowed_materials")?,
        open_loans: count(
            &conn,
            "SELECT COUNT(*) FROM borrowed_materials WHERE return_date IS NULL",
        )?,
    })
}

fn remove_if_present(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

/// Point-in-time copy of the live database via `VACUUM INTO`.
fn snapshot_database(db_path: &Path, snapshot: &Path) -> anyhow::Result<Vec<u8>> {
    remove_if_present(snapshot);
    {
        let conn = Connection::open(db_path)
            .with_context(|| format!("cannot open {}", db_path.display()))?;
        conn.execute("VACUUM INTO ?1", [snapshot.to_string_lossy().to_string()])
            .context("snapshot of workspace database failed")?;
    }
    let bytes = std::fs::read(snapshot)
        .with_context(|| format!("cannot read snapshot {}", snapshot.display()));
    remove_if_present(snapshot);
    bytes
}

pub fn export_workspace_bundle(workspace: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let db_path = workspace.join(DB_FILE);
    if !db_path.is_file() {
        bail!("no workspace database at {}", db_path.display());
    }
    let counts = inspect_database(&db_path)?;
    let snapshot = workspace.join(format!("{}.snapshot", DB_FILE));
    let db_bytes = snapshot_database(&db_path, &snapshot)?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(dir) = out_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let mut bundle = ZipWriter::new(
        File::create(out_path).with_context(|| format!("cannot create {}", out_path.display()))?,
    );
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Local::now().to_rfc3339(),
        "dbSha256": db_sha256,
        "counts": counts,
    });
    bundle.start_file(MANIFEST_ENTRY, deflated)?;
    bundle.write_all(serde_json::to_vec_pretty(&manifest)?.as_slice())?;
    bundle.start_file(DB_ENTRY, deflated)?;
    bundle.write_all(&db_bytes)?;
    bundle.finish().context("cannot finish bundle")?;

    tracing::info!(
        out = %out_path.display(),
        students = counts.students,
        open_loans = counts.open_loans,
        "workspace bundle exported"
    );
    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        db_sha256,
        counts,
    })
}

/// Pulls the database out of a bundle into `staging` after checking the
/// manifest format and checksum.
fn extract_bundle_database(in_path: &Path, staging: &Path) -> anyhow::Result<()> {
    let file = File::open(in_path).with_context(|| format!("cannot open {}", in_path.display()))?;
    let mut archive = ZipArchive::new(file).context("invalid zip archive")?;

    let manifest: serde_json::Value = {
        let entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle has no manifest.json")?;
        serde_json::from_reader(entry).context("manifest.json is invalid JSON")?
    };
    let format = manifest.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", format);
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle has no database")?
        .read_to_end(&mut db_bytes)
        .context("cannot extract database")?;
    if let Some(expected) = manifest.get("dbSha256").and_then(|v| v.as_str()) {
        let actual = sha256_hex(&db_bytes);
        if actual != expected {
            return Err(anyhow!(
                "database checksum mismatch: expected {}, got {}",
                expected,
                actual
            ));
        }
    }
    std::fs::write(staging, &db_bytes)
        .with_context(|| format!("cannot write {}", staging.display()))
}

/// Replaces the workspace database with the one in `in_path`, which may be a
/// bundle or a plain SQLite copy. The current database stays in place unless
/// the incoming one passes every check.
pub fn import_workspace_bundle(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("cannot create {}", workspace.display()))?;
    let staging: PathBuf = workspace.join(format!("{}.importing", DB_FILE));
    remove_if_present(&staging);

    let detected = if is_zip_file(in_path)? {
        extract_bundle_database(in_path, &staging)?;
        BUNDLE_FORMAT_V1
    } else {
        std::fs::copy(in_path, &staging)
            .with_context(|| format!("cannot copy {}", in_path.display()))?;
        PLAIN_SQLITE_FORMAT
    };

    let counts = match inspect_database(&staging) {
        Ok(c) => c,
        Err(e) => {
            remove_if_present(&staging);
            return Err(e);
        }
    };

    let dst = workspace.join(DB_FILE);
    remove_if_present(&dst);
    std::fs::rename(&staging, &dst)
        .with_context(|| format!("cannot move restored database to {}", dst.display()))?;
    tracing::info!(
        from = %in_path.display(),
        format = detected,
        students = counts.students,
        open_loans = counts.open_loans,
        "workspace restored"
    );

    Ok(ImportSummary {
        bundle_format_detected: detected.to_string(),
        counts,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("cannot read file signature")?;
    Ok(read == 4 && sig == *b"PK\x03\x04")
}
