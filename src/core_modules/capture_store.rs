// THEORY:
// The `CaptureStore` is the only authoritative record of what was captured.
// Sessions append to it, the bundler and the library read from it, and only an
// explicit layer delete removes from it. Every operation opens its own SQLite
// connection, so the store can be cloned into any thread or blocking task
// without sharing a handle.
//
// The store also owns the archival-root safety rule: when asked to remove files
// it only touches paths that resolve inside the managed archive and outside the
// dataset, whatever the stored path string claims.

use crate::core_modules::dataset::{LayerId, Split};
use crate::core_modules::labels::{self, LabelBox};
use crate::error::{CaptureError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Row, params};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    layer INTEGER NOT NULL,
    split TEXT NOT NULL,
    ts TEXT NOT NULL,
    src_path TEXT NOT NULL,
    labels_json TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_captures_layer_ts ON captures(layer, ts DESC);
"#;

const COLUMNS: &str = "id, path, layer, split, ts, src_path, labels_json";

/// A capture about to be stored.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub path: PathBuf,
    pub layer: LayerId,
    pub split: Split,
    pub ts: DateTime<Utc>,
    pub src_path: PathBuf,
    pub boxes: Vec<LabelBox>,
}

/// A stored capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureRecord {
    pub id: i64,
    /// The managed copy inside the archive root.
    pub path: PathBuf,
    pub layer: LayerId,
    pub split: Split,
    pub ts: DateTime<Utc>,
    /// The dataset original the copy was taken from.
    pub src_path: PathBuf,
    pub boxes: Vec<LabelBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    /// Chronological, used for bundling.
    OldestFirst,
    /// Reverse chronological, used for browsing.
    NewestFirst,
}

impl RecordOrder {
    fn sql(&self) -> &'static str {
        match self {
            RecordOrder::OldestFirst => "ORDER BY ts ASC, id ASC",
            RecordOrder::NewestFirst => "ORDER BY ts DESC, id DESC",
        }
    }
}

/// Counts returned by [`CaptureStore::delete_layer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted_db: usize,
    pub deleted_files: usize,
}

/// Number of records per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub layer: LayerId,
    pub records: usize,
}

/// SQLite-backed capture records with connection-per-call access.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    db_path: PathBuf,
    archive_root: PathBuf,
    dataset_root: PathBuf,
}

impl CaptureStore {
    /// Opens (and if needed creates) the database and its schema.
    pub fn open(db_path: &Path, archive_root: &Path, dataset_root: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CaptureError::io(parent, e))?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
            archive_root: archive_root.to_path_buf(),
            dataset_root: dataset_root.to_path_buf(),
        };
        store.conn()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        Ok(conn)
    }

    /// Inserts one record and returns it with its id.
    pub fn append(&self, capture: &NewCapture) -> Result<CaptureRecord> {
        let labels_json = labels::boxes_to_json(&capture.boxes)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO captures (path, layer, split, ts, src_path, labels_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                path_to_string(&capture.path),
                capture.layer.get(),
                capture.split.as_str(),
                format_ts(&capture.ts),
                path_to_string(&capture.src_path),
                labels_json,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(id, layer = %capture.layer, path = ?capture.path, "stored capture");

        Ok(CaptureRecord {
            id,
            path: capture.path.clone(),
            layer: capture.layer,
            split: capture.split,
            ts: capture.ts,
            src_path: capture.src_path.clone(),
            boxes: capture.boxes.clone(),
        })
    }

    /// Records of one layer, or every managed-copy record when `layer` is `None`.
    pub fn query_by_layer(
        &self,
        layer: Option<LayerId>,
        order: RecordOrder,
        limit: Option<usize>,
    ) -> Result<Vec<CaptureRecord>> {
        let conn = self.conn()?;
        let records = match layer {
            Some(layer) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM captures WHERE layer = ?1 {} LIMIT ?2",
                    order.sql()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![layer.get(), sql_limit(limit)], read_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM captures {}", order.sql());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], read_row)?;
                let mut all = Vec::new();
                for row in rows {
                    let record = row?;
                    if self.is_managed_path(Path::new(&record.path)) {
                        all.push(record);
                        if limit.is_some_and(|l| all.len() >= l) {
                            break;
                        }
                    }
                }
                all
            }
        };

        records.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn count(&self, layer: Option<LayerId>) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = match layer {
            Some(layer) => conn.query_row(
                "SELECT COUNT(*) FROM captures WHERE layer = ?1",
                [layer.get()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?,
        };
        Ok(n as usize)
    }

    /// Layers that have at least one record, ascending.
    pub fn layers(&self) -> Result<Vec<LayerSummary>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT layer, COUNT(*) FROM captures GROUP BY layer ORDER BY layer ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(LayerSummary {
                layer: LayerId(row.get(0)?),
                records: row.get::<_, i64>(1)? as usize,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Removes every record of `layer`. With `delete_files`, also removes the
    /// copies those records point at, provided they live in the archive.
    pub fn delete_layer(&self, layer: LayerId, delete_files: bool) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();
        if !layer.is_valid() {
            tracing::warn!(layer = %layer, "refusing to delete an invalid layer id");
            return Ok(report);
        }

        let paths: Vec<PathBuf> = if delete_files {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT path FROM captures WHERE layer = ?1")?;
            let rows = stmt.query_map([layer.get()], |row| row.get::<_, String>(0))?;
            rows.map(|r| r.map(PathBuf::from))
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        report.deleted_db = self
            .conn()?
            .execute("DELETE FROM captures WHERE layer = ?1", [layer.get()])?;

        for path in paths {
            if !self.is_managed_path(&path) {
                tracing::warn!(path = ?path, "skipping file outside the archive root");
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => report.deleted_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = ?path, error = %e, "could not remove capture copy"),
            }
        }

        tracing::info!(
            layer = %layer,
            deleted_db = report.deleted_db,
            deleted_files = report.deleted_files,
            "deleted layer records"
        );
        Ok(report)
    }

    /// True when `path` resolves inside the archive root and outside the
    /// dataset root. Paths with `..` components are never managed.
    pub fn is_managed_path(&self, path: &Path) -> bool {
        is_within(path, &self.archive_root) && !is_within(path, &self.dataset_root)
    }
}

/// Lexical check first, then a canonical one when both sides exist on disk.
pub fn is_within(path: &Path, root: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(p), Ok(r)) => p.starts_with(r),
        _ => path.starts_with(root),
    }
}

struct RawRecord {
    id: i64,
    path: String,
    layer: u32,
    split: String,
    ts: String,
    src_path: String,
    labels_json: String,
}

impl RawRecord {
    fn into_record(self) -> Result<CaptureRecord> {
        let split = self
            .split
            .parse::<Split>()
            .map_err(|message: String| CaptureError::Configuration(format!("record {}: {message}", self.id)))?;
        let ts = match DateTime::parse_from_rfc3339(&self.ts) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(id = self.id, ts = %self.ts, error = %e, "unreadable timestamp, reporting record at the epoch");
                DateTime::<Utc>::default()
            }
        };
        let boxes = labels::boxes_from_json(&self.labels_json).unwrap_or_else(|e| {
            tracing::warn!(id = self.id, error = %e, "unreadable labels_json, treating as no boxes");
            Vec::new()
        });
        Ok(CaptureRecord {
            id: self.id,
            path: PathBuf::from(self.path),
            layer: LayerId(self.layer),
            split,
            ts,
            src_path: PathBuf::from(self.src_path),
            boxes,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        layer: row.get(2)?,
        split: row.get(3)?,
        ts: row.get(4)?,
        src_path: row.get(5)?,
        labels_json: row.get(6)?,
    })
}

/// Fixed-width UTC timestamps sort lexically in time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}
