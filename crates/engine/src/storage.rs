use anyhow::Context;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use basegrid_protocol::{LayoutRecord, LAYOUT_KEY};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Local key-value mirror of the planner layout, stored in SQLite.
#[derive(Debug, Clone)]
pub struct LayoutDb {
    db_path: PathBuf,
}

impl LayoutDb {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn get_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.open()?;
        let value: Option<String> = conn
            .query_row("SELECT value_json FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// The mirrored layout, or `None` if nothing was ever saved.
    pub fn load_layout(&self) -> anyhow::Result<Option<Vec<LayoutRecord>>> {
        let Some(raw) = self.get_value(LAYOUT_KEY)? else {
            return Ok(None);
        };
        let records = serde_json::from_str(&raw)
            .with_context(|| format!("decode stored layout under {LAYOUT_KEY}"))?;
        Ok(Some(records))
    }

    /// Store the layout and return the new revision.
    pub fn save_layout(&self, records: &[LayoutRecord]) -> anyhow::Result<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let value_json = serde_json::to_string(records)?;
        tx.execute(
            "INSERT INTO kv (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            (LAYOUT_KEY, &value_json, now_rfc3339()),
        )?;
        let rev = append_event_tx(
            &tx,
            "layout.saved",
            serde_json::json!({ "instances": records.len() }),
        )?;
        tx.commit()?;
        Ok(rev)
    }

    pub fn clear_layout(&self) -> anyhow::Result<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM kv WHERE key = ?1", [LAYOUT_KEY])?;
        if n > 0 {
            append_event_tx(&tx, "layout.cleared", serde_json::json!({}))?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

-- Monotonic revision source; one row per layout write.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, payload_json) VALUES (?1, ?2, ?3)",
        (ts, kind, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}
