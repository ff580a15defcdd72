pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Presence reads derive offline when the last heartbeat is older than this
/// (2x the client's 30s heartbeat interval).
pub const PRESENCE_STALE_SECS: i64 = 60;

/// Typing rows older than this read as "not typing", covering clients that
/// disconnect without sending an explicit stop signal.
pub const TYPING_TTL_SECS: i64 = 5;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&mut conn)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 TEXT with microsecond
/// precision, so lexicographic ordering matches chronological ordering and
/// watermark comparisons can run in SQL.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_format_is_sortable() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(parse_ts(&fmt_ts(late)), Some(late));
    }
}
