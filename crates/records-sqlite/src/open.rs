use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, error, info};

use crate::error::{Result, StoreError};
use crate::schema::{INIT_STATEMENTS, MARKER_TABLE};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes the "check, connect, create schema" sequence of [`Db::open_guarded`].
///
/// Two threads racing to open the same fresh location would otherwise both
/// try to create the schema. [`OpenGuard::process`] is the instance
/// [`Db::open`] uses; tests or embedders can bring their own.
#[derive(Debug, Default)]
pub struct OpenGuard {
    lock: Mutex<()>,
}

impl OpenGuard {
    pub const fn new() -> Self {
        OpenGuard { lock: Mutex::new(()) }
    }

    pub fn process() -> &'static OpenGuard {
        static PROCESS: OpenGuard = OpenGuard::new();
        &PROCESS
    }

    fn hold(&self) -> MutexGuard<'_, ()> {
        // The mutex guards no data, so a poisoned lock is still usable.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Db {
    pub conn: Connection,
    schema_created: bool,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_guarded(path, OpenGuard::process())
    }

    pub fn open_guarded(path: impl AsRef<Path>, guard: &OpenGuard) -> Result<Self> {
        let path = path.as_ref();
        let _held = guard.hold();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        let schema_created = migrate(&mut conn)?;
        if schema_created {
            info!(path = %path.display(), "initialized new store");
        } else {
            debug!(path = %path.display(), "opened existing store");
        }
        Ok(Db { conn, schema_created })
    }

    /// Whether this particular open created the schema.
    pub fn schema_created(&self) -> bool {
        self.schema_created
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
    debug!(journal_mode = %mode, "journal mode set");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<bool> {
    if crate::query::table_exists(conn, MARKER_TABLE)? {
        return Ok(false);
    }
    let tx = conn.transaction()?;
    for stmt in INIT_STATEMENTS {
        if let Err(source) = tx.execute_batch(stmt) {
            let statement = stmt.trim().to_string();
            error!(%statement, error = %source, "schema creation failed");
            // dropping `tx` rolls back whatever ran before
            return Err(StoreError::Schema { statement, source });
        }
    }
    tx.commit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_open_creates_schema_second_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silo.db");

        let first = Db::open(&path).unwrap();
        assert!(first.schema_created());
        drop(first);

        let second = Db::open(&path).unwrap();
        assert!(!second.schema_created());
        assert!(second.table_exists("host").unwrap());
        assert!(second.table_exists("record").unwrap());
        assert!(second.table_exists("cursor").unwrap());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("silo.db");
        let db = Db::open(&path).unwrap();
        assert!(db.schema_created());
        assert!(path.exists());
    }

    #[test]
    fn pragmas_are_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let fk: i64 = db.conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        let mode: String = db.conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn empty_file_receives_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silo.db");
        std::fs::File::create(&path).unwrap();
        let db = Db::open(&path).unwrap();
        assert!(db.schema_created());
    }

    #[test]
    fn concurrent_first_open_creates_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("race.db"));
        let guard = Arc::new(OpenGuard::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let guard = Arc::clone(&guard);
                thread::spawn(move || {
                    let db = Db::open_guarded(path.as_path(), &guard).unwrap();
                    assert!(db.host_get_all().unwrap().len() <= 8);
                    db.schema_created()
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();
        assert_eq!(created, 1);

        let db = Db::open(path.as_path()).unwrap();
        assert!(db.host_get_all().unwrap().is_empty());
    }

    #[test]
    fn failing_schema_statement_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("broken.db")).unwrap();
        // a pre-existing `record` table makes the third statement fail
        conn.execute_batch("CREATE TABLE record (x INTEGER)").unwrap();

        let err = migrate(&mut conn).unwrap_err();
        match err {
            StoreError::Schema { statement, .. } => {
                assert!(statement.contains("CREATE TABLE record"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!crate::query::table_exists(&conn, "host").unwrap());
    }
}
