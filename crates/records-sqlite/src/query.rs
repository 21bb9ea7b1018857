use rusqlite::{params, Connection, OptionalExtension, Row};
use silo_core::{Host, HostId, Record};
use time::OffsetDateTime;

use crate::error::Result;
use crate::Db;

const HOST_COLUMNS: &str = "SELECT id, name, last_contact FROM host";
const RECORD_COLUMNS: &str = "SELECT id, host_id, timestamp, source, message FROM record";

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.conn, name)
    }

    pub fn host_get_by_name(&self, name: &str) -> Result<Option<Host>> {
        let mut stmt = self.conn.prepare_cached(&format!("{HOST_COLUMNS} WHERE name = ?"))?;
        Ok(stmt.query_row([name], host_from_row).optional()?)
    }

    pub fn host_get_by_id(&self, id: HostId) -> Result<Option<Host>> {
        let mut stmt = self.conn.prepare_cached(&format!("{HOST_COLUMNS} WHERE id = ?"))?;
        Ok(stmt.query_row([id], host_from_row).optional()?)
    }

    pub fn host_get_all(&self) -> Result<Vec<Host>> {
        let mut stmt = self.conn.prepare_cached(&format!("{HOST_COLUMNS} ORDER BY name"))?;
        let rows = stmt.query_map([], host_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn record_get_by_host(&self, host_id: HostId) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{RECORD_COLUMNS} WHERE host_id = ? ORDER BY timestamp, id"))?;
        let rows = stmt.query_map([host_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Records of every host with `begin <= timestamp <= end`.
    pub fn record_get_by_period(
        &self,
        begin: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{RECORD_COLUMNS} WHERE timestamp BETWEEN ? AND ? ORDER BY timestamp, id"
        ))?;
        let rows = stmt.query_map([begin.unix_timestamp(), end.unix_timestamp()], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn record_latest_timestamp(&self, host_id: HostId) -> Result<Option<OffsetDateTime>> {
        let latest: Option<i64> = self.conn.query_row(
            "SELECT MAX(timestamp) FROM record WHERE host_id = ?",
            [host_id],
            |r| r.get(0),
        )?;
        Ok(latest.map(|secs| timestamp_from_sql(secs, 0)).transpose()?)
    }

    /// Newest timestamp already ingested from `source_key` on this host.
    pub fn cursor_get(&self, host_id: HostId, source_key: &str) -> Result<Option<OffsetDateTime>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT timestamp FROM cursor WHERE host_id = ? AND source_key = ?")?;
        let secs: Option<i64> =
            stmt.query_row(params![host_id, source_key], |r| r.get(0)).optional()?;
        Ok(secs.map(|secs| timestamp_from_sql(secs, 0)).transpose()?)
    }

    pub fn record_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(1) FROM record", [], |r| r.get(0))?)
    }
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let cnt: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
        [name],
        |r| r.get(0),
    )?;
    Ok(cnt > 0)
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        host_id: Some(row.get(0)?),
        name: row.get(1)?,
        last_contact: timestamp_from_sql(row.get(2)?, 2)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        record_id: Some(row.get(0)?),
        host_id: Some(row.get(1)?),
        timestamp: timestamp_from_sql(row.get(2)?, 2)?,
        source: row.get(3)?,
        message: row.get(4)?,
    })
}

fn timestamp_from_sql(secs: i64, column: usize) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
        use rusqlite::types::Type;
        rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e))
    })
}
