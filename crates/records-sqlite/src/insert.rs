use rusqlite::params;
use silo_core::{truncate_to_seconds, Host, HostId, Record, RecordId};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{is_foreign_key_violation, is_unique_violation, Result, StoreError};
use crate::Db;

const INSERT_RECORD: &str =
    "INSERT INTO record (host_id, timestamp, source, message) VALUES (?, ?, ?, ?)";
const ADVANCE_CURSOR: &str = r#"
INSERT INTO cursor (host_id, source_key, timestamp) VALUES (?, ?, ?)
  ON CONFLICT (host_id, source_key)
  DO UPDATE SET timestamp = MAX(timestamp, excluded.timestamp)
"#;

impl Db {
    /// Inserts `host` and writes the assigned id back into it.
    ///
    /// Fails with [`StoreError::DuplicateHost`] if the name is taken; look the
    /// host up first (or use [`Db::host_get_or_add`]) rather than relying on that.
    pub fn host_add(&self, host: &mut Host) -> Result<HostId> {
        if host.name.is_empty() {
            return Err(StoreError::EmptyHostName);
        }
        self.conn
            .execute(
                "INSERT INTO host (name, last_contact) VALUES (?, ?)",
                params![host.name, host.last_contact.unix_timestamp()],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateHost(host.name.clone())
                } else {
                    e.into()
                }
            })?;
        let id = self.conn.last_insert_rowid();
        host.host_id = Some(id);
        debug!(host = %host.name, host_id = id, "added host");
        Ok(id)
    }

    pub fn host_get_or_add(&self, name: &str) -> Result<Host> {
        if let Some(host) = self.host_get_by_name(name)? {
            return Ok(host);
        }
        let mut host = Host::new(name);
        match self.host_add(&mut host) {
            Ok(_) => Ok(host),
            // another handle won the race between lookup and insert
            Err(StoreError::DuplicateHost(_)) => self
                .host_get_by_name(name)?
                .ok_or_else(|| StoreError::DuplicateHost(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Stamps `host` as contacted now, in the store and in memory.
    pub fn host_update_contact(&self, host: &mut Host) -> Result<()> {
        let id = host.host_id.ok_or(StoreError::Unassigned)?;
        let now = truncate_to_seconds(OffsetDateTime::now_utc());
        let n = self.conn.execute(
            "UPDATE host SET last_contact = ? WHERE id = ?",
            params![now.unix_timestamp(), id],
        )?;
        if n == 0 {
            return Err(StoreError::HostNotFound(id));
        }
        host.last_contact = now;
        Ok(())
    }

    /// Deletes a host together with all of its records.
    pub fn host_delete(&self, id: HostId) -> Result<bool> {
        let n = self.conn.execute("DELETE FROM host WHERE id = ?", [id])?;
        if n > 0 {
            debug!(host_id = id, "deleted host");
        }
        Ok(n > 0)
    }

    /// Inserts one record and writes the assigned id back into it.
    pub fn record_add(&self, record: &mut Record) -> Result<RecordId> {
        let host_id = record.host_id.ok_or(StoreError::Unassigned)?;
        let mut stmt = self.conn.prepare_cached(INSERT_RECORD)?;
        stmt.execute(params![
            host_id,
            record.timestamp.unix_timestamp(),
            record.source,
            record.message
        ])
        .map_err(|e| classify_record_error(e, host_id))?;
        let id = self.conn.last_insert_rowid();
        record.record_id = Some(id);
        Ok(id)
    }

    /// Inserts `records` for `host_id` in one transaction; either all of
    /// them land or none do. Ids are written back only after commit.
    pub fn record_add_batch(&self, host_id: HostId, records: &mut [Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let ids = insert_records(&tx, host_id, records)?;
        tx.commit()?;
        assign_ids(host_id, records, ids);
        Ok(records.len())
    }

    /// Like [`Db::record_add_batch`], and in the same transaction moves the
    /// cursor of `source_key` on this host up to the newest inserted
    /// timestamp. The cursor never moves backwards.
    pub fn record_add_batch_with_cursor(
        &self,
        host_id: HostId,
        source_key: &str,
        records: &mut [Record],
    ) -> Result<usize> {
        let Some(newest) = records.iter().map(|r| r.timestamp).max() else {
            return Ok(0);
        };
        let tx = self.conn.unchecked_transaction()?;
        let ids = insert_records(&tx, host_id, records)?;
        tx.prepare_cached(ADVANCE_CURSOR)?
            .execute(params![host_id, source_key, newest.unix_timestamp()])?;
        tx.commit()?;
        assign_ids(host_id, records, ids);
        debug!(host_id, source_key, cursor = newest.unix_timestamp(), "cursor advanced");
        Ok(records.len())
    }
}

fn insert_records(
    tx: &rusqlite::Transaction<'_>,
    host_id: HostId,
    records: &[Record],
) -> Result<Vec<RecordId>> {
    let mut ids = Vec::with_capacity(records.len());
    let mut stmt = tx.prepare_cached(INSERT_RECORD)?;
    for r in records {
        stmt.execute(params![host_id, r.timestamp.unix_timestamp(), r.source, r.message])
            .map_err(|e| classify_record_error(e, host_id))?;
        ids.push(tx.last_insert_rowid());
    }
    Ok(ids)
}

fn assign_ids(host_id: HostId, records: &mut [Record], ids: Vec<RecordId>) {
    for (r, id) in records.iter_mut().zip(ids) {
        r.host_id = Some(host_id);
        r.record_id = Some(id);
    }
    debug!(host_id, count = records.len(), "inserted records");
}

fn classify_record_error(e: rusqlite::Error, host_id: HostId) -> StoreError {
    if is_foreign_key_violation(&e) {
        warn!(host_id, "record references unknown host");
        StoreError::UnknownHost(host_id)
    } else {
        e.into()
    }
}
