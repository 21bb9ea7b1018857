use rusqlite::ffi;
use silo_core::HostId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host {0:?} already exists")]
    DuplicateHost(String),

    #[error("no host with id {0} to own this record")]
    UnknownHost(HostId),

    #[error("host {0} not found")]
    HostNotFound(HostId),

    #[error("value has no assigned id")]
    Unassigned,

    #[error("schema statement failed: {statement}")]
    Schema {
        statement: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("host name must not be empty")]
    EmptyHostName,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Extended SQLite result code carried by a failed statement, if any.
pub(crate) fn constraint_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(e.extended_code)
        }
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        constraint_code(err),
        Some(ffi::SQLITE_CONSTRAINT_UNIQUE) | Some(ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    constraint_code(err) == Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}
