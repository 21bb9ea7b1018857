mod error;
mod insert;
mod open;
mod query;
mod schema;

pub use error::{Result, StoreError};
pub use open::{Db, OpenGuard};
pub use silo_core::{Host, HostId, Record, RecordId};
