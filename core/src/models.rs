use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type HostId = i64;
pub type RecordId = i64;

/// A monitored machine, identified by its unique name.
///
/// `host_id` stays `None` until the store has assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host_id: Option<HostId>,
    pub name: String,
    #[serde(with = "time::serde::timestamp")]
    pub last_contact: OffsetDateTime,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            host_id: None,
            name: name.into(),
            last_contact: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

/// One normalized log entry.
///
/// Extractors produce records with neither `host_id` nor `record_id`; the
/// caller attaches the owning host and the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: Option<RecordId>,
    pub host_id: Option<HostId>,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
    pub source: String,
    pub message: String,
}

impl Record {
    pub fn new(
        timestamp: OffsetDateTime,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Record {
            record_id: None,
            host_id: None,
            timestamp: truncate_to_seconds(timestamp),
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn with_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }
}

/// Drops sub-second precision; the store keeps whole unix seconds.
pub fn truncate_to_seconds(t: OffsetDateTime) -> OffsetDateTime {
    t - time::Duration::nanoseconds(i64::from(t.nanosecond()))
}
