use std::path::PathBuf;

use thiserror::Error;
use time::OffsetDateTime;

use crate::Record;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log reader unavailable: {0}")]
    Unavailable(String),

    #[error("extractor is not initialized")]
    NotInitialized,

    #[error("error reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal reader failed: {0}")]
    Journal(String),
}

/// A pluggable reader that turns one raw log source into records.
///
/// Call `init` once before `read`. Records come back without `host_id` or
/// `record_id`; resolving the owning host is the caller's job.
pub trait Extractor {
    /// Short label used in log output.
    fn name(&self) -> &str;

    /// Identifies what this extractor reads, stable across restarts. Two
    /// extractors feeding the same host must return different keys.
    fn cursor_key(&self) -> String {
        self.name().to_string()
    }

    /// Acquire the underlying source. Calling it again is a no-op.
    fn init(&mut self) -> Result<(), ExtractError>;

    /// Every record currently available with `timestamp >= since`.
    fn read(&mut self, since: OffsetDateTime) -> Result<Vec<Record>, ExtractError>;

    /// Release whatever `init` acquired. Safe to call repeatedly.
    fn close(&mut self);
}
