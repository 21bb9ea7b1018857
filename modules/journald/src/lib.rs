//! Extractor for the systemd journal, read through `journalctl --output=json`.

use std::ffi::OsString;
use std::io::BufRead;
use std::process::{Command, Stdio};

use serde::Deserialize;
use silo_core::{ExtractError, Extractor, Record};
use time::OffsetDateTime;
use tracing::{debug, warn};

const DEFAULT_PROGRAM: &str = "journalctl";
const UNKNOWN_SOURCE: &str = "unknown";

/// A journal field as `journalctl` renders it in JSON: a string, a byte
/// array for non-UTF-8 payloads, or a list when the field repeats.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FieldValue {
    Text(String),
    Bytes(Vec<u8>),
    Many(Vec<serde_json::Value>),
}

impl FieldValue {
    fn into_string(self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            FieldValue::Many(values) => values.into_iter().find_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JournalEntry {
    #[serde(rename = "__REALTIME_TIMESTAMP")]
    realtime_usec: Option<String>,
    #[serde(rename = "MESSAGE")]
    message: Option<FieldValue>,
    #[serde(rename = "_COMM")]
    comm: Option<FieldValue>,
    #[serde(rename = "SYSLOG_IDENTIFIER")]
    identifier: Option<FieldValue>,
}

impl JournalEntry {
    fn into_record(self) -> Option<Record> {
        let usec: u64 = self.realtime_usec?.parse().ok()?;
        let ts = OffsetDateTime::from_unix_timestamp((usec / 1_000_000) as i64).ok()?;
        let source = self
            .comm
            .and_then(FieldValue::into_string)
            .or_else(|| self.identifier.and_then(FieldValue::into_string))
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
        let message = self.message.and_then(FieldValue::into_string).unwrap_or_default();
        Some(Record::new(ts, source, message))
    }
}

/// Maps journal JSON lines to records, keeping those at or after `since`.
///
/// Lines that are not valid JSON, or entries without a usable realtime
/// timestamp, are skipped.
pub fn parse_entries<R: BufRead>(
    reader: R,
    since: OffsetDateTime,
) -> Result<Vec<Record>, ExtractError> {
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line.map_err(|e| ExtractError::Journal(format!("reading output: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let rec = serde_json::from_str::<JournalEntry>(&line)
            .ok()
            .and_then(JournalEntry::into_record);
        match rec {
            Some(r) if r.timestamp >= since => records.push(r),
            Some(_) => {}
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "skipped unusable journal entries");
    }
    Ok(records)
}

/// Reads the journal by running `journalctl` (or a compatible program).
///
/// Extra arguments such as `--unit sshd` or `--directory /var/log/journal`
/// are passed before the ones the extractor adds itself.
pub struct JournalExtractor {
    program: OsString,
    args: Vec<OsString>,
    attached: bool,
}

impl Default for JournalExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalExtractor {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<OsString>) -> Self {
        JournalExtractor { program: program.into(), args: Vec::new(), attached: false }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        cmd
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl Extractor for JournalExtractor {
    fn name(&self) -> &str {
        "journal"
    }

    fn cursor_key(&self) -> String {
        let mut key = format!("journal:{}", self.program_name());
        for arg in &self.args {
            key.push(' ');
            key.push_str(&arg.to_string_lossy());
        }
        key
    }

    fn init(&mut self) -> Result<(), ExtractError> {
        if self.attached {
            return Ok(());
        }
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                warn!(program = %self.program_name(), error = %e, "cannot launch journal reader");
                ExtractError::Unavailable(format!("failed to spawn {}: {e}", self.program_name()))
            })?;
        if !status.success() {
            let reason = format!("{} exited with {status}", self.program_name());
            return Err(ExtractError::Unavailable(reason));
        }
        self.attached = true;
        debug!(program = %self.program_name(), "attached to journal");
        Ok(())
    }

    fn read(&mut self, since: OffsetDateTime) -> Result<Vec<Record>, ExtractError> {
        if !self.attached {
            return Err(ExtractError::NotInitialized);
        }
        let output = self
            .command()
            .arg("--output=json")
            .arg("--no-pager")
            .arg(format!("--since=@{}", since.unix_timestamp()))
            .output()
            .map_err(|e| {
                ExtractError::Unavailable(format!("failed to spawn {}: {e}", self.program_name()))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Journal(format!("{} ({})", stderr.trim(), output.status)));
        }
        let records = parse_entries(&output.stdout[..], since)?;
        debug!(count = records.len(), "read journal entries");
        Ok(records)
    }

    fn close(&mut self) {
        self.attached = false;
    }
}
