//! Extractor for plain-text, syslog-style log files.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use silo_core::{ExtractError, Extractor, Record};
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tracing::{debug, warn};

// <Mon> <day> <HH:MM:SS> <host> <source>[<pid>]: <message>
const LINE_PATTERN: &str =
    r"(?i)^([a-z]{3})\s+(\d{1,2})\s+(\d{2}):(\d{2}):(\d{2})\s+([\w.-]+)\s+([\w./-]+)(?:\[(\d+)\])?: ?(.*)$";

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LINE_PATTERN).expect("line grammar is a valid regex"))
}

/// One line that matched the syslog grammar, before the year is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogLine<'a> {
    pub month: Month,
    pub day: u8,
    pub time: Time,
    pub host: &'a str,
    pub source: &'a str,
    pub pid: Option<u32>,
    pub message: &'a str,
}

pub fn parse_line(line: &str) -> Option<SyslogLine<'_>> {
    let caps = line_regex().captures(line)?;
    let month = parse_month(&caps[1])?;
    let day: u8 = caps[2].parse().ok()?;
    let (hour, minute, second) =
        (caps[3].parse().ok()?, caps[4].parse().ok()?, caps[5].parse().ok()?);
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(SyslogLine {
        month,
        day,
        time,
        host: caps.get(6)?.as_str(),
        source: caps.get(7)?.as_str(),
        pid: caps.get(8).and_then(|m| m.as_str().parse().ok()),
        message: caps.get(9)?.as_str(),
    })
}

fn parse_month(s: &str) -> Option<Month> {
    Some(match s.to_ascii_lowercase().as_str() {
        "jan" => Month::January,
        "feb" => Month::February,
        "mar" => Month::March,
        "apr" => Month::April,
        "may" => Month::May,
        "jun" => Month::June,
        "jul" => Month::July,
        "aug" => Month::August,
        "sep" => Month::September,
        "oct" => Month::October,
        "nov" => Month::November,
        "dec" => Month::December,
        _ => return None,
    })
}

impl SyslogLine<'_> {
    /// Full timestamp of the line, with the year taken from `reference`.
    ///
    /// A date that would lie more than a day past `reference` belongs to the
    /// previous year (a December entry read in January). `None` for dates
    /// that do not exist, such as Feb 30.
    pub fn timestamp(
        &self,
        offset: UtcOffset,
        reference: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        let now = reference.to_offset(offset);
        let at = |year: i32| {
            Date::from_calendar_date(year, self.month, self.day)
                .ok()
                .map(|d| PrimitiveDateTime::new(d, self.time).assume_offset(offset))
        };
        match at(now.year()) {
            Some(t) if t <= now + Duration::days(1) => Some(t),
            _ => at(now.year() - 1),
        }
    }

    pub fn to_record(&self, offset: UtcOffset, reference: OffsetDateTime) -> Option<Record> {
        let ts = self.timestamp(offset, reference)?;
        Some(Record::new(ts, self.source, self.message))
    }
}

struct Handle {
    path: PathBuf,
    reader: BufReader<File>,
}

/// Reads records out of one or more syslog-format text files.
///
/// `init` opens every file and fails as a whole if any of them cannot be
/// opened. `read` rescans each file from the start, so the `since` filter
/// alone decides which records are new.
pub struct LogfileExtractor {
    paths: Vec<PathBuf>,
    handles: Option<Vec<Handle>>,
    offset: UtcOffset,
    reference: Option<OffsetDateTime>,
}

impl LogfileExtractor {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        LogfileExtractor {
            paths: paths.into_iter().map(Into::into).collect(),
            handles: None,
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
            reference: None,
        }
    }

    /// Offset the files' timestamps are written in. Defaults to local time.
    pub fn with_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Pin the clock used for year inference instead of reading it on every `read`.
    pub fn with_reference_time(mut self, reference: OffsetDateTime) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Extractor for LogfileExtractor {
    fn name(&self) -> &str {
        "logfile"
    }

    fn cursor_key(&self) -> String {
        let paths: Vec<_> = self.paths.iter().map(|p| p.to_string_lossy()).collect();
        format!("logfile:{}", paths.join(","))
    }

    fn init(&mut self) -> Result<(), ExtractError> {
        if self.handles.is_some() {
            return Ok(());
        }
        let mut handles = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let file = File::open(path).map_err(|source| {
                warn!(path = %path.display(), error = %source, "cannot open log file");
                ExtractError::Open { path: path.clone(), source }
            })?;
            handles.push(Handle { path: path.clone(), reader: BufReader::new(file) });
        }
        debug!(files = handles.len(), "opened log files");
        self.handles = Some(handles);
        Ok(())
    }

    fn read(&mut self, since: OffsetDateTime) -> Result<Vec<Record>, ExtractError> {
        let handles = self.handles.as_mut().ok_or(ExtractError::NotInitialized)?;
        let reference = self.reference.unwrap_or_else(OffsetDateTime::now_utc);
        let mut records = Vec::new();
        let mut buf = Vec::new();

        for h in handles.iter_mut() {
            let io_err =
                |source: std::io::Error| ExtractError::Read { path: h.path.clone(), source };
            h.reader.seek(SeekFrom::Start(0)).map_err(io_err)?;
            let mut skipped = 0usize;
            loop {
                buf.clear();
                if h.reader.read_until(b'\n', &mut buf).map_err(io_err)? == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(line).and_then(|l| l.to_record(self.offset, reference)) {
                    Some(rec) if rec.timestamp >= since => records.push(rec),
                    Some(_) => {}
                    None => skipped += 1,
                }
            }
            if skipped > 0 {
                debug!(path = %h.path.display(), skipped, "skipped unparseable lines");
            }
        }
        Ok(records)
    }

    fn close(&mut self) {
        if self.handles.take().is_some() {
            debug!(files = self.paths.len(), "closed log files");
        }
    }
}
