use anyhow::{bail, Result};
use records_sqlite::{Db, HostId, Record, StoreError};
use silo_core::Extractor;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// One configured log source and the host its records belong to.
pub struct Source {
    pub host: String,
    pub extractor: Box<dyn Extractor>,
}

struct Slot {
    source: Source,
    key: String,
    ready: bool,
    // newest timestamp already stored from this source
    watermark: Option<OffsetDateTime>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sources: usize,
    pub inserted: usize,
    pub failed: usize,
}

/// Pulls new records from every source and writes them to the store.
pub struct Driver {
    db: Db,
    slots: Vec<Slot>,
}

impl Driver {
    pub fn new(db: Db, sources: Vec<Source>) -> Self {
        let slots = sources
            .into_iter()
            .map(|source| {
                let key = source.extractor.cursor_key();
                Slot { source, key, ready: false, watermark: None }
            })
            .collect();
        Driver { db, slots }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Initializes every source. Sources that fail are logged and left out;
    /// it is an error only if none at all come up.
    pub fn init(&mut self) -> Result<usize> {
        if self.slots.is_empty() {
            bail!("no sources configured");
        }
        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !seen.insert((slot.source.host.as_str(), slot.key.as_str())) {
                bail!("source {} is configured twice for host {}", slot.key, slot.source.host);
            }
        }
        let mut ready = 0;
        for slot in &mut self.slots {
            match slot.source.extractor.init() {
                Ok(()) => {
                    slot.ready = true;
                    ready += 1;
                }
                Err(e) => {
                    error!(
                        host = %slot.source.host,
                        source = %slot.key,
                        error = %e,
                        "source unavailable"
                    );
                }
            }
        }
        if ready == 0 {
            bail!("none of the {} configured sources could be initialized", self.slots.len());
        }
        info!(ready, total = self.slots.len(), "sources initialized");
        Ok(ready)
    }

    /// Runs one ingestion pass over all ready sources.
    ///
    /// Each source reads from its own cursor, inclusively; records at the
    /// cursor second that are already stored are dropped before insert.
    /// Read failures of a single source are counted and skipped; store
    /// errors abort the pass.
    pub fn run_once(&mut self) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport::default();
        for slot in self.slots.iter_mut().filter(|s| s.ready) {
            report.sources += 1;
            let mut host = self.db.host_get_or_add(&slot.source.host)?;
            let host_id = host.host_id.ok_or(StoreError::Unassigned)?;

            let cursor = match slot.watermark {
                Some(w) => Some(w),
                None => self.db.cursor_get(host_id, &slot.key)?,
            };
            let since = cursor.unwrap_or(OffsetDateTime::UNIX_EPOCH);

            let records = match slot.source.extractor.read(since) {
                Ok(r) => r,
                Err(e) => {
                    warn!(host = %host.name, source = %slot.key, error = %e, "read failed");
                    report.failed += 1;
                    continue;
                }
            };
            let mut records = match cursor {
                Some(at) => drop_already_stored(&self.db, host_id, at, records)?,
                None => records,
            };

            let n = self.db.record_add_batch_with_cursor(host_id, &slot.key, &mut records)?;
            slot.watermark = records.iter().map(|r| r.timestamp).max().max(cursor);
            self.db.host_update_contact(&mut host)?;
            report.inserted += n;
            debug!(host = %host.name, source = %slot.key, %since, inserted = n, "source done");
        }
        Ok(report)
    }

    /// Repeats [`Driver::run_once`] every `interval`, forever or for `cycles` passes.
    pub fn run(&mut self, interval: Duration, cycles: Option<u64>) -> Result<()> {
        let mut done = 0u64;
        loop {
            let started = Instant::now();
            let report = self.run_once()?;
            done += 1;
            info!(
                cycle = done,
                inserted = report.inserted,
                failed = report.failed,
                duration_ms = started.elapsed().as_millis() as u64,
                "ingestion cycle finished"
            );
            if cycles.is_some_and(|c| done >= c) {
                return Ok(());
            }
            std::thread::sleep(interval.saturating_sub(started.elapsed()));
        }
    }

    pub fn close(&mut self) {
        for slot in &mut self.slots {
            slot.source.extractor.close();
            slot.ready = false;
        }
    }
}

/// Removes records at second `at` that the host already has. Matching is by
/// source and message and counts duplicates, so a line that legitimately
/// repeats within that second is kept as often as it was read beyond what
/// is stored.
fn drop_already_stored(
    db: &Db,
    host_id: HostId,
    at: OffsetDateTime,
    records: Vec<Record>,
) -> Result<Vec<Record>, StoreError> {
    let mut stored: HashMap<(String, String), usize> = HashMap::new();
    for r in db.record_get_by_period(at, at)? {
        if r.host_id == Some(host_id) {
            *stored.entry((r.source, r.message)).or_default() += 1;
        }
    }
    if stored.is_empty() {
        return Ok(records);
    }
    Ok(records
        .into_iter()
        .filter(|r| {
            if r.timestamp != at {
                return true;
            }
            match stored.get_mut(&(r.source.clone(), r.message.clone())) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    false
                }
                _ => true,
            }
        })
        .collect())
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logfile::LogfileExtractor;
    use silo_core::{ExtractError, Record};
    use std::io::Write;
    use time::macros::datetime;
    use time::UtcOffset;

    struct Broken;

    impl Extractor for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn init(&mut self) -> Result<(), ExtractError> {
            Ok(())
        }
        fn read(&mut self, _since: OffsetDateTime) -> Result<Vec<Record>, ExtractError> {
            Err(ExtractError::Journal("reader crashed".into()))
        }
        fn close(&mut self) {}
    }

    struct Unavailable;

    impl Extractor for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }
        fn init(&mut self) -> Result<(), ExtractError> {
            Err(ExtractError::Unavailable("not here".into()))
        }
        fn read(&mut self, _since: OffsetDateTime) -> Result<Vec<Record>, ExtractError> {
            Err(ExtractError::NotInitialized)
        }
        fn close(&mut self) {}
    }

    const TWO_LINES: &str = "Aug  9 00:00:01 h app[1]: one\nAug  9 00:00:02 h app[1]: two\n";

    fn logfile_source(host: &str, path: &std::path::Path) -> Source {
        let ex = LogfileExtractor::new([path])
            .with_offset(UtcOffset::UTC)
            .with_reference_time(datetime!(2024-08-12 00:00:00 UTC));
        Source { host: host.into(), extractor: Box::new(ex) }
    }

    #[test]
    fn cycles_are_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, TWO_LINES).unwrap();

        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let mut driver = Driver::new(db, vec![logfile_source("wintermute", &log)]);
        assert_eq!(driver.init().unwrap(), 1);

        let first = driver.run_once().unwrap();
        assert_eq!(first.inserted, 2);
        let second = driver.run_once().unwrap();
        assert_eq!(second.inserted, 0);

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "Aug  9 00:00:03 h app[1]: three").unwrap();
        let third = driver.run_once().unwrap();
        assert_eq!(third.inserted, 1);

        let host = driver.db().host_get_by_name("wintermute").unwrap().unwrap();
        assert!(host.last_contact > OffsetDateTime::UNIX_EPOCH);
        let stored = driver.db().record_get_by_host(host.host_id.unwrap()).unwrap();
        let messages: Vec<_> = stored.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[test]
    fn restart_resumes_after_stored_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, TWO_LINES).unwrap();
        let db_path = dir.path().join("silo.db");

        {
            let db = Db::open(&db_path).unwrap();
            let mut driver = Driver::new(db, vec![logfile_source("h", &log)]);
            driver.init().unwrap();
            assert_eq!(driver.run_once().unwrap().inserted, 2);
        }

        let mut driver = Driver::new(Db::open(&db_path).unwrap(), vec![logfile_source("h", &log)]);
        driver.init().unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 0);
        assert_eq!(driver.db().record_count().unwrap(), 2);
    }

    #[test]
    fn failing_source_does_not_stop_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, "Aug  9 00:00:01 h app[1]: one\n").unwrap();

        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let sources = vec![
            Source { host: "alpha".into(), extractor: Box::new(Broken) },
            Source { host: "gone".into(), extractor: Box::new(Unavailable) },
            logfile_source("beta", &log),
        ];
        let mut driver = Driver::new(db, sources);
        assert_eq!(driver.init().unwrap(), 2);

        let report = driver.run_once().unwrap();
        assert_eq!(report, CycleReport { sources: 2, inserted: 1, failed: 1 });
        assert!(driver.db().host_get_by_name("gone").unwrap().is_none());
    }

    #[test]
    fn init_fails_without_any_usable_source() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let gone = Source { host: "gone".into(), extractor: Box::new(Unavailable) };
        let mut driver = Driver::new(db, vec![gone]);
        assert!(driver.init().is_err());

        let db = Db::open(dir.path().join("silo.db")).unwrap();
        assert!(Driver::new(db, vec![]).init().is_err());
    }

    #[test]
    fn run_stops_after_requested_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, "Aug  9 00:00:01 h app[1]: one\n").unwrap();
        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let mut driver = Driver::new(db, vec![logfile_source("h", &log)]);
        driver.init().unwrap();
        driver.run(Duration::from_millis(1), Some(3)).unwrap();
        assert_eq!(driver.db().record_count().unwrap(), 1);
    }

    #[test]
    fn two_sources_on_one_host_keep_separate_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let messages = dir.path().join("messages");
        let auth = dir.path().join("auth.log");
        std::fs::write(&messages, "Aug  9 10:00:00 wintermute cron[1]: newer\n").unwrap();
        std::fs::write(
            &auth,
            "Aug  9 09:00:00 wintermute sshd[7]: older\nAug  9 09:30:00 wintermute sshd[7]: mid\n",
        )
        .unwrap();
        let db_path = dir.path().join("silo.db");
        let sources = || {
            vec![logfile_source("wintermute", &messages), logfile_source("wintermute", &auth)]
        };

        let mut driver = Driver::new(Db::open(&db_path).unwrap(), sources());
        driver.init().unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 3);
        assert_eq!(driver.run_once().unwrap().inserted, 0);
        drop(driver);

        let mut driver = Driver::new(Db::open(&db_path).unwrap(), sources());
        driver.init().unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 0);

        let mut f = std::fs::OpenOptions::new().append(true).open(&auth).unwrap();
        writeln!(f, "Aug  9 09:45:00 wintermute sshd[7]: still behind the other file").unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 1);
        assert_eq!(driver.db().record_count().unwrap(), 4);
    }

    #[test]
    fn late_lines_within_an_ingested_second_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, TWO_LINES).unwrap();
        let db_path = dir.path().join("silo.db");

        let mut driver = Driver::new(Db::open(&db_path).unwrap(), vec![logfile_source("h", &log)]);
        driver.init().unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 2);

        // a genuine repeat of "two" and a new line, both in the already stored second
        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(f, "Aug  9 00:00:02 h app[1]: two").unwrap();
        writeln!(f, "Aug  9 00:00:02 h app[1]: late").unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 2);
        assert_eq!(driver.run_once().unwrap().inserted, 0);
        drop(driver);

        let mut driver = Driver::new(Db::open(&db_path).unwrap(), vec![logfile_source("h", &log)]);
        driver.init().unwrap();
        assert_eq!(driver.run_once().unwrap().inserted, 0);

        let host = driver.db().host_get_by_name("h").unwrap().unwrap();
        let stored = driver.db().record_get_by_host(host.host_id.unwrap()).unwrap();
        let messages: Vec<_> = stored.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "two", "late"]);
    }

    #[test]
    fn same_source_twice_on_a_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("messages");
        std::fs::write(&log, TWO_LINES).unwrap();
        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let sources = vec![logfile_source("h", &log), logfile_source("h", &log)];
        assert!(Driver::new(db, sources).init().is_err());

        let db = Db::open(dir.path().join("silo.db")).unwrap();
        let sources = vec![logfile_source("a", &log), logfile_source("b", &log)];
        assert_eq!(Driver::new(db, sources).init().unwrap(), 2);
    }
}
