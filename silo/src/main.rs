use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use records_sqlite::Db;
use silo_core::{Extractor, Host, HostId, Record};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::info;

mod config;
mod driver;
mod logging;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl, Csv }

#[derive(Debug, Parser)]
#[command(name = "silo", version, about = "Collect logs from many hosts into one SQLite store")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./silo.yaml or
    /// ~/.config/silo/silo.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file (overrides the config file)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Pull new records from every configured source into the store
    Collect {
        /// Run a single pass and exit
        #[arg(long, default_value_t = false, conflicts_with = "cycles")]
        once: bool,
        /// Stop after N passes
        #[arg(long)]
        cycles: Option<u64>,
        /// Seconds between passes (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List known hosts
    Hosts {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show stored records for one host or a time period
    Records {
        /// Host name
        #[arg(long, conflicts_with_all = ["from", "to"])]
        host: Option<String>,
        /// Period start, RFC 3339 or unix seconds (inclusive)
        #[arg(long, requires = "to", value_parser = parse_time)]
        from: Option<OffsetDateTime>,
        /// Period end, RFC 3339 or unix seconds (inclusive)
        #[arg(long, requires = "from", value_parser = parse_time)]
        to: Option<OffsetDateTime>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Delete a host and all of its records
    DeleteHost {
        name: String,
    },
    /// Parse syslog-style files without touching the store
    Parse {
        files: Vec<PathBuf>,
        /// Only show records at or after this time
        #[arg(long, value_parser = parse_time)]
        since: Option<OffsetDateTime>,
        /// Treat file timestamps as UTC instead of local time
        #[arg(long, default_value_t = false)]
        utc: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn parse_time(s: &str) -> Result<OffsetDateTime, String> {
    if let Ok(secs) = s.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(secs).map_err(|e| e.to_string());
    }
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| format!("expected RFC 3339 or unix seconds: {e}"))
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.unix_timestamp().to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);
    let cfg = config::load_config(cli.config.as_deref())?;
    let db_path = cli.database.clone().unwrap_or_else(|| cfg.database_path());

    match cli.command {
        Commands::Version => {
            println!("silo {} (core {})", env!("CARGO_PKG_VERSION"), silo_core::version());
        }
        Commands::Collect { once, cycles, interval } => {
            let db = Db::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
            let sources = cfg
                .sources()
                .into_iter()
                .map(config::SourceConfig::into_source)
                .collect::<Result<Vec<_>>>()?;
            let mut driver = driver::Driver::new(db, sources);
            driver.init()?;
            let interval = interval.map(Duration::from_secs).unwrap_or_else(|| cfg.interval());
            let cycles = if once { Some(1) } else { cycles };
            info!(database = %db_path.display(), interval_secs = interval.as_secs(), "collecting");
            driver.run(interval, cycles)?;
            driver.close();
        }
        Commands::Hosts { format } => {
            let db = Db::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
            print_hosts(&db.host_get_all()?, format)?;
        }
        Commands::Records { host, from, to, format } => {
            let db = Db::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
            let records = match (host, from, to) {
                (Some(name), _, _) => {
                    let h = db
                        .host_get_by_name(&name)?
                        .ok_or_else(|| anyhow!("unknown host: {name}"))?;
                    let id = h.host_id.ok_or_else(|| anyhow!("host {name} has no id"))?;
                    db.record_get_by_host(id)?
                }
                (None, Some(begin), Some(end)) => {
                    if begin > end {
                        bail!("--from must not be after --to");
                    }
                    db.record_get_by_period(begin, end)?
                }
                _ => bail!("provide --host <NAME> or --from <T> --to <T>"),
            };
            let names: HashMap<HostId, String> = db
                .host_get_all()?
                .into_iter()
                .filter_map(|h| h.host_id.map(|id| (id, h.name)))
                .collect();
            print_records(&records, &names, format)?;
        }
        Commands::DeleteHost { name } => {
            let db = Db::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
            let h = db.host_get_by_name(&name)?.ok_or_else(|| anyhow!("unknown host: {name}"))?;
            let id = h.host_id.ok_or_else(|| anyhow!("host {name} has no id"))?;
            let removed = db.record_get_by_host(id)?.len();
            db.host_delete(id)?;
            println!("deleted host {name} and {removed} records");
        }
        Commands::Parse { files, since, utc, format } => {
            if files.is_empty() {
                bail!("provide at least one file");
            }
            let mut ex = logfile::LogfileExtractor::new(files);
            if utc {
                ex = ex.with_offset(UtcOffset::UTC);
            }
            ex.init()?;
            let records = ex.read(since.unwrap_or(OffsetDateTime::UNIX_EPOCH));
            ex.close();
            print_records(&records?, &HashMap::new(), format)?;
        }
    }
    Ok(())
}

fn print_hosts(hosts: &[Host], format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut w = stdout.lock();
    match format {
        OutputFormat::Text => {
            for h in hosts {
                let seen = if h.last_contact == OffsetDateTime::UNIX_EPOCH {
                    "never".to_string()
                } else {
                    rfc3339(h.last_contact)
                };
                let id = h.host_id.unwrap_or_default();
                writeln!(w, "{id:>6}  {:<24} last contact {seen}", h.name)?;
            }
        }
        OutputFormat::Json => writeln!(w, "{}", serde_json::to_string(hosts)?)?,
        OutputFormat::Jsonl => {
            for h in hosts { writeln!(w, "{}", serde_json::to_string(h)?)?; }
        }
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(w);
            wtr.write_record(["host_id", "name", "last_contact"])?;
            for h in hosts {
                wtr.write_record([
                    h.host_id.unwrap_or_default().to_string(),
                    h.name.clone(),
                    rfc3339(h.last_contact),
                ])?;
            }
            wtr.flush()?;
        }
    }
    Ok(())
}

fn print_records(
    records: &[Record],
    hosts: &HashMap<HostId, String>,
    format: OutputFormat,
) -> Result<()> {
    let host_name =
        |r: &Record| r.host_id.and_then(|id| hosts.get(&id)).map(String::as_str).unwrap_or("-");
    let stdout = std::io::stdout();
    let mut w = stdout.lock();
    match format {
        OutputFormat::Text => {
            for r in records {
                let ts = rfc3339(r.timestamp);
                writeln!(w, "{ts} {} {}: {}", host_name(r), r.source, r.message)?;
            }
        }
        OutputFormat::Json => writeln!(w, "{}", serde_json::to_string(records)?)?,
        OutputFormat::Jsonl => {
            for r in records { writeln!(w, "{}", serde_json::to_string(r)?)?; }
        }
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(w);
            wtr.write_record(["record_id", "host", "timestamp", "source", "message"])?;
            for r in records {
                wtr.write_record([
                    r.record_id.map(|id| id.to_string()).unwrap_or_default(),
                    host_name(r).to_string(),
                    rfc3339(r.timestamp),
                    r.source.clone(),
                    r.message.clone(),
                ])?;
            }
            wtr.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_unix_and_rfc3339_times() {
        assert_eq!(
            parse_time("1723161600").unwrap(),
            time::macros::datetime!(2024-08-09 00:00:00 UTC)
        );
        assert_eq!(
            parse_time("2024-08-09T02:00:00+02:00").unwrap(),
            time::macros::datetime!(2024-08-09 00:00:00 UTC)
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn records_requires_both_period_bounds() {
        assert!(Cli::try_parse_from(["silo", "records", "--from", "0"]).is_err());
        let both = ["silo", "records", "--host", "h", "--from", "0", "--to", "1"];
        assert!(Cli::try_parse_from(both).is_err());
        assert!(Cli::try_parse_from(["silo", "records", "--from", "0", "--to", "1"]).is_ok());
    }
}
