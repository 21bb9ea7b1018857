use anyhow::{Context, Result};
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use logfile::LogfileExtractor;
use time::UtcOffset;

use crate::driver::Source;

const CONFIG_FILE: &str = "silo.yaml";
const DEFAULT_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Journal {
        host: Option<String>,
        program: Option<String>,
        #[serde(default)]
        args: Vec<String>,
    },
    Logfile {
        host: Option<String>,
        paths: Vec<PathBuf>,
        #[serde(default)]
        utc: bool,
    },
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_db_path)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS).max(1))
    }

    /// Configured sources, or the local journal when none are listed.
    pub fn sources(&self) -> Vec<SourceConfig> {
        if self.sources.is_empty() {
            vec![SourceConfig::Journal { host: None, program: None, args: Vec::new() }]
        } else {
            self.sources.clone()
        }
    }
}

impl SourceConfig {
    pub fn host(&self) -> String {
        let host = match self {
            SourceConfig::Journal { host, .. } | SourceConfig::Logfile { host, .. } => host,
        };
        host.clone().unwrap_or_else(local_hostname)
    }

    pub fn into_source(self) -> Result<Source> {
        let host = self.host();
        match self {
            SourceConfig::Logfile { paths, utc, .. } => {
                anyhow::ensure!(!paths.is_empty(), "logfile source for {host} lists no paths");
                let mut ex = LogfileExtractor::new(paths);
                if utc {
                    ex = ex.with_offset(UtcOffset::UTC);
                }
                Ok(Source { host, extractor: Box::new(ex) })
            }
            #[cfg(feature = "journal")]
            SourceConfig::Journal { program, args, .. } => {
                let ex = match program {
                    Some(p) => journald::JournalExtractor::with_program(p),
                    None => journald::JournalExtractor::new(),
                };
                Ok(Source { host, extractor: Box::new(ex.args(args)) })
            }
            #[cfg(not(feature = "journal"))]
            SourceConfig::Journal { .. } => {
                anyhow::bail!("journal source for {host}: built without journal support")
            }
        }
    }
}

/// Loads the YAML config from `path`, else from `./silo.yaml` or the user
/// config directory. No file at all yields the defaults; a file that does
/// not parse is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_candidates().into_iter().find(|p| p.exists()) {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };
    let s = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

fn default_config_candidates() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from(CONFIG_FILE)];
    let config_home = std::env::var_os("XDG_CONFIG_HOME");
    if let Some(dir) = base_dir(config_home, std::env::var_os("HOME"), ".config") {
        out.push(dir.join("silo").join(CONFIG_FILE));
    }
    out
}

pub fn default_db_path() -> PathBuf {
    db_path_from(std::env::var_os("XDG_DATA_HOME"), std::env::var_os("HOME"))
}

fn db_path_from(xdg_data: Option<OsString>, home: Option<OsString>) -> PathBuf {
    match base_dir(xdg_data, home, ".local/share") {
        Some(dir) => dir.join("silo").join("silo.db"),
        None => PathBuf::from("silo.db"),
    }
}

/// `$XDG_*` if set and absolute, else `$HOME/<fallback>`.
fn base_dir(xdg: Option<OsString>, home: Option<OsString>, fallback: &str) -> Option<PathBuf> {
    xdg.map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| home.filter(|h| !h.is_empty()).map(|h| PathBuf::from(h).join(fallback)))
}

pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the duration of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = parse_config(
            r#"
database: /var/lib/silo/silo.db
interval_secs: 30
sources:
  - kind: journal
    host: wintermute
    args: ["--unit", "sshd"]
  - kind: logfile
    host: wintermute
    paths: [/var/log/messages, /var/log/auth.log]
    utc: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/silo/silo.db"));
        assert_eq!(cfg.interval(), Duration::from_secs(30));
        assert_eq!(
            cfg.sources[0],
            SourceConfig::Journal {
                host: Some("wintermute".into()),
                program: None,
                args: vec!["--unit".into(), "sshd".into()],
            }
        );
        assert_eq!(
            cfg.sources[1],
            SourceConfig::Logfile {
                host: Some("wintermute".into()),
                paths: vec!["/var/log/messages".into(), "/var/log/auth.log".into()],
                utc: true,
            }
        );
    }

    #[test]
    fn empty_config_falls_back_to_local_journal() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.interval(), Duration::from_secs(DEFAULT_INTERVAL_SECS));
        let sources = cfg.sources();
        assert_eq!(sources.len(), 1);
        assert!(matches!(sources[0], SourceConfig::Journal { host: None, .. }));
        assert_eq!(sources[0].host(), local_hostname());
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_config("sources: [{kind: carrier-pigeon}]").is_err());
        assert!(parse_config("interval_secs: soon").is_err());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(dir.path().join("nope.yaml").as_path())).is_err());
    }

    #[test]
    fn logfile_source_needs_paths() {
        let sc = SourceConfig::Logfile { host: Some("h".into()), paths: vec![], utc: false };
        assert!(sc.into_source().is_err());
    }

    #[test]
    fn db_path_resolution() {
        assert_eq!(
            db_path_from(Some("/data".into()), Some("/home/u".into())),
            PathBuf::from("/data/silo/silo.db")
        );
        assert_eq!(
            db_path_from(Some("relative".into()), Some("/home/u".into())),
            PathBuf::from("/home/u/.local/share/silo/silo.db")
        );
        assert_eq!(db_path_from(None, None), PathBuf::from("silo.db"));
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
