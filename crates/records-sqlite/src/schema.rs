/// Statements run, in order and inside one transaction, when a store is
/// opened for the first time.
pub const INIT_STATEMENTS: &[&str] = &[
    r#"
CREATE TABLE host (
  id              INTEGER PRIMARY KEY,
  name            TEXT UNIQUE NOT NULL,
  last_contact    INTEGER NOT NULL DEFAULT 0
) STRICT
"#,
    "CREATE UNIQUE INDEX host_name_idx ON host (name)",
    r#"
CREATE TABLE record (
  id              INTEGER PRIMARY KEY,
  host_id         INTEGER NOT NULL,
  timestamp       INTEGER NOT NULL,
  source          TEXT NOT NULL,
  message         TEXT NOT NULL,
  FOREIGN KEY (host_id) REFERENCES host (id)
    ON DELETE CASCADE
    ON UPDATE RESTRICT
) STRICT
"#,
    "CREATE INDEX record_host_idx ON record (host_id)",
    "CREATE INDEX record_time_idx ON record (timestamp)",
    r#"
CREATE TABLE cursor (
  host_id         INTEGER NOT NULL,
  source_key      TEXT NOT NULL,
  timestamp       INTEGER NOT NULL,
  PRIMARY KEY (host_id, source_key),
  FOREIGN KEY (host_id) REFERENCES host (id)
    ON DELETE CASCADE
    ON UPDATE RESTRICT
) STRICT
"#,
];

/// Table whose presence marks an initialized store.
pub const MARKER_TABLE: &str = "host";
