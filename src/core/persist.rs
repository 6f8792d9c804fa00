//! Durable storage of the settings file.
//!
//! The on-disk format is a flat text file, one line per record:
//!
//! ```text
//! <setting-name>::<priority> = <timestamp-ns>|<escaped-value>
//! ```
//!
//! A save is always a full rewrite: the previous file is kept as `.bak`,
//! the new contents land in a temp file that is renamed over the live name.

use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use super::schema::Schema;
use super::store::{SetResult, SettingStore};
use super::value::{FIELD_SEPARATOR, escape_text, unescape_text};
use super::{Priority, SettingName, Timestamp};

const HEADER: &str = "\
# WARNING: AUTO-GENERATED FILE, DO NOT EDIT
#          fluid-settings rewrites this file after every change
";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cannot write settings file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Write the whole store to `path`.
pub fn save(store: &SettingStore, path: &Path) -> Result<(), PersistError> {
    let mut contents = String::from(HEADER);
    for name in store.names() {
        let Some(records) = store.records(name) else {
            continue;
        };
        for record in records.values() {
            contents.push_str(name.as_str());
            contents.push_str(SettingName::SEPARATOR);
            contents.push_str(&record.priority.to_string());
            contents.push_str(" = ");
            contents.push_str(&record.timestamp.to_string());
            contents.push(FIELD_SEPARATOR);
            contents.push_str(&escape_text(&record.text));
            contents.push('\n');
        }
    }

    let write_err = |source| PersistError::Write {
        path: path.display().to_string(),
        source,
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        fs::create_dir_all(dir).map_err(write_err)?;
    }

    // keep the previous generation around
    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        if let Err(e) = fs::rename(path, &backup) {
            tracing::warn!("cannot keep backup of {}: {e}", path.display());
        }
    }

    let dir = dir.unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Load a settings file into the store.
///
/// Every well-formed line goes through the ordinary `set()` path so schema
/// validation applies; malformed lines are logged and skipped. A missing
/// file is not an error; the daemon simply starts empty.
pub fn load(store: &mut SettingStore, schema: &Schema, path: &Path) -> Result<(), PersistError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no settings file at {}; starting empty", path.display());
            return Ok(());
        }
        Err(source) => {
            return Err(PersistError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some((name, priority, timestamp, text)) => {
                let result = store.set(schema, &name, &text, priority, timestamp);
                if result == SetResult::Unknown {
                    tracing::warn!(
                        "{}:{}: setting {name} is not defined in the schema; dropped",
                        path.display(),
                        lineno + 1
                    );
                }
            }
            None => {
                tracing::warn!(
                    "{}:{}: skipping malformed line {line:?}",
                    path.display(),
                    lineno + 1
                );
            }
        }
    }
    Ok(())
}

fn parse_line(line: &str) -> Option<(SettingName, Priority, Timestamp, String)> {
    let (key, value) = line.split_once('=')?;

    // the key is "<name>::<priority>"
    let (name, priority) = key.trim().rsplit_once(SettingName::SEPARATOR)?;
    let name = SettingName::parse(name).ok()?;
    let priority = Priority::new(priority.parse().ok()?).ok()?;

    let (timestamp, text) = value.trim().split_once(FIELD_SEPARATOR)?;
    let timestamp = Timestamp::from_nanos(timestamp.parse().ok()?).ok()?;

    Some((name, priority, timestamp, unescape_text(text)))
}
