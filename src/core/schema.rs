//! Schema binding.
//!
//! Every setting the store accepts must be declared in a definitions file.
//! Definitions live in `*.ini` files spread over a colon-separated search
//! path of directories; each section declares one setting:
//!
//! ```ini
//! [svc::port]
//! default=8080
//! validator=integer(1..65535)
//! help=TCP port the service listens on.
//! ```
//!
//! The map is immutable after load. When the search path yields nothing the
//! daemon runs dormant: every read and write answers `Unknown`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

use super::SettingName;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid validator {descriptor:?}: {reason}")]
    InvalidValidator { descriptor: String, reason: String },
}

/// Validation rule attached to one setting definition.
#[derive(Debug)]
pub enum Validator {
    Integer { min: Option<i64>, max: Option<i64> },
    Double,
    Duration,
    Regex(regex::Regex),
}

impl Validator {
    /// Parse a `validator=` descriptor from a definitions file.
    pub fn parse(descriptor: &str) -> Result<Self, SchemaError> {
        let descriptor = descriptor.trim();
        let (kind, argument) = match descriptor.split_once('(') {
            Some((kind, rest)) => {
                let argument =
                    rest.strip_suffix(')')
                        .ok_or_else(|| SchemaError::InvalidValidator {
                            descriptor: descriptor.to_string(),
                            reason: "missing closing parenthesis".into(),
                        })?;
                (kind.trim(), Some(argument))
            }
            None => (descriptor, None),
        };

        match kind {
            "integer" => {
                let (min, max) = match argument {
                    None => (None, None),
                    Some(range) => {
                        parse_range(range).ok_or_else(|| SchemaError::InvalidValidator {
                            descriptor: descriptor.to_string(),
                            reason: "expected integer(min..max)".into(),
                        })?
                    }
                };
                Ok(Validator::Integer { min, max })
            }
            "double" => Ok(Validator::Double),
            "duration" => Ok(Validator::Duration),
            "regex" => {
                let pattern = argument.ok_or_else(|| SchemaError::InvalidValidator {
                    descriptor: descriptor.to_string(),
                    reason: "regex requires a pattern argument".into(),
                })?;
                let compiled =
                    regex::Regex::new(pattern).map_err(|e| SchemaError::InvalidValidator {
                        descriptor: descriptor.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Validator::Regex(compiled))
            }
            other => Err(SchemaError::InvalidValidator {
                descriptor: descriptor.to_string(),
                reason: format!("unknown validator {other:?}"),
            }),
        }
    }

    /// Check a candidate value, returning a human-readable refusal.
    pub fn check(&self, text: &str) -> Result<(), String> {
        match self {
            Validator::Integer { min, max } => {
                let value: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| format!("value {text:?} failed the integer validator"))?;
                if let Some(min) = min
                    && value < *min
                {
                    return Err(format!("value {value} is below the minimum {min}"));
                }
                if let Some(max) = max
                    && value > *max
                {
                    return Err(format!("value {value} is above the maximum {max}"));
                }
                Ok(())
            }
            Validator::Double => text
                .trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| format!("value {text:?} failed the double validator")),
            Validator::Duration => {
                if check_duration(text) {
                    Ok(())
                } else {
                    Err(format!("value {text:?} failed the duration validator"))
                }
            }
            Validator::Regex(pattern) => {
                if pattern.is_match(text) {
                    Ok(())
                } else {
                    Err(format!(
                        "value {text:?} failed the regex validator ({pattern})"
                    ))
                }
            }
        }
    }
}

/// `min..max` with either bound optional (`..100`, `1..`, `1..100`).
fn parse_range(range: &str) -> Option<(Option<i64>, Option<i64>)> {
    let (lo, hi) = range.split_once("..")?;
    let lo = lo.trim();
    let hi = hi.trim();
    let min = if lo.is_empty() {
        None
    } else {
        Some(lo.parse().ok()?)
    };
    let max = if hi.is_empty() {
        None
    } else {
        Some(hi.parse().ok()?)
    };
    Some((min, max))
}

/// A duration is a non-negative number with an optional `s`/`m`/`h`/`d` unit.
fn check_duration(text: &str) -> bool {
    let trimmed = text.trim();
    let number = trimmed
        .strip_suffix(['s', 'm', 'h', 'd'])
        .unwrap_or(trimmed);
    !number.is_empty() && number.parse::<f64>().is_ok_and(|v| v >= 0.0)
}

/// One loaded setting definition.
#[derive(Debug)]
pub struct SchemaEntry {
    pub default: Option<String>,
    pub validator: Option<Validator>,
    pub help: String,
}

impl SchemaEntry {
    pub fn validate(&self, text: &str) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator.check(text),
            None => Ok(()),
        }
    }
}

/// The immutable-after-load definitions map.
#[derive(Debug, Default)]
pub struct Schema {
    entries: BTreeMap<SettingName, SchemaEntry>,
}

impl Schema {
    /// Load every `*.ini` file found in a colon-separated directory search
    /// path. Missing or empty directories are tolerated; the first
    /// definition of a name wins and later duplicates log a warning.
    pub fn load(search_path: &str) -> Self {
        let mut schema = Schema::default();
        let mut found_any = false;
        for dir in search_path.split(':').filter(|d| !d.is_empty()) {
            if schema.load_directory(Path::new(dir)) {
                found_any = true;
            }
        }
        if !found_any {
            tracing::warn!(
                search_path,
                "no settings definition files found; the service will be dormant"
            );
        }
        schema
    }

    fn load_directory(&mut self, dir: &Path) -> bool {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("cannot read definitions directory {}: {e}", dir.display());
                return false;
            }
        };

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "ini"))
            .collect();
        files.sort();

        let mut found = false;
        for file in files {
            match fs::read_to_string(&file) {
                Ok(contents) => {
                    tracing::debug!("loading settings definitions from {}", file.display());
                    self.parse_definitions(&contents, &file);
                    found = true;
                }
                Err(e) => {
                    tracing::warn!("cannot read definitions file {}: {e}", file.display());
                }
            }
        }
        found
    }

    fn parse_definitions(&mut self, contents: &str, file: &Path) {
        let mut current: Option<(SettingName, SchemaEntry)> = None;

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some((name, entry)) = current.take() {
                    self.insert(name, entry);
                }
                match SettingName::parse(section) {
                    Ok(name) => {
                        current = Some((
                            name,
                            SchemaEntry {
                                default: None,
                                validator: None,
                                help: String::new(),
                            },
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(
                            "{}:{}: skipping section {section:?}: {e}",
                            file.display(),
                            lineno + 1
                        );
                        current = None;
                    }
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(
                    "{}:{}: skipping malformed line {line:?}",
                    file.display(),
                    lineno + 1
                );
                continue;
            };
            let Some((_, entry)) = current.as_mut() else {
                tracing::warn!(
                    "{}:{}: field outside of any section",
                    file.display(),
                    lineno + 1
                );
                continue;
            };

            let value = value.trim();
            match key.trim() {
                "default" => entry.default = Some(value.to_string()),
                "help" => entry.help = value.to_string(),
                "validator" => match Validator::parse(value) {
                    Ok(validator) => entry.validator = Some(validator),
                    Err(e) => {
                        tracing::warn!("{}:{}: {e}", file.display(), lineno + 1);
                    }
                },
                other => {
                    tracing::debug!(
                        "{}:{}: ignoring unknown field {other:?}",
                        file.display(),
                        lineno + 1
                    );
                }
            }
        }

        if let Some((name, entry)) = current.take() {
            self.insert(name, entry);
        }
    }

    fn insert(&mut self, name: SettingName, entry: SchemaEntry) {
        if self.entries.contains_key(&name) {
            tracing::warn!("duplicate definition of {name} ignored; first one wins");
            return;
        }
        self.entries.insert(name, entry);
    }

    pub fn get(&self, name: &SettingName) -> Option<&SchemaEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &SettingName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sorted, comma-joined catalogue of all defined names.
    pub fn list_of_options(&self) -> String {
        let names: Vec<&str> = self.entries.keys().map(|n| n.as_str()).collect();
        names.join(",")
    }

    /// Build a schema directly from entries, bypassing the filesystem.
    pub fn from_entries(entries: impl IntoIterator<Item = (SettingName, SchemaEntry)>) -> Self {
        let mut schema = Schema::default();
        for (name, entry) in entries {
            schema.insert(name, entry);
        }
        schema
    }
}
