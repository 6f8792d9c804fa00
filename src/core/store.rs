//! The settings engine.
//!
//! `SettingStore` is the single owner of all value records. Other components
//! hold names and call in; the schema stays in its own immutable structure
//! and is passed to the operations that need it.
//!
//! Effective state is deterministic from the multiset of applied writes:
//! within one priority the strictly newest timestamp wins (an equal
//! timestamp is ignored), and across priorities the highest priority
//! present wins.

use std::collections::BTreeMap;

use super::schema::Schema;
use super::value::{
    FIELD_SEPARATOR, RECORD_SEPARATOR, ValueRecord, escape_commas, escape_text, unescape_text,
};
use super::{Lookup, Priority, SettingName, Timestamp};

/// Outcome of a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetResult {
    /// A stored record matched.
    Success(String),
    /// No records; the schema default was returned instead.
    Default(String),
    /// No records and no schema default.
    NotSet,
    /// Records exist, but none at the requested priority.
    PriorityNotFound,
    /// The schema does not define this name.
    Unknown,
    /// Internal inconsistency between the store and its own bookkeeping.
    Error(String),
}

/// Outcome of a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetResult {
    /// The setting did not exist before.
    New,
    /// The setting existed but had no record at this priority.
    NewPriority,
    /// The record at this priority was replaced with different text.
    Changed,
    /// Same text, newer timestamp; the slot advanced.
    Newer,
    /// The incoming timestamp was not strictly newer; the write was ignored.
    Unchanged,
    /// The schema does not define this name.
    Unknown,
    /// The schema validator refused the text.
    Error(String),
}

impl SetResult {
    /// Whether the store state is different after the write.
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            SetResult::New | SetResult::NewPriority | SetResult::Changed | SetResult::Newer
        )
    }

    /// Wire reason token for `UPDATED` replies.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            SetResult::New => Some("new"),
            SetResult::NewPriority => Some("new_priority"),
            SetResult::Changed => Some("changed"),
            SetResult::Newer => Some("newer"),
            SetResult::Unchanged => Some("unchanged"),
            SetResult::Unknown | SetResult::Error(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingStore {
    values: BTreeMap<SettingName, BTreeMap<Priority, ValueRecord>>,
}

impl SettingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one value.
    pub fn get(&self, schema: &Schema, name: &SettingName, lookup: Lookup) -> GetResult {
        let Some(entry) = schema.get(name) else {
            return GetResult::Unknown;
        };

        let records = match self.values.get(name) {
            Some(records) => records,
            None => {
                return match &entry.default {
                    Some(default) => GetResult::Default(default.clone()),
                    None => GetResult::NotSet,
                };
            }
        };

        match lookup {
            Lookup::Highest => match records.last_key_value() {
                Some((_, record)) => GetResult::Success(record.text.clone()),
                // reset() prunes empty settings, so this is a broken store
                None => GetResult::Error(format!("setting {name} exists without records")),
            },
            Lookup::At(priority) => match records.get(&priority) {
                Some(record) => GetResult::Success(record.text.clone()),
                None => GetResult::PriorityNotFound,
            },
        }
    }

    /// Read every record's text, comma-joined in priority order. Literal
    /// commas inside values are backslash-escaped.
    pub fn get_all(&self, schema: &Schema, name: &SettingName) -> GetResult {
        let Some(entry) = schema.get(name) else {
            return GetResult::Unknown;
        };

        match self.values.get(name) {
            Some(records) if !records.is_empty() => {
                let joined: Vec<String> = records
                    .values()
                    .map(|record| escape_commas(&record.text))
                    .collect();
                GetResult::Success(joined.join(","))
            }
            _ => match &entry.default {
                Some(default) => GetResult::Default(default.clone()),
                None => GetResult::NotSet,
            },
        }
    }

    /// Read the schema default, ignoring any stored records.
    pub fn get_default(&self, schema: &Schema, name: &SettingName) -> GetResult {
        match schema.get(name) {
            Some(entry) => match &entry.default {
                Some(default) => GetResult::Default(default.clone()),
                None => GetResult::NotSet,
            },
            None => GetResult::Unknown,
        }
    }

    /// Apply one write.
    ///
    /// The text is validated before any record is touched; a refusal leaves
    /// the store unchanged.
    pub fn set(
        &mut self,
        schema: &Schema,
        name: &SettingName,
        text: &str,
        priority: Priority,
        timestamp: Timestamp,
    ) -> SetResult {
        let Some(entry) = schema.get(name) else {
            return SetResult::Unknown;
        };
        if let Err(reason) = entry.validate(text) {
            return SetResult::Error(reason);
        }

        let record = ValueRecord::new(text, priority, timestamp);
        let Some(records) = self.values.get_mut(name) else {
            self.values
                .insert(name.clone(), BTreeMap::from([(priority, record)]));
            return SetResult::New;
        };

        let Some(existing) = records.get_mut(&priority) else {
            records.insert(priority, record);
            return SetResult::NewPriority;
        };

        // same slot: only a strictly newer timestamp replaces it
        if timestamp <= existing.timestamp {
            return SetResult::Unchanged;
        }
        let same_text = existing.text == text;
        *existing = record;
        if same_text {
            SetResult::Newer
        } else {
            SetResult::Changed
        }
    }

    /// Remove the record at one priority. The setting disappears entirely
    /// when its last record goes.
    pub fn reset(&mut self, name: &SettingName, priority: Priority) -> bool {
        let Some(records) = self.values.get_mut(name) else {
            return false;
        };
        if records.remove(&priority).is_none() {
            return false;
        }
        if records.is_empty() {
            self.values.remove(name);
        }
        true
    }

    /// The record a default `GET` would return: highest priority present.
    pub fn effective(&self, name: &SettingName) -> Option<&ValueRecord> {
        self.values
            .get(name)
            .and_then(|records| records.last_key_value())
            .map(|(_, record)| record)
    }

    /// Encode every record of one setting, one `priority|timestamp|text`
    /// line per record, each line newline-terminated. Returns `None` for a
    /// setting with no records.
    pub fn serialize(&self, name: &SettingName) -> Option<String> {
        let records = self.values.get(name)?;
        let mut out = String::new();
        for record in records.values() {
            out.push_str(&record.priority.to_string());
            out.push(FIELD_SEPARATOR);
            out.push_str(&record.timestamp.to_string());
            out.push(FIELD_SEPARATOR);
            out.push_str(&escape_text(&record.text));
            out.push(RECORD_SEPARATOR);
        }
        Some(out)
    }

    /// Apply a serialized record blob received from a peer. Malformed lines
    /// are logged and skipped; well-formed records go through the ordinary
    /// [`SettingStore::set`] path so validation and last-writer-wins apply.
    pub fn deserialize(
        &mut self,
        schema: &Schema,
        name: &SettingName,
        blob: &str,
    ) -> Vec<SetResult> {
        let mut results = Vec::new();
        for line in blob.split(RECORD_SEPARATOR).filter(|l| !l.is_empty()) {
            let mut fields = line.splitn(3, FIELD_SEPARATOR);
            let (Some(priority), Some(timestamp), Some(text)) =
                (fields.next(), fields.next(), fields.next())
            else {
                tracing::warn!("skipping malformed record {line:?} for {name}");
                continue;
            };

            let priority = match priority.parse::<i64>().ok().map(Priority::new) {
                Some(Ok(priority)) => priority,
                _ => {
                    tracing::warn!("skipping record with bad priority {priority:?} for {name}");
                    continue;
                }
            };
            let timestamp = match timestamp.parse::<i64>().ok().map(Timestamp::from_nanos) {
                Some(Ok(timestamp)) => timestamp,
                _ => {
                    tracing::warn!("skipping record with bad timestamp {timestamp:?} for {name}");
                    continue;
                }
            };

            results.push(self.set(schema, name, &unescape_text(text), priority, timestamp));
        }
        results
    }

    pub fn names(&self) -> impl Iterator<Item = &SettingName> {
        self.values.keys()
    }

    /// All records of one setting in priority order.
    pub fn records(&self, name: &SettingName) -> Option<&BTreeMap<Priority, ValueRecord>> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
