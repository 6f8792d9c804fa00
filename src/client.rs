//! The service-side client.
//!
//! Services embed [`FluidSettingsClient`] next to their bus connection:
//! it builds the request messages, tracks which settings are being
//! watched, and turns replies into [`FluidEvent`]s. The transport stays
//! with the caller; this type never touches a socket, which also makes
//! it trivial to test.
//!
//! Requests that expect a reply share one deadline queue keyed by
//! `(command, name)` instead of one timer per request. When a deadline
//! passes, [`FluidSettingsClient::expire`] synthesises a `Timeout` event
//! and the eventual late reply is discarded.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::time::{Duration, Instant};

use crate::core::{Priority, SettingName};
use crate::proto::{Message, commands};

/// Default reply deadline; `fluid-settings-timeout` /
/// `FLUID_SETTINGS_TIMEOUT` override it (e.g. `30s`, `500ms`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the embedding service observes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FluidEvent {
    Value { name: String, value: String },
    DefaultValue { name: String, value: String },
    AllValues { values: String },
    NotSet { error: String },
    Updated { name: String, reason: String },
    Deleted { name: String },
    Options { options: Vec<String> },
    Registered { message: Option<String> },
    Ready { errors: u32 },
    ValueUpdated { name: String, value: Result<String, String> },
    Invalid { command: String, message: String },
    Timeout { command: String, name: String },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    command: String,
    name: String,
}

pub struct FluidSettingsClient {
    service: String,
    timeout: Duration,
    watches: BTreeSet<String>,
    /// Outstanding requests and their deadlines. The heap may hold stale
    /// entries; the map is authoritative.
    pending: BTreeMap<PendingKey, Instant>,
    deadlines: BinaryHeap<Reverse<(Instant, PendingKey)>>,
    next_transaction: u64,
}

impl FluidSettingsClient {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_timeout(service, timeout_from_env().unwrap_or(DEFAULT_TIMEOUT))
    }

    pub fn with_timeout(service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            timeout,
            watches: BTreeSet::new(),
            pending: BTreeMap::new(),
            deadlines: BinaryHeap::new(),
            next_transaction: 0,
        }
    }

    /// Names without a namespace belong to the service itself.
    pub fn qualify(&self, name: &str) -> String {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{}{}{name}", self.service, SettingName::SEPARATOR)
        }
    }

    // === requests ===========================================================

    pub fn get(&mut self, name: &str) -> Message {
        let name = self.qualify(name);
        self.request(commands::GET, &name)
            .with_parameter("name", name)
    }

    pub fn get_at_priority(&mut self, name: &str, priority: Priority) -> Message {
        let name = self.qualify(name);
        self.request(commands::GET, &name)
            .with_parameter("name", name)
            .with_parameter("priority", priority.to_string())
    }

    pub fn get_all(&mut self, name: &str) -> Message {
        let name = self.qualify(name);
        self.request(commands::GET, &name)
            .with_parameter("name", name)
            .with_parameter("all", "true")
    }

    pub fn get_default(&mut self, name: &str) -> Message {
        let name = self.qualify(name);
        self.request(commands::GET, &name)
            .with_parameter("name", name)
            .with_parameter("default", "true")
    }

    pub fn put(&mut self, name: &str, value: &str, priority: Option<Priority>) -> Message {
        let name = self.qualify(name);
        let mut msg = self
            .request(commands::PUT, &name)
            .with_parameter("name", name)
            .with_parameter("value", value);
        if let Some(priority) = priority {
            msg = msg.with_parameter("priority", priority.to_string());
        }
        msg
    }

    pub fn delete(&mut self, name: &str, priority: Option<Priority>) -> Message {
        let name = self.qualify(name);
        let mut msg = self
            .request(commands::DELETE, &name)
            .with_parameter("name", name);
        if let Some(priority) = priority {
            msg = msg.with_parameter("priority", priority.to_string());
        }
        msg
    }

    pub fn list(&mut self) -> Message {
        self.request(commands::LIST, "")
    }

    /// Start watching a setting. Returns the `LISTEN` message to send the
    /// first time a name is added; re-watching is a no-op.
    pub fn add_watch(&mut self, name: &str) -> Option<Message> {
        let name = self.qualify(name);
        if !self.watches.insert(name.clone()) {
            return None;
        }
        Some(Message::new(commands::LISTEN).with_parameter("names", name))
    }

    /// The `LISTEN` message covering every watch, for (re-)registration
    /// after the bus link comes up.
    pub fn listen_to_watches(&self) -> Option<Message> {
        if self.watches.is_empty() {
            return None;
        }
        let names: Vec<&str> = self.watches.iter().map(String::as_str).collect();
        Some(Message::new(commands::LISTEN).with_parameter("names", names.join(",")))
    }

    /// Stop watching. Returns the `FORGET` message when the name was
    /// actually watched.
    pub fn remove_watch(&mut self, name: &str) -> Option<Message> {
        let name = self.qualify(name);
        if !self.watches.remove(&name) {
            return None;
        }
        Some(Message::new(commands::FORGET_REQUEST).with_parameter("names", name))
    }

    fn request(&mut self, command: &str, name: &str) -> Message {
        let key = PendingKey {
            command: command.to_string(),
            name: name.to_string(),
        };
        let deadline = Instant::now() + self.timeout;
        self.pending.insert(key.clone(), deadline);
        self.deadlines.push(Reverse((deadline, key)));

        self.next_transaction += 1;
        let mut msg = Message::new(command);
        msg.transaction_id = Some(format!("fs-{}", self.next_transaction));
        msg
    }

    // === replies ============================================================

    /// Feed one inbound message through the client.
    ///
    /// Returns the event the service should react to, or `None` for
    /// messages that are not ours or replies that already timed out.
    pub fn handle_message(&mut self, msg: &Message) -> Option<FluidEvent> {
        let name = msg.parameter("name").unwrap_or_default().to_string();

        match msg.command.as_str() {
            commands::VALUE => {
                self.settle(commands::GET, &name)?;
                Some(FluidEvent::Value {
                    name,
                    value: msg.parameter("value").unwrap_or_default().to_string(),
                })
            }
            commands::DEFAULT_VALUE => {
                self.settle(commands::GET, &name)?;
                Some(FluidEvent::DefaultValue {
                    name,
                    value: msg.parameter("value").unwrap_or_default().to_string(),
                })
            }
            commands::ALL_VALUES => {
                // the reply does not echo the name; settle the oldest GET
                self.settle_any(commands::GET)?;
                Some(FluidEvent::AllValues {
                    values: msg.parameter("values").unwrap_or_default().to_string(),
                })
            }
            commands::NOT_SET => {
                self.settle_any(commands::GET)?;
                Some(FluidEvent::NotSet {
                    error: msg.parameter("error").unwrap_or_default().to_string(),
                })
            }
            commands::UPDATED => {
                self.settle(commands::PUT, &name)?;
                Some(FluidEvent::Updated {
                    name,
                    reason: msg.parameter("reason").unwrap_or_default().to_string(),
                })
            }
            commands::DELETED => {
                self.settle(commands::DELETE, &name)?;
                Some(FluidEvent::Deleted { name })
            }
            commands::OPTIONS => {
                self.settle(commands::LIST, "")?;
                let options = msg
                    .parameter("options")
                    .unwrap_or_default()
                    .split(',')
                    .filter(|o| !o.is_empty())
                    .map(String::from)
                    .collect();
                Some(FluidEvent::Options { options })
            }
            commands::REGISTERED => Some(FluidEvent::Registered {
                message: msg.parameter("message").map(String::from),
            }),
            commands::READY => {
                let errors = msg
                    .parameter("errcnt")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                Some(FluidEvent::Ready { errors })
            }
            commands::VALUE_UPDATED => {
                let value = match (msg.parameter("value"), msg.parameter("error")) {
                    (Some(value), _) => Ok(value.to_string()),
                    (None, Some(error)) => Err(error.to_string()),
                    (None, None) => Err("no value".to_string()),
                };
                Some(FluidEvent::ValueUpdated { name, value })
            }
            commands::INVALID => {
                let command = msg.parameter("command").unwrap_or_default().to_string();
                // clear whichever request this refusal belongs to
                if self.settle(&command, &name).is_none() {
                    self.settle_any(&command);
                }
                Some(FluidEvent::Invalid {
                    command,
                    message: msg.parameter("message").unwrap_or_default().to_string(),
                })
            }
            _ => None,
        }
    }

    /// Clear one outstanding request; `None` when nothing was pending
    /// (a late reply after a synthesised timeout).
    fn settle(&mut self, command: &str, name: &str) -> Option<()> {
        let key = PendingKey {
            command: command.to_string(),
            name: name.to_string(),
        };
        self.pending.remove(&key).map(|_| ())
    }

    /// Clear the oldest outstanding request for `command`, used for
    /// replies that do not echo the setting name.
    fn settle_any(&mut self, command: &str) -> Option<()> {
        let key = self
            .pending
            .iter()
            .filter(|(key, _)| key.command == command)
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(key, _)| key.clone())?;
        self.pending.remove(&key).map(|_| ())
    }

    // === deadlines ==========================================================

    /// When [`FluidSettingsClient::expire`] next needs to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Synthesise `Timeout` events for every request past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<FluidEvent> {
        let mut timed_out = Vec::new();
        while let Some(Reverse((deadline, key))) = self.deadlines.peek().cloned() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            // only count entries the map still agrees with; the rest are
            // stale heap leftovers from settled requests
            if self.pending.get(&key) == Some(&deadline) {
                self.pending.remove(&key);
                timed_out.push(FluidEvent::Timeout {
                    command: key.command,
                    name: key.name,
                });
            }
        }
        timed_out
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

/// Parse `FLUID_SETTINGS_TIMEOUT`: a bare number of seconds or a value
/// with an `ms`/`s`/`m` suffix.
fn timeout_from_env() -> Option<Duration> {
    let raw = std::env::var("FLUID_SETTINGS_TIMEOUT").ok()?;
    match parse_timeout(&raw) {
        Some(timeout) => Some(timeout),
        None => {
            tracing::warn!("ignoring bad FLUID_SETTINGS_TIMEOUT {raw:?}");
            None
        }
    }
}

fn parse_timeout(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, scale_ms) = if let Some(number) = raw.strip_suffix("ms") {
        (number, 1u64)
    } else if let Some(number) = raw.strip_suffix('s') {
        (number, 1_000)
    } else if let Some(number) = raw.strip_suffix('m') {
        (number, 60_000)
    } else {
        (raw, 1_000)
    };
    let value: u64 = number.trim().parse().ok()?;
    Some(Duration::from_millis(value.checked_mul(scale_ms)?))
}
