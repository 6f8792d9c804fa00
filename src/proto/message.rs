//! Bus messages.
//!
//! Every message is a command name plus a flat set of named string
//! parameters, with routing fields filled in by the bus: who sent it and
//! who it is for. Replies copy the sender into the destination and echo
//! the opaque correlation id untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Command names understood or emitted by the daemon.
pub mod commands {
    // client-facing requests
    pub const GET: &str = "FLUID_SETTINGS_GET";
    pub const PUT: &str = "FLUID_SETTINGS_PUT";
    pub const DELETE: &str = "FLUID_SETTINGS_DELETE";
    pub const LIST: &str = "FLUID_SETTINGS_LIST";
    pub const LISTEN: &str = "FLUID_SETTINGS_LISTEN";
    pub const FORGET_REQUEST: &str = "FLUID_SETTINGS_FORGET";
    pub const GOSSIP: &str = "FLUID_SETTINGS_GOSSIP";

    // replies and notifications
    pub const VALUE: &str = "VALUE";
    pub const ALL_VALUES: &str = "ALL_VALUES";
    pub const DEFAULT_VALUE: &str = "DEFAULT_VALUE";
    pub const NOT_SET: &str = "NOT_SET";
    pub const INVALID: &str = "INVALID";
    pub const UPDATED: &str = "UPDATED";
    pub const DELETED: &str = "DELETED";
    pub const OPTIONS: &str = "OPTIONS";
    pub const REGISTERED: &str = "REGISTERED";
    pub const READY: &str = "READY";
    pub const FORGET: &str = "FORGET";
    pub const CONNECTED: &str = "CONNECTED";
    pub const VALUE_UPDATED: &str = "VALUE_UPDATED";

    // peer-to-peer
    pub const VALUE_CHANGED: &str = "VALUE_CHANGED";

    // bus lifecycle
    pub const REGISTER: &str = "REGISTER";
    pub const BUS_READY: &str = "READY_TO_SERVE";
    pub const RESTART: &str = "RESTART";
    pub const STOP: &str = "STOP";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub command: String,

    /// Originating endpoint, filled in by the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_service: Option<String>,

    /// Destination endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Opaque correlation id, echoed verbatim in replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Start a reply: destination set to the request's sender, correlation
    /// id carried over.
    pub fn reply_to(request: &Message, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            server: request.from_server.clone(),
            service: request.from_service.clone(),
            transaction_id: request.transaction_id.clone(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_destination(
        mut self,
        server: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        self.server = Some(server.into());
        self.service = Some(service.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// An integer parameter; `None` when absent, `Some(Err)` when present
    /// but unparseable.
    pub fn int_parameter(&self, name: &str) -> Option<Result<i64, String>> {
        self.parameter(name).map(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| format!("parameter {name:?} must be an integer, got {raw:?}"))
        })
    }

    /// A boolean flag parameter. Absent means `false`; `"true"`, `"1"`,
    /// `"on"` and `"yes"` mean `true`.
    pub fn flag_parameter(&self, name: &str) -> bool {
        self.parameter(name)
            .is_some_and(|raw| matches!(raw, "true" | "1" | "on" | "yes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_routes_back_to_sender() {
        let mut request = Message::new(commands::GET);
        request.from_server = Some("host1".into());
        request.from_service = Some("web".into());
        request.transaction_id = Some("tx-42".into());

        let reply = Message::reply_to(&request, commands::VALUE);
        assert_eq!(reply.command, commands::VALUE);
        assert_eq!(reply.server.as_deref(), Some("host1"));
        assert_eq!(reply.service.as_deref(), Some("web"));
        assert_eq!(reply.transaction_id.as_deref(), Some("tx-42"));
    }

    #[test]
    fn parameter_accessors() {
        let msg = Message::new(commands::PUT)
            .with_parameter("name", "svc::port")
            .with_parameter("priority", "50")
            .with_parameter("all", "true");

        assert_eq!(msg.parameter("name"), Some("svc::port"));
        assert!(msg.has_parameter("priority"));
        assert_eq!(msg.int_parameter("priority"), Some(Ok(50)));
        assert!(msg.int_parameter("name").unwrap().is_err());
        assert_eq!(msg.int_parameter("missing"), None);
        assert!(msg.flag_parameter("all"));
        assert!(!msg.flag_parameter("default"));
    }

    #[test]
    fn serde_omits_empty_fields() {
        let json = serde_json::to_string(&Message::new(commands::LIST)).unwrap();
        assert_eq!(json, "{\"command\":\"FLUID_SETTINGS_LIST\"}");
    }
}
