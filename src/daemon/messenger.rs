//! Client-facing protocol handlers.
//!
//! Maps each inbound bus command onto store and router operations and
//! builds the replies. Every request gets exactly one terminal reply, and
//! handler errors become `INVALID` replies instead of escaping the state
//! loop.

use crate::core::{GetResult, Lookup, Priority, SetResult, SettingName, Timestamp};
use crate::daemon::core::{Daemon, Origin};
use crate::daemon::replicator::GossipDecision;
use crate::daemon::subscriptions::Subscriber;
use crate::proto::{Message, commands};

impl Daemon {
    pub fn handle_bus_message(&mut self, msg: Message) {
        match msg.command.as_str() {
            commands::GET => self.msg_get(&msg),
            commands::PUT => self.msg_put(&msg),
            commands::DELETE => self.msg_delete(&msg),
            commands::LIST => self.msg_list(&msg),
            commands::LISTEN => self.msg_listen(&msg),
            commands::FORGET_REQUEST => self.msg_forget(&msg),
            commands::GOSSIP => self.msg_gossip(&msg),
            commands::CONNECTED => self.msg_connected(&msg),
            commands::BUS_READY => {
                // first gossip happens as soon as the bus can route it
                self.send_gossip();
            }
            commands::RESTART => {
                tracing::info!("restart requested over the bus");
                self.request_exit(1);
            }
            commands::STOP => {
                tracing::info!("stop requested over the bus");
                self.request_exit(0);
            }
            other => {
                tracing::debug!(command = other, "ignoring unhandled bus command");
            }
        }
    }

    fn invalid(&self, request: &Message, message: impl Into<String>) {
        let reply = Message::reply_to(request, commands::INVALID)
            .with_parameter("command", &request.command)
            .with_parameter("message", message);
        self.send_to_bus(reply);
    }

    // === GET ================================================================

    fn msg_get(&mut self, msg: &Message) {
        let Some(raw_name) = msg.parameter("name") else {
            return self.invalid(msg, "parameter \"name\" missing in message");
        };
        let name = match SettingName::parse(raw_name) {
            Ok(name) => name,
            Err(e) => return self.invalid(msg, e.to_string()),
        };

        let wants_default = msg.flag_parameter("default");
        let wants_all = msg.flag_parameter("all");
        let lookup = match msg.int_parameter("priority") {
            None => Lookup::Highest,
            Some(Ok(value)) => match Lookup::from_wire(value) {
                Ok(lookup) => lookup,
                Err(e) => return self.invalid(msg, e.to_string()),
            },
            Some(Err(e)) => return self.invalid(msg, e),
        };

        let modifiers = [wants_default, wants_all, lookup != Lookup::Highest]
            .iter()
            .filter(|&&m| m)
            .count();
        if modifiers > 1 {
            return self.invalid(
                msg,
                "parameters \"default\", \"all\" and \"priority\" are mutually exclusive",
            );
        }

        let result = if wants_default {
            self.store.get_default(&self.schema, &name)
        } else if wants_all {
            self.store.get_all(&self.schema, &name)
        } else {
            self.store.get(&self.schema, &name, lookup)
        };

        match result {
            GetResult::Success(value) if wants_all => {
                let reply = Message::reply_to(msg, commands::ALL_VALUES)
                    .with_parameter("values", value);
                self.send_to_bus(reply);
            }
            GetResult::Success(value) => {
                let reply = Message::reply_to(msg, commands::VALUE)
                    .with_parameter("name", name.as_str())
                    .with_parameter("value", value);
                self.send_to_bus(reply);
            }
            GetResult::Default(value) => {
                let reply = Message::reply_to(msg, commands::DEFAULT_VALUE)
                    .with_parameter("name", name.as_str())
                    .with_parameter("value", value);
                self.send_to_bus(reply);
            }
            GetResult::NotSet => {
                let reply = Message::reply_to(msg, commands::NOT_SET)
                    .with_parameter("error", format!("setting {name} has no value"));
                self.send_to_bus(reply);
            }
            GetResult::PriorityNotFound => {
                let reply = Message::reply_to(msg, commands::NOT_SET).with_parameter(
                    "error",
                    format!("setting {name} has no value at the requested priority"),
                );
                self.send_to_bus(reply);
            }
            GetResult::Unknown => {
                self.invalid(msg, format!("no setting named {:?}", name.as_str()));
            }
            GetResult::Error(reason) => self.invalid(msg, reason),
        }
    }

    // === PUT ================================================================

    fn msg_put(&mut self, msg: &Message) {
        let (Some(raw_name), Some(value)) = (msg.parameter("name"), msg.parameter("value")) else {
            return self.invalid(msg, "parameter \"name\" or \"value\" missing in message");
        };
        let name = match SettingName::parse(raw_name) {
            Ok(name) => name,
            Err(e) => return self.invalid(msg, e.to_string()),
        };

        let priority = match msg.int_parameter("priority") {
            None => Priority::ADMINISTRATOR,
            Some(Ok(value)) => match Priority::new(value) {
                Ok(priority) => priority,
                Err(_) => {
                    return self.invalid(msg, "parameter \"priority\" is out of range (0 .. 99)");
                }
            },
            Some(Err(e)) => return self.invalid(msg, e),
        };

        let timestamp = match msg.int_parameter("timestamp") {
            None => Timestamp::now(),
            Some(Ok(nanos)) => match Timestamp::from_nanos(nanos) {
                Ok(timestamp) => timestamp,
                Err(e) => return self.invalid(msg, e.to_string()),
            },
            Some(Err(e)) => return self.invalid(msg, e),
        };

        let value = value.to_string();
        match self.apply_set(&name, &value, priority, timestamp, Origin::Local) {
            SetResult::Unknown => {
                self.invalid(msg, format!("no setting named {:?}", name.as_str()));
            }
            SetResult::Error(reason) => self.invalid(msg, reason),
            result => {
                let reason = result.reason().expect("mutating results carry a reason");
                let reply = Message::reply_to(msg, commands::UPDATED)
                    .with_parameter("name", name.as_str())
                    .with_parameter("reason", reason);
                self.send_to_bus(reply);
            }
        }
    }

    // === DELETE =============================================================

    fn msg_delete(&mut self, msg: &Message) {
        let Some(raw_name) = msg.parameter("name") else {
            return self.invalid(msg, "parameter \"name\" missing in message");
        };
        let name = match SettingName::parse(raw_name) {
            Ok(name) => name,
            Err(e) => return self.invalid(msg, e.to_string()),
        };

        let priority = match msg.int_parameter("priority") {
            None => Priority::ADMINISTRATOR,
            Some(Ok(value)) => match Priority::new(value) {
                Ok(priority) => priority,
                Err(_) => {
                    return self.invalid(msg, "parameter \"priority\" is out of range (0 .. 99)");
                }
            },
            Some(Err(e)) => return self.invalid(msg, e),
        };

        let removed = self.apply_reset(&name, priority, Origin::Local);
        let mut reply =
            Message::reply_to(msg, commands::DELETED).with_parameter("name", name.as_str());
        if !removed {
            // still a positive reply so callers need no special casing
            reply = reply.with_parameter("message", "nothing was deleted");
        }
        self.send_to_bus(reply);
    }

    // === LIST ===============================================================

    fn msg_list(&mut self, msg: &Message) {
        let reply = Message::reply_to(msg, commands::OPTIONS)
            .with_parameter("options", self.schema.list_of_options());
        self.send_to_bus(reply);
    }

    // === LISTEN / FORGET ====================================================

    fn subscriber_of(msg: &Message) -> Option<Subscriber> {
        match (&msg.from_server, &msg.from_service) {
            (Some(server), Some(service)) if !server.is_empty() && !service.is_empty() => {
                Some(Subscriber::new(server, service))
            }
            _ => None,
        }
    }

    fn msg_listen(&mut self, msg: &Message) {
        let Some(subscriber) = Self::subscriber_of(msg) else {
            return self.invalid(msg, "message carries no sender to subscribe");
        };
        let Some(raw_names) = msg.parameter("names") else {
            return self.invalid(msg, "parameter \"names\" missing in message");
        };
        let raw_names: Vec<&str> = raw_names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if raw_names.is_empty() {
            return self.invalid(msg, "parameter \"names\" is empty");
        }

        // a name may be watched before it is defined, but it still has to
        // be well-formed; bad ones get an error notification below
        let mut names = Vec::new();
        let mut bad_names = Vec::new();
        for raw in raw_names {
            match SettingName::parse(raw) {
                Ok(name) => names.push(name),
                Err(_) => bad_names.push(raw.to_string()),
            }
        }

        let any_new = self.router.listen(&subscriber, &names);
        let mut reply = Message::reply_to(msg, commands::REGISTERED);
        if !any_new && bad_names.is_empty() {
            reply = reply.with_parameter("message", "already registered");
        }
        self.send_to_bus(reply);

        // each name answers with its current state right away
        let mut errors = 0u32;
        for name in &names {
            let update = self.value_update_for(name);
            if update.has_parameter("error") {
                errors += 1;
            }
            self.send_to_bus(
                update.with_destination(&subscriber.server, &subscriber.service),
            );
        }
        for raw in &bad_names {
            errors += 1;
            let update = Message::new(commands::VALUE_UPDATED)
                .with_parameter("name", raw.as_str())
                .with_parameter("error", "invalid setting name")
                .with_destination(&subscriber.server, &subscriber.service);
            self.send_to_bus(update);
        }

        let mut ready = Message::reply_to(msg, commands::READY);
        if errors > 0 {
            ready = ready.with_parameter("errcnt", errors.to_string());
        }
        self.send_to_bus(ready);
    }

    fn msg_forget(&mut self, msg: &Message) {
        let Some(subscriber) = Self::subscriber_of(msg) else {
            return self.invalid(msg, "message carries no sender to unsubscribe");
        };
        let Some(raw_names) = msg.parameter("names") else {
            return self.invalid(msg, "parameter \"names\" missing in message");
        };
        let names: Vec<SettingName> = raw_names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .filter_map(|n| SettingName::parse(n).ok())
            .collect();
        if names.is_empty() {
            return self.invalid(msg, "parameter \"names\" is empty");
        }

        let any_removed = self.router.forget(&subscriber, &names);
        let mut reply = Message::reply_to(msg, commands::FORGET);
        if !any_removed {
            reply = reply.with_parameter("message", "not listening");
        }
        self.send_to_bus(reply);
    }

    // === GOSSIP =============================================================

    fn msg_gossip(&mut self, msg: &Message) {
        let Some(remote) = msg.parameter("my_ip") else {
            return self.invalid(msg, "parameter \"my_ip\" missing in message");
        };
        let remote = remote.to_string();

        if self.handle_gossip_endpoint(&remote) == GossipDecision::Own {
            return;
        }

        // the reply completes the handshake: the other side runs the same
        // comparison on our endpoint and dials when it sorts lower
        let reply = Message::reply_to(msg, commands::CONNECTED)
            .with_parameter("my_ip", self.replicator.local_endpoint());
        self.send_to_bus(reply);
    }

    /// `CONNECTED` over the bus is the second half of the gossip
    /// handshake; no further reply, or the two daemons would ping-pong.
    fn msg_connected(&mut self, msg: &Message) {
        let Some(remote) = msg.parameter("my_ip") else {
            return self.invalid(msg, "parameter \"my_ip\" missing in message");
        };
        let remote = remote.to_string();
        self.handle_gossip_endpoint(&remote);
    }
}
