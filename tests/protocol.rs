//! End-to-end protocol scenarios against an in-process daemon.
//!
//! The fixture wires the daemon's bus side to plain channels: requests go
//! in through the state-loop entry points, replies and notifications come
//! out of the captured bus sender.

use std::fs;
use std::time::Duration;

use crossbeam::channel::{Receiver, unbounded};
use tempfile::TempDir;

use fluid_settings::config::Config;
use fluid_settings::daemon::{Daemon, Event};
use fluid_settings::proto::{Message, commands};
use fluid_settings::{Schema, SettingStore, Timestamp};

struct Fixture {
    daemon: Daemon,
    bus_rx: Receiver<Message>,
    dir: TempDir,
    _events_rx: Receiver<Event>,
}

const DEFINITIONS: &str = "\
[svc::port]
default=8080
validator=integer
help=TCP port the service listens on.

[svc::a]
help=A free-form setting.
";

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("defs.ini"), DEFINITIONS).unwrap();

        let mut config = Config::default();
        config.settings = dir.path().join("settings.conf");
        config.definitions = dir.path().display().to_string();
        config.save_timeout = 1;

        let schema = Schema::load(&config.definitions);
        let (events_tx, events_rx) = unbounded();
        let mut daemon = Daemon::new(config, schema, SettingStore::new(), events_tx);

        let (bus_tx, bus_rx) = unbounded();
        daemon.handle_event(Event::BusConnected(bus_tx));

        Self {
            daemon,
            bus_rx,
            dir,
            _events_rx: events_rx,
        }
    }

    /// Feed one request and collect everything the daemon sent out.
    fn request(&mut self, msg: Message) -> Vec<Message> {
        self.daemon.handle_bus_message(msg);
        self.drain()
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.bus_rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

fn from_client(mut msg: Message, server: &str, service: &str) -> Message {
    msg.from_server = Some(server.to_string());
    msg.from_service = Some(service.to_string());
    msg.transaction_id = Some(format!("tx-{server}-{service}"));
    msg
}

fn ts(offset: i64) -> i64 {
    Timestamp::EPOCH.as_nanos() + offset
}

#[test]
fn default_then_override() {
    let mut fixture = Fixture::new();

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::port"),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, commands::DEFAULT_VALUE);
    assert_eq!(replies[0].parameter("value"), Some("8080"));
    assert_eq!(replies[0].server.as_deref(), Some("host1"));
    assert_eq!(replies[0].transaction_id.as_deref(), Some("tx-host1-cli"));

    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::port")
            .with_parameter("value", "9090")
            .with_parameter("priority", "50")
            .with_parameter("timestamp", ts(1).to_string()),
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command, commands::UPDATED);
    assert_eq!(replies[0].parameter("reason"), Some("new"));

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::port"),
    );
    assert_eq!(replies[0].command, commands::VALUE);
    assert_eq!(replies[0].parameter("value"), Some("9090"));
}

#[test]
fn last_writer_wins_on_same_priority() {
    let mut fixture = Fixture::new();

    let put = |value: &str, stamp: i64| {
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("value", value)
            .with_parameter("priority", "50")
            .with_parameter("timestamp", stamp.to_string())
    };

    let replies = fixture.request(put("x", ts(100)));
    assert_eq!(replies[0].parameter("reason"), Some("new"));

    // an older write arrives late and is ignored
    let replies = fixture.request(put("y", ts(50)));
    assert_eq!(replies[0].command, commands::UPDATED);
    assert_eq!(replies[0].parameter("reason"), Some("unchanged"));

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli").with_parameter("name", "svc::a"),
    );
    assert_eq!(replies[0].parameter("value"), Some("x"));
}

#[test]
fn priority_layering_and_delete() {
    let mut fixture = Fixture::new();

    fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "admin")
            .with_parameter("priority", "50")
            .with_parameter("timestamp", ts(1).to_string()),
    );
    fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "forced")
            .with_parameter("priority", "60")
            .with_parameter("timestamp", ts(2).to_string()),
    );

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli").with_parameter("name", "svc::a"),
    );
    assert_eq!(replies[0].parameter("value"), Some("forced"));

    let replies = fixture.request(
        from_client(Message::new(commands::DELETE), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("priority", "60"),
    );
    assert_eq!(replies[0].command, commands::DELETED);
    assert!(!replies[0].has_parameter("message"));

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli").with_parameter("name", "svc::a"),
    );
    assert_eq!(replies[0].parameter("value"), Some("admin"));

    // deleting an empty slot still answers DELETED, with a note
    let replies = fixture.request(
        from_client(Message::new(commands::DELETE), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("priority", "60"),
    );
    assert_eq!(replies[0].command, commands::DELETED);
    assert_eq!(replies[0].parameter("message"), Some("nothing was deleted"));
}

#[test]
fn validator_refusal_is_invalid_and_state_is_untouched() {
    let mut fixture = Fixture::new();

    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::port")
            .with_parameter("value", "abc")
            .with_parameter("priority", "50"),
    );
    assert_eq!(replies[0].command, commands::INVALID);
    assert_eq!(replies[0].parameter("command"), Some(commands::PUT));
    assert!(replies[0].parameter("message").unwrap().contains("failed"));

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::port"),
    );
    assert_eq!(replies[0].command, commands::DEFAULT_VALUE);
}

#[test]
fn get_modifiers_are_mutually_exclusive() {
    let mut fixture = Fixture::new();

    for (a, b) in [("all", "priority"), ("all", "default"), ("default", "priority")] {
        let mut msg = from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::port");
        msg = msg.with_parameter(a, "true");
        msg = if b == "priority" {
            msg.with_parameter("priority", "50")
        } else {
            msg.with_parameter(b, "true")
        };
        let replies = fixture.request(msg);
        assert_eq!(replies[0].command, commands::INVALID, "{a}+{b}");
        assert!(
            replies[0]
                .parameter("message")
                .unwrap()
                .contains("mutually exclusive")
        );
    }

    // the highest-priority sentinel does not count as a modifier
    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::port")
            .with_parameter("all", "true")
            .with_parameter("priority", "-1"),
    );
    assert_eq!(replies[0].command, commands::DEFAULT_VALUE);
}

#[test]
fn out_of_range_priorities_are_invalid() {
    let mut fixture = Fixture::new();

    for command in [commands::PUT, commands::DELETE] {
        for priority in ["-1", "100"] {
            let mut msg = from_client(Message::new(command), "host1", "cli")
                .with_parameter("name", "svc::a")
                .with_parameter("priority", priority);
            if command == commands::PUT {
                msg = msg.with_parameter("value", "x");
            }
            let replies = fixture.request(msg);
            assert_eq!(replies[0].command, commands::INVALID, "{command} {priority}");
            assert!(
                replies[0]
                    .parameter("message")
                    .unwrap()
                    .contains("out of range")
            );
        }
    }
}

#[test]
fn unknown_setting_round_trip() {
    let mut fixture = Fixture::new();

    let replies = fixture.request(
        from_client(Message::new(commands::GET), "host1", "cli")
            .with_parameter("name", "svc::mystery"),
    );
    assert_eq!(replies[0].command, commands::INVALID);

    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::mystery")
            .with_parameter("value", "x"),
    );
    assert_eq!(replies[0].command, commands::INVALID);
}

#[test]
fn list_returns_the_catalogue() {
    let mut fixture = Fixture::new();
    let replies = fixture.request(from_client(Message::new(commands::LIST), "host1", "cli"));
    assert_eq!(replies[0].command, commands::OPTIONS);
    assert_eq!(replies[0].parameter("options"), Some("svc::a,svc::port"));
}

#[test]
fn subscription_lifecycle() {
    let mut fixture = Fixture::new();

    // two subscribers sign up for the same setting
    for (server, service) in [("host1", "s1"), ("host2", "s2")] {
        let replies = fixture.request(
            from_client(Message::new(commands::LISTEN), server, service)
                .with_parameter("names", "svc::a"),
        );
        assert_eq!(replies[0].command, commands::REGISTERED);
        assert!(!replies[0].has_parameter("message"));
        // the initial state arrives before READY; svc::a is unset
        assert_eq!(replies[1].command, commands::VALUE_UPDATED);
        assert_eq!(replies[1].parameter("error"), Some("value undefined"));
        assert_eq!(replies[2].command, commands::READY);
        assert_eq!(replies[2].parameter("errcnt"), Some("1"));
    }

    // re-listening is idempotent
    let replies = fixture.request(
        from_client(Message::new(commands::LISTEN), "host1", "s1")
            .with_parameter("names", "svc::a"),
    );
    assert_eq!(replies[0].command, commands::REGISTERED);
    assert_eq!(replies[0].parameter("message"), Some("already registered"));

    // a write notifies both subscribers exactly once
    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host3", "writer")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "v")
            .with_parameter("timestamp", ts(10).to_string()),
    );
    let updates: Vec<&Message> = replies
        .iter()
        .filter(|m| m.command == commands::VALUE_UPDATED)
        .collect();
    assert_eq!(updates.len(), 2);
    for update in &updates {
        assert_eq!(update.parameter("value"), Some("v"));
    }
    let mut destinations: Vec<&str> = updates.iter().filter_map(|m| m.service.as_deref()).collect();
    destinations.sort();
    assert_eq!(destinations, ["s1", "s2"]);

    // s1 bows out; the next write only reaches s2
    let replies = fixture.request(
        from_client(Message::new(commands::FORGET_REQUEST), "host1", "s1")
            .with_parameter("names", "svc::a"),
    );
    assert_eq!(replies[0].command, commands::FORGET);
    assert!(!replies[0].has_parameter("message"));

    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host3", "writer")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "w")
            .with_parameter("timestamp", ts(20).to_string()),
    );
    let updates: Vec<&Message> = replies
        .iter()
        .filter(|m| m.command == commands::VALUE_UPDATED)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].service.as_deref(), Some("s2"));

    // forgetting something never watched is still a positive reply
    let replies = fixture.request(
        from_client(Message::new(commands::FORGET_REQUEST), "host1", "s1")
            .with_parameter("names", "svc::a"),
    );
    assert_eq!(replies[0].command, commands::FORGET);
    assert_eq!(replies[0].parameter("message"), Some("not listening"));
}

#[test]
fn empty_names_are_invalid() {
    let mut fixture = Fixture::new();
    for command in [commands::LISTEN, commands::FORGET_REQUEST] {
        let replies = fixture.request(
            from_client(Message::new(command), "host1", "s1").with_parameter("names", " , ,"),
        );
        assert_eq!(replies[0].command, commands::INVALID, "{command}");
    }
}

#[test]
fn unchanged_writes_do_not_notify() {
    let mut fixture = Fixture::new();

    fixture.request(
        from_client(Message::new(commands::LISTEN), "host1", "s1")
            .with_parameter("names", "svc::a"),
    );
    fixture.request(
        from_client(Message::new(commands::PUT), "host2", "w")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "v")
            .with_parameter("timestamp", ts(10).to_string()),
    );

    // a lower-priority write that does not change the effective value
    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host2", "w")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "shadowed")
            .with_parameter("priority", "10")
            .with_parameter("timestamp", ts(11).to_string()),
    );
    assert_eq!(replies[0].command, commands::UPDATED);
    assert!(
        !replies.iter().any(|m| m.command == commands::VALUE_UPDATED),
        "effective value did not change"
    );
}

#[test]
fn save_timer_coalesces_and_writes_the_file() {
    let mut fixture = Fixture::new();
    let settings = fixture.dir.path().join("settings.conf");

    fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "persisted")
            .with_parameter("timestamp", ts(1).to_string()),
    );
    assert!(!settings.exists(), "save is deferred");

    let deadline = fixture.daemon.next_deadline().expect("save timer armed");
    fixture.daemon.on_tick(deadline + Duration::from_millis(1));

    let contents = fs::read_to_string(&settings).unwrap();
    assert!(contents.contains("svc::a::50"));
    assert!(contents.contains("persisted"));
}

#[test]
fn bus_ready_triggers_the_first_gossip() {
    let mut fixture = Fixture::new();

    fixture.daemon.handle_bus_message(Message::new(commands::BUS_READY));
    let out = fixture.drain();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].command, commands::GOSSIP);
    assert_eq!(out[0].parameter("my_ip"), Some("127.0.0.1:4051"));

    // and the periodic timer is armed
    assert!(fixture.daemon.next_deadline().is_some());
}

#[test]
fn gossip_handshake_replies_connected() {
    let mut fixture = Fixture::new();

    // local 127.0.0.1:4051 sorts below the remote; we dial AND reply
    let replies = fixture.request(
        from_client(Message::new(commands::GOSSIP), "host9", "fluid_settings")
            .with_parameter("my_ip", "127.0.0.2:4051"),
    );
    assert_eq!(replies[0].command, commands::CONNECTED);
    assert_eq!(replies[0].parameter("my_ip"), Some("127.0.0.1:4051"));

    // our own broadcast coming back is ignored
    let replies = fixture.request(
        from_client(Message::new(commands::GOSSIP), "host1", "fluid_settings")
            .with_parameter("my_ip", "127.0.0.1:4051"),
    );
    assert!(replies.is_empty());
}

#[test]
fn timestamps_before_the_epoch_are_invalid() {
    let mut fixture = Fixture::new();
    let before = Timestamp::EPOCH.as_nanos() - 1;

    let replies = fixture.request(
        from_client(Message::new(commands::PUT), "host1", "cli")
            .with_parameter("name", "svc::a")
            .with_parameter("value", "x")
            .with_parameter("timestamp", before.to_string()),
    );
    assert_eq!(replies[0].command, commands::INVALID);
    assert!(replies[0].parameter("message").unwrap().contains("epoch"));
}
