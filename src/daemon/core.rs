//! The daemon aggregate.
//!
//! `Daemon` owns every piece of mutable state: the store, the schema, the
//! subscription router, the replicator, and both timer deadlines. It is
//! owned by exactly one thread (the state loop) and never shared, so none
//! of its methods need locks.

use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::config::Config;
use crate::core::{GetResult, Lookup, Schema, SetResult, SettingName, SettingStore, persist};
use crate::daemon::net::{self, Event};
use crate::daemon::replicator::{GossipDecision, Replicator};
use crate::daemon::subscriptions::SubscriptionRouter;
use crate::proto::{Message, commands};

/// Where a mutation came from.
///
/// Only local mutations are forwarded to peers; tagging the origin
/// explicitly is what breaks replication loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

pub struct Daemon {
    pub(crate) config: Config,
    pub(crate) schema: Schema,
    pub(crate) store: SettingStore,
    pub(crate) router: SubscriptionRouter,
    pub(crate) replicator: Replicator,

    /// Handle for threads spawned from the state loop (peer dials).
    events_tx: Sender<Event>,
    /// Outbound bus handle; absent while the link is down.
    bus: Option<Sender<Message>>,

    save_at: Option<Instant>,
    gossip_at: Option<Instant>,
    dirty: bool,
    exit: Option<i32>,
}

impl Daemon {
    pub fn new(
        config: Config,
        schema: Schema,
        store: SettingStore,
        events_tx: Sender<Event>,
    ) -> Self {
        let replicator = Replicator::new(config.listen.clone());
        Self {
            config,
            schema,
            store,
            router: SubscriptionRouter::new(),
            replicator,
            events_tx,
            bus: None,
            save_at: None,
            gossip_at: None,
            dirty: false,
            exit: None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit
    }

    pub fn store(&self) -> &SettingStore {
        &self.store
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn request_exit(&mut self, code: i32) {
        if self.exit.is_none() {
            self.exit = Some(code);
        }
    }

    // === event dispatch =====================================================

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Bus(msg) => self.handle_bus_message(msg),
            Event::BusConnected(tx) => {
                tracing::info!("bus link established");
                self.bus = Some(tx);
            }
            Event::BusDown => {
                tracing::warn!("bus link lost; reconnecting in the background");
                self.bus = None;
            }
            Event::PeerConnected { endpoint, tx } => self.peer_connected(endpoint, tx),
            Event::PeerMessage { endpoint, msg } => self.handle_peer_message(&endpoint, msg),
            Event::PeerClosed { endpoint, error } => {
                tracing::info!(peer = %endpoint, error, "peer channel closed");
                self.replicator.disconnected(&endpoint);
            }
            Event::PeerDialFailed { endpoint } => {
                self.replicator.dial_failed(&endpoint);
            }
            Event::Shutdown => {
                tracing::info!("shutdown requested");
                self.request_exit(0);
            }
        }
    }

    // === timers =============================================================

    /// The next instant the state loop has to wake up at.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.save_at, self.gossip_at, self.replicator.next_retry_at()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire whatever deadlines have passed.
    pub fn on_tick(&mut self, now: Instant) {
        if self.save_at.is_some_and(|at| at <= now) {
            self.save_at = None;
            self.save_settings();
        }
        if self.gossip_at.is_some_and(|at| at <= now) {
            self.send_gossip();
        }
        self.start_due_dials(now);
    }

    pub(crate) fn start_due_dials(&mut self, now: Instant) {
        for endpoint in self.replicator.due_dials(now) {
            tracing::info!(peer = %endpoint, "dialing peer");
            net::connect_to_peer(
                endpoint,
                self.replicator.local_endpoint().to_string(),
                self.events_tx.clone(),
            );
        }
    }

    /// Flush the store to disk. Failures are logged; memory stays valid
    /// and the next mutation re-arms the timer.
    pub(crate) fn save_settings(&mut self) {
        match persist::save(&self.store, &self.config.settings) {
            Ok(()) => {
                self.dirty = false;
                tracing::debug!("settings saved to {}", self.config.settings.display());
            }
            Err(e) => {
                tracing::error!("saving settings failed: {e}");
            }
        }
    }

    /// Flush on the way out so an orderly shutdown never loses writes.
    pub fn final_save(&mut self) {
        if self.dirty {
            self.save_settings();
        }
    }

    /// Broadcast our listener endpoint and re-arm the gossip timer.
    pub(crate) fn send_gossip(&mut self) {
        let gossip = Message::new(commands::GOSSIP)
            .with_parameter("my_ip", self.replicator.local_endpoint());
        self.send_to_bus(gossip);
        self.gossip_at = Some(Instant::now() + Duration::from_secs(self.config.gossip_timeout));
    }

    pub(crate) fn send_to_bus(&self, msg: Message) {
        match &self.bus {
            Some(bus) => {
                if bus.send(msg).is_err() {
                    tracing::warn!("bus writer is gone; message dropped");
                }
            }
            None => {
                tracing::warn!(command = %msg.command, "bus link down; message dropped");
            }
        }
    }

    // === mutations ==========================================================

    /// Apply a write and fan out its consequences: arm the save timer,
    /// notify subscribers when the effective value changed, and forward
    /// local mutations to peers. Remote mutations never re-broadcast.
    pub(crate) fn apply_set(
        &mut self,
        name: &SettingName,
        text: &str,
        priority: crate::core::Priority,
        timestamp: crate::core::Timestamp,
        origin: Origin,
    ) -> SetResult {
        let before = self.effective_text(name);
        let result = self.store.set(&self.schema, name, text, priority, timestamp);
        if result.mutated() {
            self.after_mutation(name, before, origin);
        }
        result
    }

    /// Apply a reset with the same fan-out rules as [`Daemon::apply_set`].
    pub(crate) fn apply_reset(
        &mut self,
        name: &SettingName,
        priority: crate::core::Priority,
        origin: Origin,
    ) -> bool {
        let before = self.effective_text(name);
        let removed = self.store.reset(name, priority);
        if removed {
            self.after_mutation(name, before, origin);
        }
        removed
    }

    fn effective_text(&self, name: &SettingName) -> Option<String> {
        self.store.effective(name).map(|r| r.text.clone())
    }

    fn after_mutation(&mut self, name: &SettingName, before: Option<String>, origin: Origin) {
        self.dirty = true;
        self.save_at = Some(Instant::now() + Duration::from_secs(self.config.save_timeout));

        if before != self.effective_text(name) {
            self.notify_subscribers(name);
        }

        if origin == Origin::Local {
            let values = self.store.serialize(name).unwrap_or_default();
            let changed = Message::new(commands::VALUE_CHANGED)
                .with_parameter("name", name.as_str())
                .with_parameter("values", values);
            self.replicator.broadcast(&changed);
        }
    }

    /// Send a `VALUE_UPDATED` to everyone watching `name`.
    fn notify_subscribers(&self, name: &SettingName) {
        let update = self.value_update_for(name);
        for subscriber in self.router.subscribers(name) {
            let msg = update
                .clone()
                .with_destination(&subscriber.server, &subscriber.service);
            self.send_to_bus(msg);
        }
    }

    /// The `VALUE_UPDATED` payload for the current state of `name`.
    pub(crate) fn value_update_for(&self, name: &SettingName) -> Message {
        let update = Message::new(commands::VALUE_UPDATED).with_parameter("name", name.as_str());
        match self.store.get(&self.schema, name, Lookup::Highest) {
            GetResult::Success(value) | GetResult::Default(value) => {
                update.with_parameter("value", value)
            }
            GetResult::NotSet => update.with_parameter("error", "value undefined"),
            GetResult::Unknown => update.with_parameter("error", "undefined setting"),
            GetResult::PriorityNotFound | GetResult::Error(_) => {
                update.with_parameter("error", "value unavailable")
            }
        }
    }

    // === replication ========================================================

    fn peer_connected(&mut self, endpoint: String, tx: Sender<Message>) {
        tracing::info!(peer = %endpoint, "peer channel established");
        self.replicator.connected(&endpoint, tx);

        // anti-entropy: stream our whole state so the other side catches
        // up; the exchange is symmetric because both ends do this
        let snapshot: Vec<Message> = self
            .store
            .names()
            .filter_map(|name| {
                self.store.serialize(name).map(|values| {
                    Message::new(commands::VALUE_CHANGED)
                        .with_parameter("name", name.as_str())
                        .with_parameter("values", values)
                })
            })
            .collect();

        if let Some(tx) = self.replicator.peer_tx(&endpoint) {
            for msg in snapshot {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        }
    }

    fn handle_peer_message(&mut self, endpoint: &str, msg: Message) {
        if msg.command != commands::VALUE_CHANGED {
            tracing::warn!(
                peer = %endpoint,
                command = %msg.command,
                "unexpected command on a peer channel"
            );
            return;
        }

        let (Some(name), Some(values)) = (msg.parameter("name"), msg.parameter("values")) else {
            tracing::warn!(peer = %endpoint, "VALUE_CHANGED is missing name or values");
            return;
        };
        let name = match SettingName::parse(name) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(peer = %endpoint, "VALUE_CHANGED with bad name: {e}");
                return;
            }
        };

        self.apply_remote_change(&name, values);
    }

    /// Ingest one serialized record blob from a peer.
    pub(crate) fn apply_remote_change(&mut self, name: &SettingName, values: &str) {
        let before = self.effective_text(name);
        let results = self.store.deserialize(&self.schema, name, values);
        if results.iter().any(SetResult::mutated) {
            self.after_mutation(name, before, Origin::Remote);
        }
    }

    /// React to a gossiped endpoint, ours or a peer's.
    pub(crate) fn handle_gossip_endpoint(&mut self, remote: &str) -> GossipDecision {
        let decision = self.replicator.handle_gossip(remote);
        if decision == GossipDecision::Dial {
            self.start_due_dials(Instant::now());
        }
        decision
    }
}
