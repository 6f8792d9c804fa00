//! Peer replication state.
//!
//! The replicator tracks every other fluid-settings daemon we know about:
//! whether we are the side that dials (the lexicographically smaller
//! `host:port` dials the greater), the outbound handle once a channel is
//! up, and a consecutive-failure counter that parks a peer after too many
//! errors until a later gossip rediscovers it.
//!
//! All I/O lives in [`crate::daemon::net`]; this module is pure state and
//! is driven entirely by the state loop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::proto::Message;

/// Failures in a row before we stop dialing a peer.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;
/// Pause between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipDecision {
    /// Our endpoint sorts lower: we dial them.
    Dial,
    /// Their endpoint sorts lower: they dial us.
    ExpectConnect,
    /// Our own broadcast came back.
    Own,
}

struct Peer {
    tx: Option<Sender<Message>>,
    /// We are the dialing side for this peer.
    dial: bool,
    dialing: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Peer {
    fn parked(&self) -> bool {
        self.failures >= MAX_CONSECUTIVE_FAILURES
    }
}

pub struct Replicator {
    local: String,
    peers: BTreeMap<String, Peer>,
}

impl Replicator {
    pub fn new(local_endpoint: impl Into<String>) -> Self {
        Self {
            local: local_endpoint.into(),
            peers: BTreeMap::new(),
        }
    }

    pub fn local_endpoint(&self) -> &str {
        &self.local
    }

    /// Process a gossiped endpoint and decide who connects to whom.
    ///
    /// A gossip also revives a parked peer: the failure counter restarts.
    pub fn handle_gossip(&mut self, remote: &str) -> GossipDecision {
        if remote == self.local {
            return GossipDecision::Own;
        }

        let dial = self.local.as_str() < remote;
        let peer = self.peers.entry(remote.to_string()).or_insert(Peer {
            tx: None,
            dial,
            dialing: false,
            failures: 0,
            retry_at: None,
        });
        peer.dial = dial;
        if peer.parked() {
            tracing::info!(peer = remote, "gossip revived a parked peer");
            peer.failures = 0;
            peer.retry_at = None;
        }

        if dial {
            GossipDecision::Dial
        } else {
            GossipDecision::ExpectConnect
        }
    }

    /// Endpoints we should be dialing right now.
    pub fn due_dials(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for (endpoint, peer) in &mut self.peers {
            let waiting = peer.retry_at.is_some_and(|at| at > now);
            if peer.dial && !peer.dialing && !peer.parked() && peer.tx.is_none() && !waiting {
                peer.dialing = true;
                due.push(endpoint.clone());
            }
        }
        due
    }

    /// The soonest pending reconnection, for the state loop's deadline.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter(|p| p.dial && !p.dialing && !p.parked() && p.tx.is_none())
            .filter_map(|p| p.retry_at)
            .min()
    }

    /// A channel to `endpoint` is up (either direction). Resets failures.
    pub fn connected(&mut self, endpoint: &str, tx: Sender<Message>) {
        let peer = self.peers.entry(endpoint.to_string()).or_insert(Peer {
            tx: None,
            dial: self.local.as_str() < endpoint,
            dialing: false,
            failures: 0,
            retry_at: None,
        });
        peer.tx = Some(tx);
        peer.dialing = false;
        peer.failures = 0;
        peer.retry_at = None;
    }

    /// The channel to `endpoint` is gone. Errors, hang-ups, and failed
    /// dials all count against the peer; the tenth consecutive one parks
    /// it until a later gossip.
    pub fn disconnected(&mut self, endpoint: &str) {
        let Some(peer) = self.peers.get_mut(endpoint) else {
            return;
        };
        peer.tx = None;
        peer.dialing = false;
        peer.failures += 1;
        if peer.parked() {
            tracing::warn!(
                peer = endpoint,
                failures = peer.failures,
                "peer parked until the next gossip"
            );
            peer.retry_at = None;
            return;
        }
        if peer.dial {
            peer.retry_at = Some(Instant::now() + RECONNECT_DELAY);
        }
    }

    /// A dial attempt never produced a connection.
    pub fn dial_failed(&mut self, endpoint: &str) {
        self.disconnected(endpoint);
    }

    /// Send a message to every connected peer. A send failure only logs;
    /// the reader side of the channel reports the loss separately.
    pub fn broadcast(&self, msg: &Message) {
        for (endpoint, peer) in &self.peers {
            if let Some(tx) = &peer.tx
                && tx.send(msg.clone()).is_err()
            {
                tracing::warn!(peer = endpoint, "dropping message for disconnected peer");
            }
        }
    }

    /// Outbound handle for one peer, used for the anti-entropy snapshot.
    pub fn peer_tx(&self, endpoint: &str) -> Option<&Sender<Message>> {
        self.peers.get(endpoint).and_then(|p| p.tx.as_ref())
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.tx.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn smaller_endpoint_dials() {
        let mut replicator = Replicator::new("10.0.0.1:4051");
        assert_eq!(
            replicator.handle_gossip("10.0.0.2:4051"),
            GossipDecision::Dial
        );
        assert_eq!(
            replicator.handle_gossip("10.0.0.0:4051"),
            GossipDecision::ExpectConnect
        );
        assert_eq!(
            replicator.handle_gossip("10.0.0.1:4051"),
            GossipDecision::Own
        );
    }

    #[test]
    fn due_dials_fire_once_per_attempt() {
        let mut replicator = Replicator::new("a:1");
        replicator.handle_gossip("b:1");

        let now = Instant::now();
        assert_eq!(replicator.due_dials(now), vec!["b:1".to_string()]);
        assert!(replicator.due_dials(now).is_empty(), "already dialing");
    }

    #[test]
    fn tenth_failure_parks_until_gossip() {
        let mut replicator = Replicator::new("a:1");
        replicator.handle_gossip("b:1");

        for attempt in 0..MAX_CONSECUTIVE_FAILURES {
            // walk past the reconnect delay of the previous failure
            let later = Instant::now() + RECONNECT_DELAY * 2;
            assert_eq!(
                replicator.due_dials(later),
                vec!["b:1".to_string()],
                "attempt {attempt}"
            );
            replicator.dial_failed("b:1");
        }

        let later = Instant::now() + RECONNECT_DELAY * 2;
        assert!(replicator.due_dials(later).is_empty(), "peer is parked");
        assert!(replicator.next_retry_at().is_none());

        // gossip revives it
        replicator.handle_gossip("b:1");
        assert_eq!(replicator.due_dials(later), vec!["b:1".to_string()]);
    }

    #[test]
    fn connect_resets_failures() {
        let mut replicator = Replicator::new("a:1");
        replicator.handle_gossip("b:1");
        let now = Instant::now();
        for endpoint in replicator.due_dials(now) {
            replicator.dial_failed(&endpoint);
        }

        let (tx, _rx) = unbounded();
        replicator.connected("b:1", tx);
        assert_eq!(replicator.connected_count(), 1);

        // a later hang-up is one fresh failure: retry, not parking
        replicator.disconnected("b:1");
        assert_eq!(replicator.connected_count(), 0);
        assert!(replicator.next_retry_at().is_some());
    }

    #[test]
    fn broadcast_reaches_connected_peers() {
        let mut replicator = Replicator::new("a:1");
        let (tx_b, rx_b) = unbounded();
        let (tx_c, rx_c) = unbounded();
        replicator.connected("b:1", tx_b);
        replicator.connected("c:1", tx_c);

        replicator.broadcast(&Message::new("VALUE_CHANGED"));
        assert_eq!(rx_b.len(), 1);
        assert_eq!(rx_c.len(), 1);
    }
}
