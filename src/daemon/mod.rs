//! The fluid-settings daemon.
//!
//! One state thread owns the store and everything around it; socket
//! threads feed it events. See [`server::run_state_loop`] for the
//! serialization point and [`run::run_daemon`] for the bootstrap.

pub mod core;
pub mod messenger;
pub mod net;
pub mod replicator;
pub mod run;
pub mod server;
pub mod subscriptions;

pub use core::{Daemon, Origin};
pub use net::{Event, SERVICE_NAME};
pub use replicator::{GossipDecision, Replicator};
pub use run::run_daemon;
pub use server::run_state_loop;
pub use subscriptions::{Subscriber, SubscriptionRouter};
