#![forbid(unsafe_code)]

//! Fluid Settings: a small distributed configuration service.
//!
//! Services obtain their tunable parameters from the daemon instead of
//! local files, subscribe to changes, and react in near real time.
//! Multiple daemons in a cluster discover each other through gossip and
//! converge via last-writer-wins replication.

pub mod client;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod proto;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the engine types most callers need.
pub use crate::core::{
    GetResult, Lookup, Priority, Schema, SchemaEntry, SetResult, SettingName, SettingStore,
    Timestamp, ValueRecord,
};
