//! The settings engine: names, priorities, timestamps, records, schema
//! binding, the store itself, and its persistence file.

pub mod name;
pub mod persist;
pub mod priority;
pub mod schema;
pub mod store;
pub mod timestamp;
pub mod value;

use thiserror::Error;

pub use name::SettingName;
pub use priority::{Lookup, Priority};
pub use schema::{Schema, SchemaEntry, Validator};
pub use store::{GetResult, SetResult, SettingStore};
pub use timestamp::Timestamp;
pub use value::ValueRecord;

/// Validation errors for the small core identity types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid setting name {raw:?}: {reason}")]
    InvalidName { raw: String, reason: String },

    #[error("priority {value} is out of range (0 to 99)")]
    PriorityOutOfRange { value: i64 },

    #[error("timestamp {nanos} predates the fluid-settings epoch")]
    TimestampBeforeEpoch { nanos: i64 },
}
