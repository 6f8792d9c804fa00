//! Write timestamps.
//!
//! Every record carries the wall-clock time it was written, at nanosecond
//! resolution. Timestamps are caller-authoritative: the service preserves
//! them as received and only refuses values that predate the project epoch
//! (2022-07-21 UTC), which no honest clock can produce.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::CoreError;

/// Nanoseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Timestamp(i64);

impl Timestamp {
    /// 2022-07-21T00:00:00Z, the earliest timestamp any record may carry.
    pub const EPOCH: Timestamp = Timestamp(1_658_361_600 * 1_000_000_000);

    pub fn from_nanos(nanos: i64) -> Result<Self, CoreError> {
        if nanos < Self::EPOCH.0 {
            return Err(CoreError::TimestampBeforeEpoch { nanos });
        }
        Ok(Self(nanos))
    }

    /// Current wall time.
    ///
    /// Falls back to the epoch if the system clock reports a time before
    /// 1970, which only happens on a badly broken host.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(Self::EPOCH.0);
        Self(nanos.max(Self::EPOCH.0))
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = CoreError;

    fn try_from(nanos: i64) -> Result<Self, Self::Error> {
        Timestamp::from_nanos(nanos)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> i64 {
        ts.0
    }
}
