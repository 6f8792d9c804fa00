//! Write priorities.
//!
//! Priorities partition values into bands: `0` holds service defaults,
//! `1..=49` app-supplied overrides, `50` the administrator default, and
//! `51..=99` forced overrides. Readers may additionally ask for "whatever
//! is highest" through [`Lookup::Highest`]; that sentinel is never stored.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CoreError;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    pub const MINIMUM: Priority = Priority(0);
    pub const MAXIMUM: Priority = Priority(99);

    /// Service defaults band.
    pub const DEFAULTS: Priority = Priority(0);
    /// The band an administrator edit lands in when no priority is given.
    pub const ADMINISTRATOR: Priority = Priority(50);

    pub fn new(value: i64) -> Result<Self, CoreError> {
        if !(Self::MINIMUM.0 as i64..=Self::MAXIMUM.0 as i64).contains(&value) {
            return Err(CoreError::PriorityOutOfRange { value });
        }
        Ok(Self(value as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for Priority {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> i64 {
        priority.0 as i64
    }
}

/// What a reader asks for.
///
/// `Highest` is the wire sentinel `-1`: return the record at the greatest
/// stored priority. It is accepted from readers only; writes always carry a
/// concrete [`Priority`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Highest,
    At(Priority),
}

impl Lookup {
    pub const HIGHEST_SENTINEL: i64 = -1;

    pub fn from_wire(value: i64) -> Result<Self, CoreError> {
        if value == Self::HIGHEST_SENTINEL {
            return Ok(Lookup::Highest);
        }
        Ok(Lookup::At(Priority::new(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert!(Priority::new(0).is_ok());
        assert!(Priority::new(50).is_ok());
        assert!(Priority::new(99).is_ok());
        assert!(Priority::new(-1).is_err());
        assert!(Priority::new(100).is_err());
    }

    #[test]
    fn lookup_accepts_sentinel() {
        assert_eq!(Lookup::from_wire(-1).unwrap(), Lookup::Highest);
        assert_eq!(
            Lookup::from_wire(50).unwrap(),
            Lookup::At(Priority::ADMINISTRATOR)
        );
        assert!(Lookup::from_wire(-2).is_err());
        assert!(Lookup::from_wire(100).is_err());
    }

    #[test]
    fn serde_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("100").is_err());
        let p: Priority = serde_json::from_str("99").unwrap();
        assert_eq!(p, Priority::MAXIMUM);
    }
}
