//! Setting name identity.
//!
//! A setting name is a dotted path `<namespace>::...::<leaf>` where every
//! segment matches `[A-Za-z_][A-Za-z0-9_]*`. Dashes are folded to
//! underscores once, on input; the canonical form is kept everywhere after
//! that so lookups never have to re-normalise.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CoreError;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SettingName(String);

impl SettingName {
    pub const SEPARATOR: &'static str = "::";

    /// Parse and canonicalise a setting name.
    ///
    /// Dashes become underscores before validation, so `svc::tcp-port` and
    /// `svc::tcp_port` are the same setting.
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw: String = s.into();
        let canonical = raw.replace('-', "_");

        if canonical.is_empty() {
            return Err(CoreError::InvalidName {
                raw,
                reason: "empty".into(),
            });
        }

        let segments: Vec<&str> = canonical.split(Self::SEPARATOR).collect();
        if segments.len() < 2 {
            return Err(CoreError::InvalidName {
                raw,
                reason: "expected at least one namespace and a leaf (a::b)".into(),
            });
        }

        for segment in &segments {
            if !valid_segment(segment) {
                return Err(CoreError::InvalidName {
                    raw,
                    reason: format!("invalid segment {segment:?}"),
                });
            }
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment.
    pub fn leaf(&self) -> &str {
        self.0
            .rsplit_once(Self::SEPARATOR)
            .map(|(_, leaf)| leaf)
            .unwrap_or(&self.0)
    }
}

fn valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Debug for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SettingName({:?})", self.0)
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SettingName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        SettingName::parse(s)
    }
}

impl From<SettingName> for String {
    fn from(name: SettingName) -> String {
        name.0
    }
}
