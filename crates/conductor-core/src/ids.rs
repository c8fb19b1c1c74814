//! Identifier newtypes for every persisted entity.
//!
//! Requests use an opaque string id (prefix + random suffix); everything else
//! is a monotonic integer assigned by the Store on insert.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Opaque identifier for a [`crate::request::Request`], e.g. `req-a1b2c3d4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh id with the given prefix (default `req`).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req-{}", short_uuid()))
    }

    /// Parse a request id from caller-provided input (command surface boundary).
    ///
    /// Rejects empty strings and anything containing characters that would be
    /// unsafe to embed in a log line or SQL parameter placeholder key.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_input("request id must not be empty"));
        }
        if trimmed.len() > 128 {
            return Err(Error::invalid_input("request id too long"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::invalid_input(
                "request id may only contain alphanumerics, '-' and '_'",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a short hex suffix from a real v4 UUID rather than a timestamp,
/// so two requests created in the same process tick never collide.
fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4();
    id.simple().to_string()[..12].to_string()
}

macro_rules! int_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(i64);

        impl $name {
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

int_id!(TaskId, "Monotonic identifier for a [`crate::task::Task`].");
int_id!(
    WorkerId,
    "Numeric slot identifier for a [`crate::worker::Worker`], 1..=max_workers."
);
int_id!(MailId, "Monotonic identifier for a mail row.");
int_id!(
    MergeQueueEntryId,
    "Monotonic identifier for a [`crate::merge_queue::MergeQueueEntry`]."
);
int_id!(ActivityLogId, "Monotonic identifier for an activity log row.");

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn request_id_generate_is_unique_and_prefixed() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req-"));
    }

    #[test]
    fn request_id_parse_rejects_empty_and_unsafe() {
        assert!(RequestId::parse("").is_err());
        assert!(RequestId::parse("  ").is_err());
        assert!(RequestId::parse("req; drop table").is_err());
        assert!(RequestId::parse("req-abc123").is_ok());
    }

    #[test]
    fn int_id_roundtrips() {
        let id = TaskId::from(42);
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }
}
