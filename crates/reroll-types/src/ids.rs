//! Type-safe identifier wrappers.
//!
//! Participants and God Packs are keyed by identifiers that originate
//! outside the engine (a chat account id, the id of the discovery message),
//! so they wrap a plain `u64`. Identifiers the engine mints itself use
//! UUID v7 (time-ordered).

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

/// Generates a newtype wrapper around an externally assigned `u64`.
macro_rules! define_external_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub u64);

        impl $name {
            /// Wrap a raw external value.
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Return the raw external value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl core::str::FromStr for $name {
            type Err = core::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self)
            }
        }
    };
}

define_external_id! {
    /// Stable external account id of a participant (immutable).
    ParticipantId
}

define_external_id! {
    /// Candidate God Pack id, derived from the discovery event.
    GodPackId
}

define_id! {
    /// Unique identifier for an emitted notification.
    EventId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_ids_parse_from_text() {
        let id: Result<ParticipantId, _> = " 123456789012345678 ".parse();
        assert_eq!(id.ok(), Some(ParticipantId(123_456_789_012_345_678)));

        let bad: Result<GodPackId, _> = "not-a-number".parse();
        assert!(bad.is_err());
    }

    #[test]
    fn external_id_serializes_as_number() {
        let json = serde_json::to_string(&GodPackId(42)).ok();
        assert_eq!(json.as_deref(), Some("42"));
    }

    #[test]
    fn event_ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
        assert_ne!(a.into_inner(), Uuid::nil());
    }
}
