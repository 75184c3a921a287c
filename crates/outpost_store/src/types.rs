//! Typed identifiers and timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type used throughout the store.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a user.
    UserId
}

uuid_id! {
    /// Unique identifier for an application session.
    SessionId
}

uuid_id! {
    /// Unique identifier for a question record.
    QuestionId
}

uuid_id! {
    /// Unique identifier for an answer record.
    AnswerId
}

uuid_id! {
    /// Unique identifier for a usage event.
    EventId
}

uuid_id! {
    /// Unique identifier for an outbox unit.
    UnitId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn id_display_roundtrip() {
        let id = UserId::new();
        let text = id.to_string();
        let parsed: Uuid = text.parse().unwrap();
        assert_eq!(UserId::from_uuid(parsed), id);
    }

    #[test]
    fn id_serde_is_transparent() {
        let id = QuestionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: QuestionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
