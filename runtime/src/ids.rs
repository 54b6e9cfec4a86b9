//! Strongly-typed identifiers.
//!
//! Pod sandboxes and containers are identified by UUID strings on the wire.
//! Wrapping them distinguishes a pod ID from a container ID at compile time,
//! the way [`crate::names`] distinguishes unit names from plain strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

    };
}

uuid_id!(PodId);
uuid_id!(ContainerId);
uuid_id!(SessionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_id_round_trips_through_display_and_parse() {
        let id = PodId::new();
        let parsed: PodId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn distinct_ids_are_distinct() {
        assert_ne!(PodId::new(), PodId::new());
        assert_ne!(ContainerId::new(), ContainerId::new());
    }

    #[test]
    fn rejects_malformed_uuid() {
        assert!("not-a-uuid".parse::<PodId>().is_err());
    }
}
