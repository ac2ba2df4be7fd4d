//! Opaque identifiers for containers and overlay triples.
//!
//! A [`ContainerId`] is assigned once at `run` time and never changes
//! across `stop`/`start` cycles — the live PID becomes a mutable field of
//! the record instead of the record's key. An [`OverlayId`] is a UUID
//! instead of a randomly rolled integer, making directory-creation
//! collisions negligible rather than merely tolerated by re-roll.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(Uuid);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(Uuid);

macro_rules! uuid_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.0)
            }
        }

        impl FromStr for $ty {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(ContainerId);
uuid_id!(OverlayId);
