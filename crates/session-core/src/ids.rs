//! Id newtypes shared across the engine.
//!
//! Node ↔ Interface ↔ Network forms a small cyclic object graph; per the
//! redesign notes we store everything in id-keyed tables and pass ids
//! across module boundaries instead of live references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Networks are allocated from a disjoint range so their ids never
/// collide with node ids in on-wire/XML representations.
pub const NETWORK_ID_BASE: u32 = 1 << 16;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(SessionId);
id_type!(NodeId);
id_type!(InterfaceId);
id_type!(NetworkId);
id_type!(HookId);
