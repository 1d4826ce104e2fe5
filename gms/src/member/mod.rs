use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::GmsError;

pub use builder::{merge_groups, MemberIdentifierBuilder};
pub use identifier::{vm_kind, MemberIdentifier};

mod builder;
mod identifier;

/// Wire schema versions. Ordinals only ever grow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Version {
    V1 = 1,
    V2 = 2,
}

impl Version {
    pub const CURRENT: Version = Version::V2;

    pub fn ordinal(&self) -> u16 {
        *self as u16
    }

    pub fn from_ordinal(ordinal: u16) -> Result<Self, GmsError> {
        match ordinal {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            _ => Err(GmsError::InvalidIdentifier(format!("unsupported version ordinal {}", ordinal))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.ordinal())
    }
}
