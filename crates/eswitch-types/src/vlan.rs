//! VLAN tag programmed on a virtual function.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// VLAN tag applied to a VF by the eSwitch.
///
/// Unlike a bridge VLAN id, `0` is valid here: programming tag `0` removes
/// VLAN tagging from the VF, which is how a port is released.
///
/// # Examples
///
/// ```
/// use eswitch_types::VlanTag;
///
/// let tag = VlanTag::new(100).unwrap();
/// assert!(!tag.is_clear());
/// assert!(VlanTag::CLEAR.is_clear());
/// assert!(VlanTag::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanTag(u16);

impl VlanTag {
    /// Largest taggable VLAN id.
    pub const MAX: u16 = 4094;

    /// The "no VLAN" tag.
    pub const CLEAR: VlanTag = VlanTag(0);

    /// Creates a tag, rejecting values above [`VlanTag::MAX`].
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id <= Self::MAX {
            Ok(VlanTag(id))
        } else {
            Err(ParseError::InvalidVlanTag(id as u32))
        }
    }

    /// Returns the tag as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns true for the clearing tag `0`.
    pub const fn is_clear(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VlanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanTag {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u32 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidVlanTag(u32::MAX))?;
        u16::try_from(id)
            .map_err(|_| ParseError::InvalidVlanTag(id))
            .and_then(VlanTag::new)
    }
}

impl TryFrom<u16> for VlanTag {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanTag::new(id)
    }
}

impl From<VlanTag> for u16 {
    fn from(tag: VlanTag) -> u16 {
        tag.0
    }
}
