//! `network_vlan_ranges` parsing.
//!
//! Entries have the form `<physical_network>[:<vlan_min>:<vlan_max>]`. A bare
//! physical network name registers the network with no pool, so only explicit
//! reservations are possible on it.

use std::collections::BTreeMap;
use std::fmt;

use eswitch_types::VlanTag;
use serde::{Deserialize, Serialize};

use crate::error::{SegmentError, SegmentResult};

/// Physical network name to its configured ranges.
pub type VlanRangeMap = BTreeMap<String, Vec<VlanRange>>;

/// Inclusive range of segmentation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VlanRange {
    pub min: u16,
    pub max: u16,
}

impl VlanRange {
    /// Creates a range, checking `1 <= min <= max <= 4094`.
    pub fn new(min: u16, max: u16) -> SegmentResult<Self> {
        let range = Self { min, max };
        if min == 0 || max > VlanTag::MAX || min > max {
            return Err(SegmentError::invalid_range(
                range.to_string(),
                format!("bounds must satisfy 1 <= min <= max <= {}", VlanTag::MAX),
            ));
        }
        Ok(range)
    }

    pub fn contains(&self, vlan_id: u16) -> bool {
        (self.min..=self.max).contains(&vlan_id)
    }

    pub fn overlaps(&self, other: &VlanRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

/// Returns true if `vlan_id` lies in any range configured for `physical_network`.
pub fn is_in_ranges(ranges: &VlanRangeMap, physical_network: &str, vlan_id: u16) -> bool {
    ranges
        .get(physical_network)
        .is_some_and(|rs| rs.iter().any(|r| r.contains(vlan_id)))
}

/// Parses a list of `network_vlan_ranges` entries.
///
/// Overlapping ranges on the same physical network are rejected.
pub fn parse_network_vlan_ranges<S: AsRef<str>>(entries: &[S]) -> SegmentResult<VlanRangeMap> {
    let mut map = VlanRangeMap::new();

    for entry in entries {
        let entry = entry.as_ref().trim();
        let (physical_network, range) = parse_entry(entry)?;
        let ranges = map.entry(physical_network).or_default();

        if let Some(range) = range {
            if let Some(existing) = ranges.iter().find(|r| r.overlaps(&range)) {
                return Err(SegmentError::invalid_range(
                    entry,
                    format!("overlaps existing range {}", existing),
                ));
            }
            ranges.push(range);
        }
    }

    for ranges in map.values_mut() {
        ranges.sort();
    }
    Ok(map)
}

fn parse_entry(entry: &str) -> SegmentResult<(String, Option<VlanRange>)> {
    let parts: Vec<&str> = entry.split(':').map(str::trim).collect();

    let physical_network = parts[0];
    if physical_network.is_empty() {
        return Err(SegmentError::invalid_range(entry, "missing physical network"));
    }

    match parts.as_slice() {
        [_] => Ok((physical_network.to_string(), None)),
        [_, min, max] => {
            let parse = |s: &str| {
                s.parse::<u16>().map_err(|_| {
                    SegmentError::invalid_range(entry, format!("'{}' is not a VLAN id", s))
                })
            };
            let range = VlanRange::new(parse(min)?, parse(max)?)
                .map_err(|e| SegmentError::invalid_range(entry, e.to_string()))?;
            Ok((physical_network.to_string(), Some(range)))
        }
        _ => Err(SegmentError::invalid_range(
            entry,
            "expected <physical_network>[:<vlan_min>:<vlan_max>]",
        )),
    }
}
