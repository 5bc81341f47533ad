//! Attached-device set differences

use std::collections::BTreeMap;

use crate::resource_mgr::ScannedDevice;

/// Devices that appeared and disappeared between two scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Devices in the current scan only, as currently seen
    pub added: Vec<ScannedDevice>,
    /// Devices in the previous scan only, as previously seen
    pub removed: Vec<ScannedDevice>,
}

impl DeviceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes `added = current - previous` and `removed = previous - current`
/// by device name.
///
/// A device whose MAC changed between the scans is reported as removed with
/// the old MAC and added with the new one. Results are ordered by device
/// name.
pub fn diff_devices(
    previous: &BTreeMap<String, ScannedDevice>,
    current: &BTreeMap<String, ScannedDevice>,
) -> DeviceDiff {
    let mut diff = DeviceDiff::default();

    for (dev, seen) in previous {
        match current.get(dev) {
            Some(now) if now.mac == seen.mac => {}
            _ => diff.removed.push(seen.clone()),
        }
    }
    for (dev, seen) in current {
        match previous.get(dev) {
            Some(before) if before.mac == seen.mac => {}
            _ => diff.added.push(seen.clone()),
        }
    }

    diff
}
