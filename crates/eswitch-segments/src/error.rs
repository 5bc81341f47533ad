//! Error types for segmentation ID allocation.

use thiserror::Error;

/// Result type for segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;

/// Segment allocation errors.
///
/// These are returned to the caller as-is; none of them is retried.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Every pool row on every physical network is allocated.
    #[error("Unable to create the network. No virtual network is available")]
    NoNetworkAvailable,

    /// An explicit reservation hit an allocated row.
    #[error(
        "Unable to create the network. The VLAN {vlan_id} on physical network {physical_network} is in use"
    )]
    VlanIdInUse {
        physical_network: String,
        vlan_id: u16,
    },

    /// A `network_vlan_ranges` entry is malformed, out of bounds or overlaps.
    #[error("Invalid network VLAN range '{entry}': {reason}")]
    InvalidRange { entry: String, reason: String },

    /// A segmentation id outside 1..=4094.
    #[error("Invalid segmentation id {vlan_id} on physical network {physical_network}")]
    InvalidSegmentationId {
        physical_network: String,
        vlan_id: u16,
    },

    /// A provisioning request that cannot be satisfied as written.
    #[error("Invalid provider request for network {network_id}: {reason}")]
    InvalidRequest { network_id: String, reason: String },

    /// The snapshot file could not be read or written.
    #[error("Segment state persistence failed for {path}: {reason}")]
    Persistence { path: String, reason: String },
}

impl SegmentError {
    /// Creates a range parse error.
    pub fn invalid_range(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates a provider request error.
    pub fn invalid_request(network_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            network_id: network_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if a later attempt may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SegmentError::Persistence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_in_use_display() {
        let err = SegmentError::VlanIdInUse {
            physical_network: "physnet1".to_string(),
            vlan_id: 15,
        };
        assert_eq!(
            err.to_string(),
            "Unable to create the network. The VLAN 15 on physical network physnet1 is in use"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(!SegmentError::NoNetworkAvailable.is_retryable());
        assert!(!SegmentError::invalid_range("p:1", "bad").is_retryable());
        assert!(SegmentError::persistence("/tmp/x", "disk full").is_retryable());
    }
}
