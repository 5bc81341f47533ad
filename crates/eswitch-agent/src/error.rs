//! Error types for the eSwitch agent

use eswitch_handler::EswitchError;
use eswitch_segments::SegmentError;
use eswitch_types::ParseError;
use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    /// An outbound control-plane call failed
    #[error("Control plane unreachable during {operation} for device {device}: {reason}")]
    ControlPlaneUnreachable {
        operation: &'static str,
        device: String,
        reason: String,
    },

    /// Invalid mapping or configuration file
    #[error("Configuration error: {0}")]
    Config(String),

    /// A network type other than vlan or ib
    #[error("Unsupported network type {network_type} for network {network_id}")]
    UnsupportedNetworkType {
        network_id: String,
        network_type: String,
    },

    /// Handler failure
    #[error(transparent)]
    Eswitch(#[from] EswitchError),

    /// Segment allocation failure
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Malformed value from a notification or reply
    #[error("Invalid value: {0}")]
    Parse(#[from] ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Creates a control-plane failure
    pub fn unreachable(
        operation: &'static str,
        device: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ControlPlaneUnreachable {
            operation,
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the failure should flag a resync: the control plane
    /// was unreachable or a hardware command failed
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            AgentError::ControlPlaneUnreachable { .. }
                | AgentError::Eswitch(EswitchError::HardwareCommand { .. })
        )
    }

    /// Returns true if a resync may recover from the error
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::ControlPlaneUnreachable { .. } => true,
            AgentError::Eswitch(e) => e.is_retryable(),
            AgentError::Segment(e) => e.is_retryable(),
            _ => false,
        }
    }
}
