//! Error types for the eSwitch handler

use eswitch_common::CommandError;
use eswitch_types::MacAddress;
use thiserror::Error;

/// Result type for handler operations
pub type EswitchResult<T> = Result<T, EswitchError>;

/// eSwitch handler errors
#[derive(Debug, Error)]
pub enum EswitchError {
    /// Fabric or PF mapping conflict.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The fabric has not been mapped.
    #[error("No eSwitch found for fabric {fabric}")]
    UnknownFabric { fabric: String },

    /// The vNIC is not bound to a device on the fabric.
    #[error("vNIC {mac} is not attached on fabric {fabric}")]
    VnicNotFound { fabric: String, mac: MacAddress },

    /// The device cannot be resolved to a PF and VF index.
    #[error("Invalid VF/PF index for device {device}")]
    DeviceNotFound { device: String },

    /// A device control command failed partway through a sequence.
    #[error("Hardware command failed for device {device}: {source}")]
    HardwareCommand {
        device: String,
        #[source]
        source: CommandError,
    },
}

impl EswitchError {
    /// Creates a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unknown fabric error
    pub fn unknown_fabric(fabric: impl Into<String>) -> Self {
        Self::UnknownFabric {
            fabric: fabric.into(),
        }
    }

    /// Wraps a device control failure
    pub fn hardware(device: impl Into<String>, source: CommandError) -> Self {
        Self::HardwareCommand {
            device: device.into(),
            source,
        }
    }

    /// Returns true if the operation may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            EswitchError::HardwareCommand { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EswitchError::unknown_fabric("physnet1");
        assert_eq!(err.to_string(), "No eSwitch found for fabric physnet1");

        let err = EswitchError::config("PF eth2 already mapped to fabric physnet1");
        assert_eq!(
            err.to_string(),
            "Configuration error: PF eth2 already mapped to fabric physnet1"
        );
    }

    #[test]
    fn test_is_retryable() {
        let failed = CommandError::Failed {
            command: "ip link set dev eth2 down".to_string(),
            exit_code: 2,
            output: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        assert!(EswitchError::hardware("eth2", failed).is_retryable());
        assert!(!EswitchError::config("duplicate").is_retryable());
    }
}
