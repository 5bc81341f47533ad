//! Configuration file support for the eSwitch agent
//!
//! Loads and validates agent configuration from TOML files.
//! Default location: /etc/eswitch/agent.toml

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use eswitch_segments::{parse_network_vlan_ranges, VlanRangeMap};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AgentError, AgentResult};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/eswitch/agent.toml";

/// Agent identity prefix; the host name is appended
pub const AGENT_ID_PREFIX: &str = "eswitch-agent";

/// Agent loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Seconds between reconciliation ticks
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Identity reported to the control plane
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Default log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// eSwitch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EswitchSection {
    /// `<physical_network>:<interface>` entries
    #[serde(default = "default_interface_mappings")]
    pub physical_interface_mappings: Vec<String>,

    /// Privilege helper prefixed to host commands; empty runs them directly
    #[serde(default = "default_root_helper")]
    pub root_helper: String,

    /// Record hardware commands instead of running them
    #[serde(default)]
    pub dry_run: bool,
}

/// Segment pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentsSection {
    /// `<physical_network>[:<vlan_min>:<vlan_max>]` entries
    #[serde(default = "default_network_vlan_ranges")]
    pub network_vlan_ranges: Vec<String>,

    /// Snapshot file for allocation state
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub eswitch: EswitchSection,

    #[serde(default)]
    pub segments: SegmentsSection,
}

fn default_polling_interval() -> u64 {
    2
}

fn default_agent_id() -> String {
    let host = fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| fs::read_to_string("/etc/hostname"))
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}.{}", AGENT_ID_PREFIX, host)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interface_mappings() -> Vec<String> {
    vec!["default:eth2".to_string()]
}

fn default_root_helper() -> String {
    "sudo".to_string()
}

fn default_network_vlan_ranges() -> Vec<String> {
    vec!["default:1:1000".to_string()]
}

fn default_state_file() -> String {
    "/var/lib/eswitch/segments.json".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            polling_interval_secs: default_polling_interval(),
            agent_id: default_agent_id(),
            log_level: default_log_level(),
        }
    }
}

impl Default for EswitchSection {
    fn default() -> Self {
        Self {
            physical_interface_mappings: default_interface_mappings(),
            root_helper: default_root_helper(),
            dry_run: false,
        }
    }
}

impl Default for SegmentsSection {
    fn default() -> Self {
        Self {
            network_vlan_ranges: default_network_vlan_ranges(),
            state_file: default_state_file(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                AgentError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    /// Get polling interval as Duration
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.agent.polling_interval_secs)
    }

    /// Root helper, if one is configured
    pub fn root_helper(&self) -> Option<&str> {
        let helper = self.eswitch.root_helper.trim();
        (!helper.is_empty()).then_some(helper)
    }

    /// Parsed `physical_interface_mappings` as physical network -> interface
    pub fn interface_mappings(&self) -> AgentResult<BTreeMap<String, String>> {
        parse_interface_mappings(&self.eswitch.physical_interface_mappings)
    }

    /// Parsed `network_vlan_ranges`
    pub fn network_vlan_ranges(&self) -> AgentResult<VlanRangeMap> {
        Ok(parse_network_vlan_ranges(&self.segments.network_vlan_ranges)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> AgentResult<()> {
        if self.agent.polling_interval_secs == 0 {
            return Err(AgentError::Config(
                "polling_interval_secs must be > 0".to_string(),
            ));
        }

        if self.agent.agent_id.trim().is_empty() {
            return Err(AgentError::Config("agent_id must not be empty".to_string()));
        }

        if self.interface_mappings()?.is_empty() {
            return Err(AgentError::Config(
                "physical_interface_mappings must not be empty".to_string(),
            ));
        }

        self.network_vlan_ranges()?;
        Ok(())
    }
}

/// Parses `<physical_network>:<interface>` entries.
///
/// A physical network or interface may appear only once.
pub fn parse_interface_mappings<S: AsRef<str>>(
    mappings: &[S],
) -> AgentResult<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();

    for mapping in mappings {
        let mapping = mapping.as_ref().trim();
        let (physical_network, interface) = mapping
            .split_once(':')
            .map(|(p, i)| (p.trim(), i.trim()))
            .filter(|(p, i)| !p.is_empty() && !i.is_empty() && !i.contains(':'))
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "Invalid interface mapping '{}': expected <physical_network>:<interface>",
                    mapping
                ))
            })?;

        if result.contains_key(physical_network) {
            return Err(AgentError::Config(format!(
                "Duplicate physical network {} in interface mappings",
                physical_network
            )));
        }
        if result.values().any(|i| i == interface) {
            return Err(AgentError::Config(format!(
                "Interface {} mapped more than once",
                interface
            )));
        }
        result.insert(physical_network.to_string(), interface.to_string());
    }

    Ok(result)
}
