//! Shell command builders and output parsers for SR-IOV link operations

use eswitch_common::shell::{self, shellquote};
use eswitch_types::{MacAddress, VlanTag};
use once_cell::sync::Lazy;
use regex::Regex;

/// sysfs link from a PF device directory to its VFs
pub const VIRTFN_PREFIX: &str = "virtfn";

/// Default VLAN priority (802.1p) used when programming a VF
pub const DEFAULT_VLAN_QOS: u8 = 0;

/// `vf <index> MAC <mac>` (older iproute2) or `vf <index> link/ether <mac>`
static VF_MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*vf\s+(\d+)\s+(?:MAC|link/ether)\s+([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})")
        .expect("Invalid regex pattern")
});

/// One line of `ip -o link show type macvtap`
static MACVTAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\d+:\s+([^@:\s]+)@([^:\s]+):.*?link/ether\s+([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})",
    )
    .expect("Invalid regex pattern")
});

/// Build link admin state command
pub fn build_set_link_cmd(dev: &str, up: bool) -> String {
    format!(
        "{} link set dev {} {}",
        shell::IP_CMD,
        shellquote(dev),
        if up { "up" } else { "down" }
    )
}

/// Build VF VLAN programming command
///
/// VLAN 0 removes the VLAN filter from the VF.
pub fn build_set_vf_vlan_cmd(pf: &str, vf_index: u16, vlan: VlanTag, qos: u8) -> String {
    format!(
        "{} link set dev {} vf {} vlan {} qos {}",
        shell::IP_CMD,
        shellquote(pf),
        vf_index,
        vlan,
        qos
    )
}

/// Build PF link query command (lists per-VF state)
pub fn build_show_link_cmd(pf: &str) -> String {
    format!("{} link show dev {}", shell::IP_CMD, shellquote(pf))
}

/// Build macvtap listing command (one line per link)
pub fn build_show_macvtap_cmd() -> String {
    format!("{} -o link show type macvtap", shell::IP_CMD)
}

/// Parses the per-VF lines of `ip link show dev <pf>` into `(vf_index, mac)`
pub fn parse_vf_macs(output: &str) -> Vec<(u16, MacAddress)> {
    VF_MAC_RE
        .captures_iter(output)
        .filter_map(|caps| {
            let index = caps[1].parse::<u16>().ok()?;
            let mac = caps[2].parse::<MacAddress>().ok()?;
            Some((index, mac))
        })
        .collect()
}

/// A macvtap link and the device it sits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacvtapLink {
    pub name: String,
    pub lower: String,
    pub mac: MacAddress,
}

/// Parses `ip -o link show type macvtap`
pub fn parse_macvtap_links(output: &str) -> Vec<MacvtapLink> {
    MACVTAP_RE
        .captures_iter(output)
        .filter_map(|caps| {
            Some(MacvtapLink {
                name: caps[1].to_string(),
                lower: caps[2].to_string(),
                mac: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// Parses the VF index out of a `virtfn<N>` sysfs entry name
pub fn parse_virtfn_index(name: &str) -> Option<u16> {
    name.strip_prefix(VIRTFN_PREFIX)?.parse().ok()
}
