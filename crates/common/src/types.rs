//! Core data model for pvedash
//!
//! A snapshot is a four-level tree: cluster -> nodes -> guests -> storage.
//! Snapshots are immutable once handed to the UI; a refresh builds a new
//! tree and swaps the root atomically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Aggregated cluster metrics and the node tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub quorate: bool,
    pub total_nodes: usize,
    pub online_nodes: usize,
    /// Sum of cores over online nodes with valid metrics
    pub total_cores: f64,
    /// Arithmetic mean CPU fraction over nodes that contributed metrics
    pub cpu_usage: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    /// Cluster-wide storage, shared backends counted once
    pub storage_total: u64,
    pub storage_used: u64,
    pub nodes: Vec<Node>,
    /// Unix timestamp of the snapshot build
    pub last_update: i64,
}

impl Cluster {
    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn find_node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    /// Look up a guest by its (node, vmid) identity key.
    pub fn find_guest(&self, node: &str, vmid: u32) -> Option<&Guest> {
        self.find_node(node)?.guests.iter().find(|g| g.vmid == vmid)
    }

    /// All guests across all nodes, in display order.
    pub fn guests(&self) -> impl Iterator<Item = &Guest> {
        self.nodes.iter().flat_map(|n| n.guests.iter())
    }
}

/// One hypervisor host in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identity key
    pub name: String,
    #[serde(default)]
    pub ip: String,
    pub online: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kernel_version: String,
    pub cpu_count: f64,
    pub cpu_usage: f64,
    pub cpu_info: Option<CpuInfo>,
    /// 1m/5m/15m load averages as reported by the node
    #[serde(default)]
    pub load_avg: Vec<String>,
    pub memory_total: u64,
    pub memory_used: u64,
    pub storage_total: u64,
    pub storage_used: u64,
    pub uptime: u64,
    pub storage: Option<Storage>,
    #[serde(default)]
    pub guests: Vec<Guest>,
    /// Set whenever a status fetch succeeds; stale metrics from a prior
    /// fetch keep their old timestamp rather than being cleared.
    pub last_metrics_update: Option<i64>,
}

impl Node {
    pub fn find_guest(&self, vmid: u32) -> Option<&Guest> {
        self.guests.iter().find(|g| g.vmid == vmid)
    }
}

/// CPU hardware details from node status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
    pub sockets: u32,
}

/// Guest kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestType {
    Qemu,
    Lxc,
}

impl GuestType {
    /// URL path segment for this guest type.
    pub fn api_segment(self) -> &'static str {
        match self {
            GuestType::Qemu => "qemu",
            GuestType::Lxc => "lxc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qemu" => Some(GuestType::Qemu),
            "lxc" => Some(GuestType::Lxc),
            _ => None,
        }
    }
}

impl std::fmt::Display for GuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_segment())
    }
}

/// Guest lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GuestStatus {
    Running,
    Stopped,
    Other(String),
}

impl Default for GuestStatus {
    fn default() -> Self {
        GuestStatus::Stopped
    }
}

impl From<String> for GuestStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => GuestStatus::Running,
            "stopped" => GuestStatus::Stopped,
            _ => GuestStatus::Other(s),
        }
    }
}

impl From<GuestStatus> for String {
    fn from(s: GuestStatus) -> Self {
        s.to_string()
    }
}

impl std::fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestStatus::Running => f.write_str("running"),
            GuestStatus::Stopped => f.write_str("stopped"),
            GuestStatus::Other(s) => f.write_str(s),
        }
    }
}

/// A QEMU VM or LXC container, identified by (node, vmid)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub vmid: u32,
    pub name: String,
    pub node: String,
    #[serde(rename = "type")]
    pub kind: GuestType,
    pub status: GuestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub cpu: f64,
    pub mem: u64,
    pub max_mem: u64,
    pub disk: u64,
    pub max_disk: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub net_in: u64,
    pub net_out: u64,
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default)]
    pub template: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    // Guest-agent enrichment block
    #[serde(default)]
    pub agent_enabled: bool,
    #[serde(default)]
    pub agent_running: bool,
    #[serde(default)]
    pub net_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub filesystems: Vec<Filesystem>,
    /// Upper-case MACs parsed from net0..netN config entries
    #[serde(default)]
    pub configured_macs: BTreeSet<String>,
    #[serde(default)]
    pub enriched: bool,
}

impl Guest {
    pub fn new(vmid: u32, node: impl Into<String>, kind: GuestType) -> Self {
        Guest {
            vmid,
            name: String::new(),
            node: node.into(),
            kind,
            status: GuestStatus::default(),
            ip: None,
            cpu: 0.0,
            mem: 0,
            max_mem: 0,
            disk: 0,
            max_disk: 0,
            disk_read: 0,
            disk_write: 0,
            net_in: 0,
            net_out: 0,
            uptime: 0,
            ha_state: None,
            lock: None,
            tags: None,
            template: false,
            pool: None,
            agent_enabled: false,
            agent_running: false,
            net_interfaces: Vec::new(),
            filesystems: Vec::new(),
            configured_macs: BTreeSet::new(),
            enriched: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == GuestStatus::Running
    }
}

/// One storage backend as reported by a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    /// Storage id, e.g. "local" or "nas"
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub content: String,
    pub disk: u64,
    pub max_disk: u64,
    #[serde(default)]
    pub plugin_type: String,
    #[serde(default)]
    pub status: String,
    /// When true, every node reporting this id sees the same capacity
    #[serde(default)]
    pub shared: bool,
}

/// IP address family tag, as reported by the guest agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpKind {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    pub kind: IpKind,
}

/// A guest network interface after agent probing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    /// Upper-case hex MAC
    pub mac_address: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub is_loopback: bool,
}

impl NetworkInterface {
    /// Pick the interface's best address: IPv4 first, then the first IPv6,
    /// then the first of any kind.
    pub fn best_ip(&self) -> Option<&IpAddress> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.kind == IpKind::V4)
            .or_else(|| self.ip_addresses.iter().find(|ip| ip.kind == IpKind::V6))
            .or_else(|| self.ip_addresses.first())
    }
}

/// A guest filesystem from the QEMU guest agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filesystem {
    pub name: String,
    pub mountpoint: String,
    /// Filesystem type as reported, e.g. "ext4" or "ntfs"
    #[serde(rename = "type")]
    pub kind: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Filesystem {
    pub fn is_root(&self) -> bool {
        self.mountpoint == "/"
    }

    /// Windows system drive (`C:\` or `C:/`).
    pub fn is_system_drive(&self) -> bool {
        self.mountpoint.to_lowercase().starts_with("c:")
    }
}

/// Validate a config-sourced address, rejecting the placeholder strings
/// Proxmox uses in net entries ("dhcp", "manual", "static").
pub fn is_valid_ip(ip: &str) -> bool {
    if ip.is_empty() || ip == "dhcp" || ip == "manual" || ip == "static" {
        return false;
    }
    ip.parse::<std::net::IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_ip_prefers_ipv4() {
        let iface = NetworkInterface {
            name: "eth0".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            ip_addresses: vec![
                IpAddress {
                    address: "fe80::1".to_string(),
                    kind: IpKind::V6,
                },
                IpAddress {
                    address: "10.0.0.5".to_string(),
                    kind: IpKind::V4,
                },
                IpAddress {
                    address: "2001:db8::1".to_string(),
                    kind: IpKind::V6,
                },
            ],
            is_loopback: false,
        };
        assert_eq!(iface.best_ip().unwrap().address, "10.0.0.5");
    }

    #[test]
    fn best_ip_falls_back_to_ipv6() {
        let iface = NetworkInterface {
            name: "eth0".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            ip_addresses: vec![IpAddress {
                address: "2001:db8::1".to_string(),
                kind: IpKind::V6,
            }],
            is_loopback: false,
        };
        assert_eq!(iface.best_ip().unwrap().address, "2001:db8::1");
    }

    #[test]
    fn ip_placeholders_rejected() {
        assert!(!is_valid_ip("dhcp"));
        assert!(!is_valid_ip("manual"));
        assert!(!is_valid_ip("static"));
        assert!(!is_valid_ip(""));
        assert!(!is_valid_ip("not-an-ip"));
        assert!(is_valid_ip("10.0.0.5"));
        assert!(is_valid_ip("2001:db8::1"));
    }

    #[test]
    fn guest_status_round_trips_unknown_values() {
        let s: GuestStatus = serde_json::from_str("\"suspended\"").unwrap();
        assert_eq!(s, GuestStatus::Other("suspended".to_string()));
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"suspended\"");
    }

    #[test]
    fn windows_system_drive_detected() {
        let fs = Filesystem {
            mountpoint: "C:\\".to_string(),
            ..Default::default()
        };
        assert!(fs.is_system_drive());
        assert!(!fs.is_root());
    }
}
