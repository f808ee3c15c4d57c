//! Background guest enrichment
//!
//! Second-pass augmentation of running guests with status metrics and
//! guest-agent data, fanned out over a bounded worker pool. A per-guest
//! failure never aborts its siblings; the caller receives one composite
//! error while the snapshot stays populated.

use crate::client::Client;
use crate::guest::{agent_flag, populate_configured_macs};
use crate::value::{get_f64, get_str, get_u64};
use futures::stream::{self, StreamExt};
use pvedash_common::{
    Error, Filesystem, Guest, GuestType, IpAddress, IpKind, NetworkInterface, Result,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maximum concurrent per-guest API request chains.
const WORKER_POOL_SIZE: usize = 5;

/// Delay before the agent retry pass; the agent inside a freshly started
/// guest may still be coming up when the first pass runs.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Mountpoints under these prefixes never represent real disks.
const SKIPPED_MOUNT_PREFIXES: &[&str] = &["/snap", "/run", "/sys", "/proc", "/dev"];

/// Windows mounts that are containers or servicing areas, not drives.
const SKIPPED_WINDOWS_FRAGMENTS: &[&str] = &[
    "\\Containers\\",
    "/Containers/",
    "\\WindowsApps\\",
    "\\WpSystem\\",
    "\\Config.Msi",
];

/// Pseudo filesystem types without real disk space behind them.
const SKIPPED_FS_TYPES: &[&str] = &[
    "tmpfs", "devtmpfs", "proc", "sysfs", "devpts", "cgroup", "configfs", "debugfs", "mqueue",
    "hugetlbfs", "securityfs", "pstore", "autofs", "UDF",
];

const MIN_FS_BYTES: u64 = 50 * 1024 * 1024;

/// Bounded-parallel guest enrichment over a snapshot
pub struct Enricher {
    client: Arc<Client>,
    concurrency: usize,
    retry_delay: Duration,
}

impl Enricher {
    pub fn new(client: Arc<Client>) -> Self {
        Enricher {
            client,
            concurrency: WORKER_POOL_SIZE,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Override the agent retry delay (tests use a short one).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enrich every running guest on every online node, then run the agent
    /// retry pass. Returns `PartialFailure` if any guest failed; the
    /// snapshot is updated either way.
    pub async fn enrich_cluster(
        &self,
        cluster: &mut pvedash_common::Cluster,
        bypass: bool,
    ) -> Result<()> {
        let work: Vec<Guest> = cluster
            .nodes
            .iter()
            .filter(|n| n.online)
            .flat_map(|n| n.guests.iter())
            .filter(|g| g.is_running())
            .cloned()
            .collect();

        if work.is_empty() {
            return Ok(());
        }
        let total = work.len();

        let mut failed = self.run_pass(cluster, work, bypass).await;

        // Agents that were still starting get one more chance.
        let retry: Vec<Guest> = cluster
            .nodes
            .iter()
            .filter(|n| n.online)
            .flat_map(|n| n.guests.iter())
            .filter(|g| {
                g.is_running()
                    && g.kind == GuestType::Qemu
                    && g.agent_enabled
                    && !g.agent_running
            })
            .cloned()
            .collect();

        if !retry.is_empty() {
            tokio::time::sleep(self.retry_delay).await;
            failed += self.run_pass(cluster, retry, true).await;
        }

        if failed > 0 {
            return Err(Error::PartialFailure { failed, total });
        }
        Ok(())
    }

    /// One pool pass over `work`; merges results back and returns the
    /// number of failed guests.
    async fn run_pass(
        &self,
        cluster: &mut pvedash_common::Cluster,
        work: Vec<Guest>,
        bypass: bool,
    ) -> usize {
        let results: Vec<(Guest, Option<Error>)> = stream::iter(work)
            .map(|guest| {
                let client = Arc::clone(&self.client);
                async move { enrich_guest(&client, guest, bypass).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failed = 0;
        for (guest, err) in results {
            if let Some(e) = err {
                debug!("enrichment failed for {}/{}: {}", guest.node, guest.vmid, e);
                failed += 1;
            }
            if let Some(node) = cluster.find_node_mut(&guest.node) {
                if let Some(slot) = node.guests.iter_mut().find(|g| g.vmid == guest.vmid) {
                    *slot = guest;
                }
            }
        }
        failed
    }
}

/// Enrich a single guest. The returned guest always has `enriched` set;
/// the error slot is filled only when the status fetch itself failed.
pub async fn enrich_guest(client: &Client, mut guest: Guest, bypass: bool) -> (Guest, Option<Error>) {
    // Cluster-resources numbers are sometimes more accurate than
    // status/current, which can report zero for disks.
    let summary_disk = guest.disk;
    let summary_max_disk = guest.max_disk;

    let status_path = format!(
        "/nodes/{}/{}/{}/status/current",
        guest.node,
        guest.kind.api_segment(),
        guest.vmid
    );
    let status_res = if bypass {
        client.get_fresh(&status_path).await
    } else {
        client.get(&status_path).await
    };

    let err = match status_res {
        Ok(res) => match res.get("data") {
            Some(data) => {
                apply_status(&mut guest, data, summary_disk, summary_max_disk);
                None
            }
            None => Some(Error::format(&status_path, "missing data field")),
        },
        Err(e) => Some(e),
    };

    if guest.is_running() {
        match guest.kind {
            GuestType::Qemu => enrich_qemu(client, &mut guest, bypass).await,
            GuestType::Lxc => enrich_lxc(client, &mut guest, bypass).await,
        }
    }

    guest.enriched = true;
    (guest, err)
}

fn apply_status(guest: &mut Guest, data: &Value, summary_disk: u64, summary_max_disk: u64) {
    guest.cpu = get_f64(data, "cpu");
    guest.mem = get_u64(data, "mem");
    guest.max_mem = get_u64(data, "maxmem");
    guest.disk_read = get_u64(data, "diskread");
    guest.disk_write = get_u64(data, "diskwrite");
    guest.net_in = get_u64(data, "netin");
    guest.net_out = get_u64(data, "netout");
    guest.uptime = get_u64(data, "uptime");

    // Zero-wins rule: the summary value is restored only when the status
    // endpoint reports zero.
    let disk = get_u64(data, "disk");
    guest.disk = if disk > 0 { disk } else { summary_disk };
    let max_disk = get_u64(data, "maxdisk");
    guest.max_disk = if max_disk > 0 { max_disk } else { summary_max_disk };
}

async fn enrich_qemu(client: &Client, guest: &mut Guest, bypass: bool) {
    let config_path = format!("/nodes/{}/qemu/{}/config", guest.node, guest.vmid);
    if let Ok(res) = client.get(&config_path).await {
        if let Some(config) = res.get("data") {
            populate_configured_macs(guest, config);
            guest.agent_enabled = agent_flag(config);
        }
    }

    if !guest.agent_enabled {
        guest.agent_running = false;
        guest.net_interfaces.clear();
        return;
    }

    let ifaces_path = format!(
        "/nodes/{}/qemu/{}/agent/network-get-interfaces",
        guest.node, guest.vmid
    );
    let ifaces_res = if bypass {
        client.get_fresh(&ifaces_path).await
    } else {
        client.get(&ifaces_path).await
    };
    let raw = match ifaces_res {
        Ok(res) => parse_agent_interfaces(&res),
        Err(e) => {
            debug!("agent query failed for {}/{}: {}", guest.node, guest.vmid, e);
            Vec::new()
        }
    };

    if raw.is_empty() {
        guest.agent_running = false;
        guest.net_interfaces.clear();
        // A config-sourced IP survives agent failure; a stale agent-sourced
        // one does not.
        if guest.configured_macs.is_empty() {
            guest.ip = None;
        }
        return;
    }

    guest.agent_running = true;
    guest.net_interfaces = filter_interfaces(raw, &guest.configured_macs, true);
    if guest.ip.is_none() {
        guest.ip = first_non_loopback_ipv4(&guest.net_interfaces);
    }

    let fsinfo_path = format!("/nodes/{}/qemu/{}/agent/get-fsinfo", guest.node, guest.vmid);
    let fsinfo_res = if bypass {
        client.get_fresh(&fsinfo_path).await
    } else {
        client.get(&fsinfo_path).await
    };
    if let Ok(res) = fsinfo_res {
        let filesystems = filter_filesystems(parse_agent_filesystems(&res));
        if !filesystems.is_empty() {
            let total: u64 = filesystems.iter().map(|f| f.total_bytes).sum();
            let used: u64 = filesystems.iter().map(|f| f.used_bytes).sum();
            // Filesystem sums beat both the summary and the status values.
            if total > 0 {
                guest.max_disk = total;
                guest.disk = used;
            }
            guest.filesystems = filesystems;
        }
    }
}

async fn enrich_lxc(client: &Client, guest: &mut Guest, bypass: bool) {
    let config_path = format!("/nodes/{}/lxc/{}/config", guest.node, guest.vmid);
    if let Ok(res) = client.get(&config_path).await {
        if let Some(config) = res.get("data") {
            populate_configured_macs(guest, config);
        }
    }

    let ifaces_path = format!("/nodes/{}/lxc/{}/interfaces", guest.node, guest.vmid);
    let ifaces_res = if bypass {
        client.get_fresh(&ifaces_path).await
    } else {
        client.get(&ifaces_path).await
    };
    let raw = match ifaces_res {
        Ok(res) => parse_lxc_interfaces(&res),
        Err(e) => {
            debug!("interface query failed for {}/{}: {}", guest.node, guest.vmid, e);
            Vec::new()
        }
    };

    if raw.is_empty() {
        guest.net_interfaces.clear();
        if guest.configured_macs.is_empty() {
            guest.ip = None;
        }
        return;
    }

    guest.net_interfaces = filter_interfaces(raw, &guest.configured_macs, false);
    if guest.ip.is_none() {
        guest.ip = first_non_loopback_ipv4(&guest.net_interfaces);
    }
}

/// Shared interface filter: drop loopback, optionally drop veth devices,
/// honour the configured-MAC set when non-empty, and reduce each surviving
/// interface to its single best address.
pub fn filter_interfaces(
    raw: Vec<NetworkInterface>,
    configured_macs: &BTreeSet<String>,
    drop_veth: bool,
) -> Vec<NetworkInterface> {
    raw.into_iter()
        .filter(|iface| !iface.is_loopback)
        .filter(|iface| !(drop_veth && iface.name.starts_with("veth")))
        .filter(|iface| {
            configured_macs.is_empty() || configured_macs.contains(&iface.mac_address.to_uppercase())
        })
        .map(|mut iface| {
            let best = iface.best_ip().cloned();
            iface.ip_addresses = best.into_iter().collect();
            iface
        })
        .collect()
}

/// First IPv4 across filtered interfaces (loopbacks are already gone).
pub fn first_non_loopback_ipv4(interfaces: &[NetworkInterface]) -> Option<String> {
    interfaces
        .iter()
        .flat_map(|i| i.ip_addresses.iter())
        .find(|ip| ip.kind == IpKind::V4)
        .map(|ip| ip.address.clone())
}

/// Decode `network-get-interfaces` output. Some deployments wrap the
/// result array inside `data`, others return it at the top level.
pub fn parse_agent_interfaces(res: &Value) -> Vec<NetworkInterface> {
    let result = res
        .get("result")
        .or_else(|| res.get("data").and_then(|d| d.get("result")))
        .and_then(Value::as_array);
    let Some(items) = result else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = get_str(item, "name")?.to_string();
            let mac = get_str(item, "hardware-address")
                .unwrap_or_default()
                .to_uppercase();
            let ip_addresses = item
                .get("ip-addresses")
                .and_then(Value::as_array)
                .map(|ips| {
                    ips.iter()
                        .filter_map(|ip| {
                            let address = get_str(ip, "ip-address")?.to_string();
                            let kind = match get_str(ip, "ip-address-type") {
                                Some("ipv4") => IpKind::V4,
                                Some("ipv6") => IpKind::V6,
                                _ => return None,
                            };
                            Some(IpAddress { address, kind })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let is_loopback = name == "lo" || name.to_lowercase().contains("loopback");
            Some(NetworkInterface {
                name,
                mac_address: mac,
                ip_addresses,
                is_loopback,
            })
        })
        .collect()
}

/// Decode the LXC `interfaces` endpoint, which reports `hwaddr` plus
/// CIDR-suffixed `inet`/`inet6` strings.
pub fn parse_lxc_interfaces(res: &Value) -> Vec<NetworkInterface> {
    let Some(items) = res.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = get_str(item, "name")?.to_string();
            let mac = get_str(item, "hwaddr").unwrap_or_default().to_uppercase();
            let mut ip_addresses = Vec::new();
            if let Some(inet) = get_str(item, "inet") {
                ip_addresses.push(IpAddress {
                    address: inet.split('/').next().unwrap_or(inet).to_string(),
                    kind: IpKind::V4,
                });
            }
            if let Some(inet6) = get_str(item, "inet6") {
                ip_addresses.push(IpAddress {
                    address: inet6.split('/').next().unwrap_or(inet6).to_string(),
                    kind: IpKind::V6,
                });
            }
            let is_loopback = name == "lo";
            Some(NetworkInterface {
                name,
                mac_address: mac,
                ip_addresses,
                is_loopback,
            })
        })
        .collect()
}

/// Decode `get-fsinfo` output into raw filesystem records.
pub fn parse_agent_filesystems(res: &Value) -> Vec<Filesystem> {
    let result = res
        .get("result")
        .or_else(|| res.get("data").and_then(|d| d.get("result")))
        .and_then(Value::as_array);
    let Some(items) = result else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let mountpoint = get_str(item, "mountpoint").unwrap_or_default().to_string();
            Some(Filesystem {
                name: get_str(item, "name").unwrap_or_default().to_string(),
                mountpoint,
                kind: get_str(item, "type").unwrap_or_default().to_string(),
                total_bytes: get_u64(item, "total-bytes"),
                used_bytes: get_u64(item, "used-bytes"),
                device: item
                    .get("disk")
                    .and_then(Value::as_array)
                    .and_then(|d| d.first())
                    .and_then(|d| get_str(d, "dev"))
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Keep only filesystems that represent real disk space.
pub fn filter_filesystems(raw: Vec<Filesystem>) -> Vec<Filesystem> {
    raw.into_iter()
        .filter(|fs| {
            let mp = &fs.mountpoint;
            if SKIPPED_MOUNT_PREFIXES.iter().any(|p| mp.starts_with(p)) || mp.contains("snap/") {
                return false;
            }
            if SKIPPED_WINDOWS_FRAGMENTS.iter().any(|f| mp.contains(f)) {
                return false;
            }
            // Long GUID-bearing paths are servicing or virtual mounts.
            if mp.contains('{') && mp.contains('}') && mp.len() > 50 {
                return false;
            }
            if fs.total_bytes == 0 || fs.total_bytes < MIN_FS_BYTES {
                return false;
            }
            !SKIPPED_FS_TYPES.contains(&fs.kind.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn iface(name: &str, mac: &str, ips: Vec<IpAddress>) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            mac_address: mac.to_string(),
            ip_addresses: ips,
            is_loopback: name == "lo",
        }
    }

    fn v4(addr: &str) -> IpAddress {
        IpAddress {
            address: addr.to_string(),
            kind: IpKind::V4,
        }
    }

    fn v6(addr: &str) -> IpAddress {
        IpAddress {
            address: addr.to_string(),
            kind: IpKind::V6,
        }
    }

    #[test]
    fn configured_mac_filter_keeps_only_matches() {
        let mut macs = BTreeSet::new();
        macs.insert("AA:BB:CC:DD:EE:FF".to_string());
        let raw = vec![
            iface("eth0", "AA:BB:CC:DD:EE:FF", vec![v4("10.0.0.5")]),
            iface("eth1", "DE:AD:BE:EF:00:01", vec![v4("10.0.0.6")]),
            iface("lo", "00:00:00:00:00:00", vec![v4("127.0.0.1")]),
        ];
        let filtered = filter_interfaces(raw, &macs, true);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].mac_address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn veth_devices_dropped_for_qemu_but_not_lxc() {
        let raw = vec![iface("veth0", "AA:BB:CC:DD:EE:FF", vec![v4("10.0.0.5")])];
        assert!(filter_interfaces(raw.clone(), &BTreeSet::new(), true).is_empty());
        assert_eq!(filter_interfaces(raw, &BTreeSet::new(), false).len(), 1);
    }

    #[test]
    fn best_ip_reduction_prefers_ipv4() {
        let raw = vec![iface(
            "eth0",
            "AA:BB:CC:DD:EE:FF",
            vec![v6("fe80::1"), v4("10.0.0.5"), v6("2001:db8::1")],
        )];
        let filtered = filter_interfaces(raw, &BTreeSet::new(), true);
        assert_eq!(filtered[0].ip_addresses.len(), 1);
        assert_eq!(filtered[0].ip_addresses[0].address, "10.0.0.5");
    }

    #[test]
    fn interface_without_usable_ip_survives_with_empty_list() {
        let raw = vec![iface("eth0", "AA:BB:CC:DD:EE:FF", vec![])];
        let filtered = filter_interfaces(raw, &BTreeSet::new(), true);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].ip_addresses.is_empty());
    }

    #[test]
    fn agent_payload_parsed_from_either_wrapper() {
        let wrapped = json!({"data": {"result": [
            {"name": "eth0", "hardware-address": "aa:bb:cc:dd:ee:ff",
             "ip-addresses": [{"ip-address": "10.0.0.5", "ip-address-type": "ipv4", "prefix": 24}]}
        ]}});
        let flat = json!({"result": [
            {"name": "lo", "hardware-address": "00:00:00:00:00:00", "ip-addresses": []}
        ]});
        let parsed = parse_agent_interfaces(&wrapped);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].mac_address, "AA:BB:CC:DD:EE:FF");
        assert!(!parsed[0].is_loopback);
        let parsed = parse_agent_interfaces(&flat);
        assert!(parsed[0].is_loopback);
    }

    #[test]
    fn lxc_interfaces_parse_cidr_addresses() {
        let res = json!({"data": [
            {"name": "eth0", "hwaddr": "aa:bb:cc:dd:ee:0f", "inet": "192.168.1.10/24", "inet6": "fe80::1/64"},
            {"name": "lo", "hwaddr": "00:00:00:00:00:00", "inet": "127.0.0.1/8"}
        ]});
        let parsed = parse_lxc_interfaces(&res);
        assert_eq!(parsed[0].ip_addresses[0].address, "192.168.1.10");
        assert_eq!(parsed[0].ip_addresses[1].address, "fe80::1");
        assert!(parsed[1].is_loopback);
    }

    #[test]
    fn filesystem_filter_drops_pseudo_and_small_mounts() {
        let gib: u64 = 1 << 30;
        let raw = vec![
            Filesystem {
                mountpoint: "/".to_string(),
                kind: "ext4".to_string(),
                total_bytes: 20 * gib,
                used_bytes: 5 * gib,
                ..Default::default()
            },
            Filesystem {
                mountpoint: "/run/lock".to_string(),
                kind: "tmpfs".to_string(),
                total_bytes: gib,
                ..Default::default()
            },
            Filesystem {
                mountpoint: "/snap/core/123".to_string(),
                kind: "squashfs".to_string(),
                total_bytes: gib,
                ..Default::default()
            },
            Filesystem {
                mountpoint: "/boot/efi".to_string(),
                kind: "vfat".to_string(),
                total_bytes: 10 * 1024 * 1024,
                ..Default::default()
            },
            Filesystem {
                mountpoint: "/data".to_string(),
                kind: "tmpfs".to_string(),
                total_bytes: 2 * gib,
                ..Default::default()
            },
            Filesystem {
                mountpoint: "C:\\WindowsApps\\pkg".to_string(),
                kind: "ntfs".to_string(),
                total_bytes: 2 * gib,
                ..Default::default()
            },
        ];
        let kept = filter_filesystems(raw);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].mountpoint, "/");
    }

    #[test]
    fn guid_paths_longer_than_50_chars_dropped() {
        let raw = vec![Filesystem {
            mountpoint: "C:\\ProgramData\\Mounts\\{12345678-1234-1234-1234-123456789abc}\\vol"
                .to_string(),
            kind: "ntfs".to_string(),
            total_bytes: 1 << 31,
            ..Default::default()
        }];
        assert!(filter_filesystems(raw).is_empty());
    }

    #[test]
    fn status_zero_restores_summary_disk_values() {
        let mut guest = Guest::new(100, "a", GuestType::Qemu);
        guest.disk = 111;
        guest.max_disk = 222;
        let data = json!({"cpu": 0.5, "disk": 0, "maxdisk": 0, "uptime": 60});
        apply_status(&mut guest, &data, 111, 222);
        assert_eq!(guest.disk, 111);
        assert_eq!(guest.max_disk, 222);
        assert_eq!(guest.uptime, 60);

        let data = json!({"disk": 333, "maxdisk": 444});
        apply_status(&mut guest, &data, 111, 222);
        assert_eq!(guest.disk, 333);
        assert_eq!(guest.max_disk, 444);
    }
}
