//! Guest config parsing and lifecycle pass-through
//!
//! Proxmox guest configs encode network devices as `net0`, `net1`, ...
//! with comma-separated key/value strings. QEMU puts the MAC after the
//! model (`virtio=AA:BB:...`), LXC uses `hwaddr=`; either may carry an
//! `ip=` entry that is often a placeholder rather than an address.

use crate::client::Client;
use crate::value::{get_flag, get_opt_string, get_str, get_u64};
use pvedash_common::{is_valid_ip, Error, Guest, GuestType, Result};
use serde_json::Value;

const MAC_LEN: usize = 17;

fn is_mac(s: &str) -> bool {
    s.len() == MAC_LEN && s.bytes().filter(|b| *b == b':').count() == 5
}

fn is_net_key(key: &str) -> bool {
    key.len() > 3
        && key.starts_with("net")
        && key.as_bytes()[3].is_ascii_digit()
}

/// Extract the MAC from one netX value string, if present.
fn mac_from_net_entry(entry: &str) -> Option<String> {
    for part in entry.split(',') {
        let mac = if let Some(rest) = part.strip_prefix("hwaddr=") {
            rest.to_uppercase()
        } else if let Some((_, rhs)) = part.split_once('=') {
            if !is_mac(rhs) {
                continue;
            }
            rhs.to_uppercase()
        } else if is_mac(part) {
            part.to_uppercase()
        } else {
            continue;
        };
        if is_mac(&mac) {
            return Some(mac);
        }
    }
    None
}

/// Fill the configured-MAC set from a guest config object.
pub fn populate_configured_macs(guest: &mut Guest, config: &Value) {
    let Some(map) = config.as_object() else {
        return;
    };
    for (key, value) in map {
        if !is_net_key(key) {
            continue;
        }
        let Some(entry) = value.as_str() else {
            continue;
        };
        if let Some(mac) = mac_from_net_entry(entry) {
            guest.configured_macs.insert(mac);
        }
    }
}

/// First syntactically valid `ip=` address across netX entries.
/// Placeholders ("dhcp", "manual", "static") are rejected.
pub fn config_ip(config: &Value) -> Option<String> {
    let map = config.as_object()?;
    for (key, value) in map {
        if !is_net_key(key) {
            continue;
        }
        let Some(entry) = value.as_str() else {
            continue;
        };
        for part in entry.split(',') {
            if let Some(ip) = part.strip_prefix("ip=") {
                let ip = ip.split('/').next().unwrap_or(ip);
                if is_valid_ip(ip) {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

/// The `agent` config value under its various encodings.
pub fn agent_flag(config: &Value) -> bool {
    get_flag(config, "agent")
}

/// Lifecycle operations passed through to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestAction {
    Start,
    Stop,
    Restart,
}

impl GuestAction {
    pub fn api_segment(self) -> &'static str {
        match self {
            GuestAction::Start => "start",
            GuestAction::Stop => "stop",
            GuestAction::Restart => "restart",
        }
    }
}

impl Client {
    /// POST `/nodes/{n}/{type}/{id}/status/{start|stop|restart}`.
    pub async fn guest_action(&self, guest: &Guest, action: GuestAction) -> Result<()> {
        if guest.template && action == GuestAction::Start {
            return Err(Error::NotSupported("templates cannot be started".to_string()));
        }
        let path = format!(
            "/nodes/{}/{}/{}/status/{}",
            guest.node,
            guest.kind.api_segment(),
            guest.vmid,
            action.api_segment()
        );
        self.post(&path, &[]).await.map(|_| ())
    }

    /// Combined status + config fetch for a single guest.
    pub async fn get_guest_detail(
        &self,
        node: &str,
        kind: GuestType,
        vmid: u32,
    ) -> Result<Guest> {
        let status_path = format!(
            "/nodes/{}/{}/{}/status/current",
            node,
            kind.api_segment(),
            vmid
        );
        let status_res = self.get(&status_path).await?;
        let status = status_res
            .get("data")
            .ok_or_else(|| Error::format(&status_path, "missing data field"))?;

        let config_path = format!("/nodes/{}/{}/{}/config", node, kind.api_segment(), vmid);
        let config_res = self.get(&config_path).await?;
        let config = config_res
            .get("data")
            .ok_or_else(|| Error::format(&config_path, "missing data field"))?;

        let mut guest = Guest::new(vmid, node, kind);
        guest.name = get_str(status, "name").unwrap_or_default().to_string();
        guest.status = get_str(status, "status").unwrap_or_default().to_string().into();
        guest.cpu = crate::value::get_f64(status, "cpu");
        guest.mem = get_u64(status, "mem");
        guest.max_mem = get_u64(status, "maxmem");
        guest.disk = get_u64(status, "disk");
        guest.max_disk = get_u64(status, "maxdisk");
        guest.disk_read = get_u64(status, "diskread");
        guest.disk_write = get_u64(status, "diskwrite");
        guest.net_in = get_u64(status, "netin");
        guest.net_out = get_u64(status, "netout");
        guest.uptime = get_u64(status, "uptime");

        guest.template = get_flag(config, "template");
        guest.tags = get_opt_string(config, "tags");
        guest.agent_enabled = kind == GuestType::Qemu && agent_flag(config);
        guest.ip = config_ip(config);
        populate_configured_macs(&mut guest, config);
        guest.enriched = true;
        Ok(guest)
    }
}
