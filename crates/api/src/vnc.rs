//! VNC proxy ticket acquisition
//!
//! One POST to the vncproxy endpoint yields a one-time ticket and the VNC
//! port the hypervisor opened. QEMU additionally supports a generated
//! one-time password; LXC rejects that flag.

use crate::client::Client;
use crate::value::{get_opt_string, get_str};
use pvedash_common::{Error, Guest, GuestType, Result};
use serde_json::Value;
use tracing::info;

/// Response from a vncproxy request
#[derive(Debug, Clone)]
pub struct VncTicket {
    pub ticket: String,
    pub port: String,
    pub user: Option<String>,
    /// One-time password; QEMU guests only
    pub password: Option<String>,
}

impl Client {
    /// Create a VNC proxy for a guest console.
    pub async fn vnc_proxy_guest(&self, guest: &Guest) -> Result<VncTicket> {
        let path = format!(
            "/nodes/{}/{}/{}/vncproxy",
            guest.node,
            guest.kind.api_segment(),
            guest.vmid
        );
        // LXC rejects generate-password.
        let form: &[(&str, &str)] = match guest.kind {
            GuestType::Qemu => &[("websocket", "1"), ("generate-password", "1")],
            GuestType::Lxc => &[("websocket", "1")],
        };
        let res = self
            .post(&path, form)
            .await
            .map_err(|e| match e {
                Error::AuthRejected(msg) => Error::AuthRejected(msg),
                other => Error::Network(format!("vncproxy failed: {other}")),
            })?;
        let ticket = parse_vnc_ticket(&path, &res)?;
        info!(
            "vnc proxy created for {}/{} on port {}",
            guest.node, guest.vmid, ticket.port
        );
        Ok(ticket)
    }

    /// Create a VNC proxy for a node shell.
    pub async fn vnc_proxy_node(&self, node: &str) -> Result<VncTicket> {
        let path = format!("/nodes/{}/vncproxy", node);
        let res = self
            .post(&path, &[("websocket", "1")])
            .await
            .map_err(|e| match e {
                Error::AuthRejected(msg) => Error::AuthRejected(msg),
                other => Error::Network(format!("vncproxy failed: {other}")),
            })?;
        let ticket = parse_vnc_ticket(&path, &res)?;
        info!("vnc proxy created for node {} on port {}", node, ticket.port);
        Ok(ticket)
    }

    /// Upstream websocket path for a guest console.
    pub fn vnc_websocket_path(&self, guest: &Guest, ticket: &VncTicket) -> String {
        format!(
            "{}/nodes/{}/{}/{}/vncwebsocket?port={}&vncticket={}",
            self.ws_base(),
            guest.node,
            guest.kind.api_segment(),
            guest.vmid,
            ticket.port,
            encode(&ticket.ticket)
        )
    }

    /// Upstream websocket path for a node shell.
    pub fn node_websocket_path(&self, node: &str, ticket: &VncTicket) -> String {
        format!(
            "{}/nodes/{}/vncwebsocket?port={}&vncticket={}",
            self.ws_base(),
            node,
            ticket.port,
            encode(&ticket.ticket)
        )
    }
}

fn encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn parse_vnc_ticket(path: &str, res: &Value) -> Result<VncTicket> {
    let data = res
        .get("data")
        .ok_or_else(|| Error::format(path, "missing data field"))?;
    let ticket = get_str(data, "ticket")
        .ok_or_else(|| Error::format(path, "missing ticket"))?
        .to_string();
    // The port arrives as a string on some releases and a number on others.
    let port = match data.get("port") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|f| format!("{:.0}", f))
            .unwrap_or_default(),
        _ => return Err(Error::format(path, "missing port")),
    };
    Ok(VncTicket {
        ticket,
        port,
        user: get_opt_string(data, "user"),
        password: get_opt_string(data, "password"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticket_parsed_with_string_port() {
        let res = json!({"data": {
            "ticket": "PVEVNC:abc==",
            "port": "5900",
            "user": "root@pam",
            "password": "onetime"
        }});
        let t = parse_vnc_ticket("/nodes/a/qemu/100/vncproxy", &res).unwrap();
        assert_eq!(t.port, "5900");
        assert_eq!(t.password.as_deref(), Some("onetime"));
    }

    #[test]
    fn ticket_parsed_with_numeric_port() {
        let res = json!({"data": {"ticket": "PVEVNC:abc==", "port": 5901}});
        let t = parse_vnc_ticket("/nodes/a/lxc/101/vncproxy", &res).unwrap();
        assert_eq!(t.port, "5901");
        assert!(t.password.is_none());
    }

    #[test]
    fn missing_ticket_is_format_error() {
        let res = json!({"data": {"port": "5900"}});
        assert!(matches!(
            parse_vnc_ticket("/nodes/a/qemu/100/vncproxy", &res),
            Err(Error::UpstreamFormat { .. })
        ));
    }

    #[test]
    fn tickets_are_query_encoded() {
        assert_eq!(encode("PVEVNC:1a2b=="), "PVEVNC%3A1a2b%3D%3D");
    }
}
