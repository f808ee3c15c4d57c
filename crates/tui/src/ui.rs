//! Rendering
//!
//! Layout: a one-line cluster header, two columns (lists on the left,
//! details on the right) and a footer carrying the transient status line
//! and key hints.

use crate::app::{App, FocusPane, LoadState};
use crate::theme::{self, icons};
use pvedash_common::{Guest, GuestType, Node};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table, Wrap},
    Frame,
};

pub fn render(f: &mut Frame, app: &mut App) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(f.size());

    render_header(f, app, rows[0]);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(rows[1]);

    let lists = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(columns[0]);
    render_node_list(f, app, lists[0]);
    render_guest_list(f, app, lists[1]);

    let details = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(columns[1]);
    render_node_details(f, app, details[0]);
    render_guest_details(f, app, details[1]);

    render_footer(f, app, rows[2]);
}

fn render_header(f: &mut Frame, app: &App, area: Rect) {
    let line = match &app.snapshot {
        Some(cluster) => {
            let quorum = if cluster.quorate { "quorate" } else { "NO QUORUM" };
            Line::from(vec![
                Span::styled(format!(" {} ", cluster.name), theme::HEADER_STYLE),
                Span::styled(format!("{} ", cluster.version), theme::DIM_STYLE),
                Span::raw(format!(
                    "| {}/{} nodes | {} | cpu {:>5.1}% | mem {} / {} | disk {} / {}",
                    cluster.online_nodes,
                    cluster.total_nodes,
                    quorum,
                    cluster.cpu_usage * 100.0,
                    format_bytes(cluster.memory_used),
                    format_bytes(cluster.memory_total),
                    format_bytes(cluster.storage_used),
                    format_bytes(cluster.storage_total),
                )),
            ])
        }
        None => Line::from(Span::styled(" connecting...", theme::DIM_STYLE)),
    };
    f.render_widget(Paragraph::new(line), area);
}

fn list_title(base: &str, filter_query: &str, editing: bool) -> String {
    if editing {
        format!("{base} /{filter_query}_")
    } else if !filter_query.is_empty() {
        format!("{base} /{filter_query}")
    } else {
        base.to_string()
    }
}

fn render_node_list(f: &mut Frame, app: &mut App, area: Rect) {
    let focused = app.focus == FocusPane::NodeList;
    let title = list_title("Nodes", &app.node_filter.query, app.node_filter.editing);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .border_style(theme::focused_border(focused));

    let items: Vec<ListItem> = match &app.snapshot {
        Some(cluster) => app
            .filtered_nodes
            .iter()
            .map(|&i| {
                let node = &cluster.nodes[i];
                let (icon, style) = if node.online {
                    (icons::ONLINE, theme::OK_STYLE)
                } else {
                    (icons::OFFLINE, theme::ERROR_STYLE)
                };
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{icon} "), style),
                    Span::raw(node.name.clone()),
                    Span::styled(
                        format!("  {} guests", node.guests.len()),
                        theme::DIM_STYLE,
                    ),
                ]))
            })
            .collect(),
        None => vec![ListItem::new("loading...")],
    };

    let list = List::new(items)
        .block(block)
        .highlight_style(theme::SELECTED_STYLE);
    f.render_stateful_widget(list, area, &mut app.node_state);
}

fn render_guest_list(f: &mut Frame, app: &mut App, area: Rect) {
    let focused = app.focus == FocusPane::GuestList;
    let title = list_title("Guests", &app.guest_filter.query, app.guest_filter.editing);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .border_style(theme::focused_border(focused));

    let rows: Vec<Row> = match &app.snapshot {
        Some(cluster) => app
            .filtered_guests
            .iter()
            .map(|&(ni, gi)| {
                let guest = &cluster.nodes[ni].guests[gi];
                let kind = match guest.kind {
                    GuestType::Qemu => icons::QEMU,
                    GuestType::Lxc => icons::LXC,
                };
                Row::new(vec![
                    Cell::from(guest.vmid.to_string()),
                    Cell::from(kind),
                    Cell::from(guest.name.clone()),
                    Cell::from(guest.status.to_string()).style(
                        Style::default().fg(theme::status_color(&guest.status)),
                    ),
                    Cell::from(guest.node.clone()),
                    Cell::from(guest.ip.clone().unwrap_or_default()),
                ])
            })
            .collect(),
        None => Vec::new(),
    };

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(3),
            Constraint::Min(12),
            Constraint::Length(8),
            Constraint::Length(10),
            Constraint::Length(15),
        ],
    )
    .header(
        Row::new(vec!["id", "", "name", "status", "node", "ip"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(block)
    .highlight_style(theme::SELECTED_STYLE);
    f.render_stateful_widget(table, area, &mut app.guest_state);
}

fn render_node_details(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focus == FocusPane::NodeDetails;
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Node")
        .border_style(theme::focused_border(focused));
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(node) = app.selected_node() else {
        f.render_widget(
            Paragraph::new(Span::styled("no node selected", theme::DIM_STYLE)),
            inner,
        );
        return;
    };

    let text = node_detail_lines(node);
    let p = Paragraph::new(text)
        .wrap(Wrap { trim: true })
        .scroll((app.details_scroll, 0));
    f.render_widget(p, inner);
}

fn node_detail_lines(node: &Node) -> Vec<Line<'static>> {
    let mut lines = vec![
        detail_line("Node", node.name.clone()),
        detail_line(
            "Status",
            if node.online { "online" } else { "offline" }.to_string(),
        ),
        detail_line("IP", node.ip.clone()),
        detail_line("Version", short_pve_version(&node.version)),
        detail_line("Kernel", short_kernel(&node.kernel_version)),
        detail_line(
            "CPU",
            format!(
                "{:.1}% of {:.0} cores",
                node.cpu_usage * 100.0,
                node.cpu_count
            ),
        ),
    ];
    if let Some(info) = &node.cpu_info {
        lines.push(detail_line("Model", info.model.clone()));
        lines.push(detail_line(
            "Topology",
            format!("{} cores, {} sockets", info.cores, info.sockets),
        ));
    }
    if node.load_avg.len() >= 3 {
        lines.push(detail_line(
            "Load",
            format!(
                "{} {} {}",
                node.load_avg[0], node.load_avg[1], node.load_avg[2]
            ),
        ));
    }
    lines.push(detail_line(
        "Memory",
        format!(
            "{} / {}",
            format_bytes(node.memory_used),
            format_bytes(node.memory_total)
        ),
    ));
    lines.push(detail_line(
        "Storage",
        format!(
            "{} / {}",
            format_bytes(node.storage_used),
            format_bytes(node.storage_total)
        ),
    ));
    lines.push(detail_line("Uptime", format_uptime(node.uptime)));
    if !node.online {
        lines.push(Line::from(Span::styled(
            "metrics may be stale",
            theme::ERROR_STYLE,
        )));
    }
    lines
}

fn render_guest_details(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focus == FocusPane::GuestDetails;
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Guest")
        .border_style(theme::focused_border(focused));
    let inner = block.inner(area);
    f.render_widget(block, area);

    match &app.detail_state {
        LoadState::Loading => {
            f.render_widget(
                Paragraph::new(Span::styled("loading...", theme::LABEL_STYLE)),
                inner,
            );
            return;
        }
        LoadState::Error(e) => {
            f.render_widget(
                Paragraph::new(vec![
                    Line::from(Span::styled(e.clone(), theme::ERROR_STYLE)),
                    Line::from(Span::styled("press any key", theme::DIM_STYLE)),
                ]),
                inner,
            );
            return;
        }
        LoadState::Idle | LoadState::Ready => {}
    }

    // An explicitly fetched detail beats the snapshot's summary view.
    let detail = app.guest_detail.as_ref();
    let Some(guest) = detail.or_else(|| app.selected_guest()) else {
        f.render_widget(
            Paragraph::new(Span::styled("no guest selected", theme::DIM_STYLE)),
            inner,
        );
        return;
    };

    let p = Paragraph::new(guest_detail_lines(guest))
        .wrap(Wrap { trim: true })
        .scroll((app.details_scroll, 0));
    f.render_widget(p, inner);
}

fn guest_detail_lines(guest: &Guest) -> Vec<Line<'static>> {
    let mut lines = vec![
        detail_line("Guest", format!("{} ({})", guest.name, guest.vmid)),
        detail_line("Type", guest.kind.to_string()),
        detail_line("Node", guest.node.clone()),
        detail_line("Status", guest.status.to_string()),
    ];
    if guest.template {
        lines.push(detail_line("Template", "yes".to_string()));
    }
    if let Some(ip) = &guest.ip {
        lines.push(detail_line("IP", ip.clone()));
    }
    lines.push(detail_line("CPU", format!("{:.1}%", guest.cpu * 100.0)));
    lines.push(detail_line(
        "Memory",
        format!(
            "{} / {}",
            format_bytes(guest.mem),
            format_bytes(guest.max_mem)
        ),
    ));
    lines.push(detail_line(
        "Disk",
        format!(
            "{} / {}",
            format_bytes(guest.disk),
            format_bytes(guest.max_disk)
        ),
    ));
    lines.push(detail_line("Uptime", format_uptime(guest.uptime)));
    if let Some(ha) = &guest.ha_state {
        lines.push(detail_line("HA", ha.clone()));
    }
    if let Some(tags) = &guest.tags {
        lines.push(detail_line("Tags", tags.clone()));
    }
    if guest.kind == GuestType::Qemu {
        let agent = match (guest.agent_enabled, guest.agent_running) {
            (true, true) => "running",
            (true, false) => "enabled, not running",
            (false, _) => "disabled",
        };
        lines.push(detail_line("Agent", agent.to_string()));
    }
    if !guest.net_interfaces.is_empty() {
        lines.push(Line::from(Span::styled("Interfaces", theme::LABEL_STYLE)));
        for iface in &guest.net_interfaces {
            let ip = iface
                .ip_addresses
                .first()
                .map(|ip| ip.address.clone())
                .unwrap_or_else(|| "-".to_string());
            lines.push(Line::from(format!(
                "  {} {} {}",
                iface.name, iface.mac_address, ip
            )));
        }
    }
    if !guest.filesystems.is_empty() {
        lines.push(Line::from(Span::styled("Filesystems", theme::LABEL_STYLE)));
        for fs in &guest.filesystems {
            lines.push(Line::from(format!(
                "  {} {} {} / {}",
                fs.mountpoint,
                fs.kind,
                format_bytes(fs.used_bytes),
                format_bytes(fs.total_bytes)
            )));
        }
    }
    lines
}

fn render_footer(f: &mut Frame, app: &App, area: Rect) {
    let line = match &app.status {
        Some(status) => {
            let style = if status.is_error {
                theme::ERROR_STYLE
            } else {
                theme::OK_STYLE
            };
            Line::from(Span::styled(format!(" {}", status.text), style))
        }
        None => Line::from(Span::styled(
            " q quit | r refresh | / filter | v console | s shell | S/X/B start/stop/restart",
            theme::DIM_STYLE,
        )),
    };
    f.render_widget(Paragraph::new(line), area);
}

fn detail_line(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label:<10}"), theme::LABEL_STYLE),
        Span::raw(value),
    ])
}

/// "pve-manager/8.3.5/hash" -> "8.3.5"
fn short_pve_version(version: &str) -> String {
    version.split('/').nth(1).unwrap_or(version).to_string()
}

/// "Linux 6.8.12-8-pve" -> "6.8.12"
fn short_kernel(kernel: &str) -> String {
    kernel
        .split_whitespace()
        .find(|part| part.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(|v| v.split('-').next().unwrap_or(v).to_string())
        .unwrap_or_else(|| kernel.to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatted_with_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn versions_shortened_for_display() {
        assert_eq!(short_pve_version("pve-manager/8.3.5/dac3aa8"), "8.3.5");
        assert_eq!(short_pve_version("8.3.5"), "8.3.5");
        assert_eq!(short_kernel("Linux 6.8.12-8-pve"), "6.8.12");
    }

    #[test]
    fn uptime_rendered_compactly() {
        assert_eq!(format_uptime(90), "1m");
        assert_eq!(format_uptime(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_uptime(2 * 86_400 + 3600), "2d 1h 0m");
    }
}
