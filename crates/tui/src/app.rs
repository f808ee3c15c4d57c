//! Dashboard state
//!
//! All snapshot consumers run on the UI thread; the snapshot itself is an
//! immutable `Arc` swapped atomically on refresh, so nothing here takes a
//! lock. Key handling produces effects that the dispatcher turns into
//! worker commands or process launches.

use crossterm::event::{KeyCode, KeyEvent};
use pvedash_api::GuestAction;
use pvedash_common::{Cluster, Guest, GuestStatus, GuestType, Node};
use ratatui::widgets::{ListState, TableState};
use std::sync::Arc;
use std::time::Instant;

/// The four focusable panes, in left-to-right order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusPane {
    #[default]
    NodeList,
    NodeDetails,
    GuestList,
    GuestDetails,
}

impl FocusPane {
    pub fn next(self) -> Self {
        match self {
            FocusPane::NodeList => FocusPane::NodeDetails,
            FocusPane::NodeDetails => FocusPane::GuestList,
            FocusPane::GuestList => FocusPane::GuestDetails,
            FocusPane::GuestDetails => FocusPane::NodeList,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            FocusPane::NodeList => FocusPane::GuestDetails,
            FocusPane::NodeDetails => FocusPane::NodeList,
            FocusPane::GuestList => FocusPane::NodeDetails,
            FocusPane::GuestDetails => FocusPane::GuestList,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            FocusPane::NodeList => "Nodes",
            FocusPane::NodeDetails => "Node",
            FocusPane::GuestList => "Guests",
            FocusPane::GuestDetails => "Guest",
        }
    }
}

/// Detail-panel state machine: Idle -> Loading -> Ready | Error
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Error(String),
}

/// Per-list filter: current substring plus edit mode
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    pub query: String,
    pub editing: bool,
}

impl FilterState {
    pub fn is_active(&self) -> bool {
        !self.query.is_empty()
    }
}

/// Case-insensitive substring filter over display texts. Pure; re-derived
/// from the original list on every keystroke.
pub fn filter_indices<'a>(
    texts: impl Iterator<Item = &'a str>,
    query: &str,
) -> Vec<usize> {
    let needle = query.to_lowercase();
    texts
        .enumerate()
        .filter(|(_, text)| needle.is_empty() || text.to_lowercase().contains(&needle))
        .map(|(i, _)| i)
        .collect()
}

/// Transient message in the footer
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub text: String,
    pub is_error: bool,
    pub set_at: Instant,
}

/// What a key press asks the dispatcher to do
#[derive(Debug)]
pub enum UiEffect {
    Refresh,
    FetchGuestDetail {
        node: String,
        kind: GuestType,
        vmid: u32,
    },
    GuestAction {
        guest: Guest,
        action: GuestAction,
    },
    OpenGuestConsole {
        guest: Guest,
    },
    OpenNodeConsole {
        node: String,
    },
    OpenShell(ShellTarget),
    Quit,
}

#[derive(Debug)]
pub enum ShellTarget {
    Node { ip: String },
    Lxc { node_ip: String, vmid: u32 },
    Qemu { vm_ip: String },
}

pub struct App {
    pub snapshot: Option<Arc<Cluster>>,
    pub focus: FocusPane,
    pub node_filter: FilterState,
    pub guest_filter: FilterState,
    /// Indices into `snapshot.nodes`
    pub filtered_nodes: Vec<usize>,
    /// (node index, guest index) pairs in display order
    pub filtered_guests: Vec<(usize, usize)>,
    pub node_state: ListState,
    pub guest_state: TableState,
    pub detail_state: LoadState,
    /// Result of an explicit detail fetch for the selected guest
    pub guest_detail: Option<Guest>,
    pub details_scroll: u16,
    pub status: Option<StatusLine>,
    pub refreshing: bool,
    pub should_quit: bool,
}

impl App {
    pub fn new() -> Self {
        let mut node_state = ListState::default();
        node_state.select(Some(0));
        let mut guest_state = TableState::default();
        guest_state.select(Some(0));
        App {
            snapshot: None,
            focus: FocusPane::default(),
            node_filter: FilterState::default(),
            guest_filter: FilterState::default(),
            filtered_nodes: Vec::new(),
            filtered_guests: Vec::new(),
            node_state,
            guest_state,
            detail_state: LoadState::Idle,
            guest_detail: None,
            details_scroll: 0,
            status: None,
            refreshing: false,
            should_quit: false,
        }
    }

    // ------------------------------------------------------------------
    // Snapshot handling

    /// Swap in a new snapshot, remapping list selections by identity.
    pub fn apply_snapshot(&mut self, snapshot: Arc<Cluster>) {
        let selected_node = self.selected_node().map(|n| n.name.clone());
        let selected_guest = self.selected_guest().map(|g| (g.node.clone(), g.vmid));

        self.snapshot = Some(snapshot);
        self.apply_filters();

        if let Some(name) = selected_node {
            self.select_node_by_name(&name);
        }
        if let Some((node, vmid)) = selected_guest {
            self.select_guest_by_identity(&node, vmid);
        }
        self.clamp_selections();
        self.refreshing = false;
    }

    /// Re-derive both filtered views from the snapshot.
    pub fn apply_filters(&mut self) {
        let Some(snapshot) = &self.snapshot else {
            self.filtered_nodes.clear();
            self.filtered_guests.clear();
            return;
        };

        let node_texts: Vec<String> = snapshot.nodes.iter().map(node_display_text).collect();
        self.filtered_nodes =
            filter_indices(node_texts.iter().map(String::as_str), &self.node_filter.query);

        let all_guests: Vec<(usize, usize)> = snapshot
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(ni, n)| (0..n.guests.len()).map(move |gi| (ni, gi)))
            .collect();
        let guest_texts: Vec<String> = all_guests
            .iter()
            .map(|&(ni, gi)| guest_display_text(&snapshot.nodes[ni].guests[gi]))
            .collect();
        let kept = filter_indices(
            guest_texts.iter().map(String::as_str),
            &self.guest_filter.query,
        );
        self.filtered_guests = kept.into_iter().map(|i| all_guests[i]).collect();

        self.clamp_selections();
    }

    fn clamp_selections(&mut self) {
        let clamp = |selected: Option<usize>, len: usize| -> Option<usize> {
            if len == 0 {
                None
            } else {
                Some(selected.unwrap_or(0).min(len - 1))
            }
        };
        let sel = clamp(self.node_state.selected(), self.filtered_nodes.len());
        self.node_state.select(sel);
        let sel = clamp(self.guest_state.selected(), self.filtered_guests.len());
        self.guest_state.select(sel);
    }

    fn select_node_by_name(&mut self, name: &str) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        if let Some(pos) = self
            .filtered_nodes
            .iter()
            .position(|&i| snapshot.nodes[i].name == name)
        {
            self.node_state.select(Some(pos));
        }
    }

    fn select_guest_by_identity(&mut self, node: &str, vmid: u32) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        if let Some(pos) = self.filtered_guests.iter().position(|&(ni, gi)| {
            let g = &snapshot.nodes[ni].guests[gi];
            g.node == node && g.vmid == vmid
        }) {
            self.guest_state.select(Some(pos));
        }
    }

    pub fn selected_node(&self) -> Option<&Node> {
        let snapshot = self.snapshot.as_ref()?;
        let pos = self.node_state.selected()?;
        let idx = *self.filtered_nodes.get(pos)?;
        snapshot.nodes.get(idx)
    }

    pub fn selected_guest(&self) -> Option<&Guest> {
        let snapshot = self.snapshot.as_ref()?;
        let pos = self.guest_state.selected()?;
        let (ni, gi) = *self.filtered_guests.get(pos)?;
        snapshot.nodes.get(ni)?.guests.get(gi)
    }

    pub fn set_status(&mut self, text: impl Into<String>, is_error: bool) {
        self.status = Some(StatusLine {
            text: text.into(),
            is_error,
            set_at: Instant::now(),
        });
    }

    /// Drop transient messages after a few seconds.
    pub fn on_tick(&mut self) {
        if let Some(status) = &self.status {
            if status.set_at.elapsed().as_secs() >= 5 {
                self.status = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Key handling

    /// Route a key to the focused pane; unconsumed keys fall through to
    /// the global bindings.
    pub fn handle_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        if self.active_filter_editing() {
            self.handle_filter_key(key);
            return None;
        }

        // An errored detail panel resets on any key.
        if matches!(self.detail_state, LoadState::Error(_)) {
            self.detail_state = LoadState::Idle;
            return None;
        }

        if let Some(effect) = self.pane_handle_key(key) {
            return Some(effect);
        }
        self.global_handle_key(key)
    }

    fn active_filter_editing(&self) -> bool {
        self.node_filter.editing || self.guest_filter.editing
    }

    fn handle_filter_key(&mut self, key: KeyEvent) {
        let filter = if self.node_filter.editing {
            &mut self.node_filter
        } else {
            &mut self.guest_filter
        };
        match key.code {
            KeyCode::Esc => {
                filter.query.clear();
                filter.editing = false;
            }
            KeyCode::Enter => filter.editing = false,
            KeyCode::Backspace => {
                filter.query.pop();
            }
            KeyCode::Char(c) => filter.query.push(c),
            _ => return,
        }
        self.apply_filters();
    }

    /// Pane capability: returns `Some` when the pane consumed the key.
    fn pane_handle_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        match self.focus {
            FocusPane::NodeList => self.node_list_key(key),
            FocusPane::GuestList => self.guest_list_key(key),
            FocusPane::NodeDetails | FocusPane::GuestDetails => self.details_key(key),
        }
    }

    fn node_list_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        match key.code {
            KeyCode::Char('j') | KeyCode::Down => {
                self.move_list_selection(1);
                None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.move_list_selection(-1);
                None
            }
            KeyCode::Char('v') => {
                let node = self.selected_node()?;
                Some(UiEffect::OpenNodeConsole {
                    node: node.name.clone(),
                })
            }
            KeyCode::Char('s') => {
                let node = self.selected_node()?;
                if node.ip.is_empty() {
                    self.set_status("no IP known for node", true);
                    return None;
                }
                Some(UiEffect::OpenShell(ShellTarget::Node {
                    ip: node.ip.clone(),
                }))
            }
            _ => None,
        }
    }

    fn guest_list_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        match key.code {
            KeyCode::Char('j') | KeyCode::Down => {
                self.move_list_selection(1);
                None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.move_list_selection(-1);
                None
            }
            KeyCode::Enter => {
                let guest = self.selected_guest()?;
                let effect = UiEffect::FetchGuestDetail {
                    node: guest.node.clone(),
                    kind: guest.kind,
                    vmid: guest.vmid,
                };
                self.detail_state = LoadState::Loading;
                self.guest_detail = None;
                Some(effect)
            }
            KeyCode::Char('v') => {
                let guest = self.selected_guest()?.clone();
                Some(UiEffect::OpenGuestConsole { guest })
            }
            KeyCode::Char('s') => self.shell_effect_for_selected(),
            KeyCode::Char('S') => self.action_effect(GuestAction::Start),
            KeyCode::Char('X') => self.action_effect(GuestAction::Stop),
            KeyCode::Char('B') => self.action_effect(GuestAction::Restart),
            _ => None,
        }
    }

    fn details_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        match key.code {
            KeyCode::Char('j') | KeyCode::Down => {
                self.details_scroll = self.details_scroll.saturating_add(1);
                None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.details_scroll = self.details_scroll.saturating_sub(1);
                None
            }
            _ => None,
        }
    }

    fn global_handle_key(&mut self, key: KeyEvent) -> Option<UiEffect> {
        match key.code {
            KeyCode::Char('q') => Some(UiEffect::Quit),
            KeyCode::Char('r') => {
                self.refreshing = true;
                self.set_status("refreshing...", false);
                Some(UiEffect::Refresh)
            }
            KeyCode::Char('/') => {
                match self.focus {
                    FocusPane::NodeList => self.node_filter.editing = true,
                    FocusPane::GuestList => self.guest_filter.editing = true,
                    _ => {}
                }
                None
            }
            KeyCode::Esc => {
                match self.focus {
                    FocusPane::NodeList => self.node_filter.query.clear(),
                    FocusPane::GuestList => self.guest_filter.query.clear(),
                    _ => {}
                }
                self.apply_filters();
                None
            }
            KeyCode::Char('l') | KeyCode::Right | KeyCode::Tab => {
                self.focus = self.focus.next();
                None
            }
            KeyCode::Char('h') | KeyCode::Left => {
                self.focus = self.focus.prev();
                None
            }
            _ => None,
        }
    }

    fn move_list_selection(&mut self, delta: i64) {
        let (state, len) = match self.focus {
            FocusPane::NodeList => (
                &mut self.node_state as &mut dyn SelectableState,
                self.filtered_nodes.len(),
            ),
            FocusPane::GuestList => (
                &mut self.guest_state as &mut dyn SelectableState,
                self.filtered_guests.len(),
            ),
            _ => return,
        };
        if len == 0 {
            return;
        }
        let current = state.selected().unwrap_or(0) as i64;
        let next = (current + delta).clamp(0, len as i64 - 1) as usize;
        state.select(Some(next));

        // Selection change invalidates any fetched guest detail.
        if self.focus == FocusPane::GuestList {
            self.detail_state = LoadState::Idle;
            self.guest_detail = None;
            self.details_scroll = 0;
        }
    }

    fn shell_effect_for_selected(&mut self) -> Option<UiEffect> {
        let snapshot = self.snapshot.as_ref()?;
        let guest = self.selected_guest()?;
        let node_ip = snapshot
            .find_node(&guest.node)
            .map(|n| n.ip.clone())
            .unwrap_or_default();
        match guest.kind {
            GuestType::Lxc => {
                if node_ip.is_empty() {
                    self.set_status("no IP known for node", true);
                    return None;
                }
                Some(UiEffect::OpenShell(ShellTarget::Lxc {
                    node_ip,
                    vmid: guest.vmid,
                }))
            }
            GuestType::Qemu => match &guest.ip {
                Some(ip) => Some(UiEffect::OpenShell(ShellTarget::Qemu {
                    vm_ip: ip.clone(),
                })),
                None => {
                    self.set_status("guest has no known IP", true);
                    None
                }
            },
        }
    }

    fn action_effect(&mut self, action: GuestAction) -> Option<UiEffect> {
        let guest = self.selected_guest()?.clone();
        if guest.template && action == GuestAction::Start {
            self.set_status("templates cannot be started", true);
            return None;
        }
        if action == GuestAction::Start && guest.status == GuestStatus::Running {
            self.set_status("guest is already running", false);
            return None;
        }
        self.set_status(
            format!("{} {} ({})...", action.api_segment(), guest.name, guest.vmid),
            false,
        );
        Some(UiEffect::GuestAction { guest, action })
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// List/table selection under one interface
trait SelectableState {
    fn selected(&self) -> Option<usize>;
    fn select(&mut self, index: Option<usize>);
}

impl SelectableState for ListState {
    fn selected(&self) -> Option<usize> {
        ListState::selected(self)
    }
    fn select(&mut self, index: Option<usize>) {
        ListState::select(self, index)
    }
}

impl SelectableState for TableState {
    fn selected(&self) -> Option<usize> {
        TableState::selected(self)
    }
    fn select(&mut self, index: Option<usize>) {
        TableState::select(self, index)
    }
}

pub fn node_display_text(node: &Node) -> String {
    node.name.clone()
}

pub fn guest_display_text(guest: &Guest) -> String {
    format!(
        "{} {} {} {}",
        guest.vmid, guest.name, guest.node, guest.kind
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn test_snapshot() -> Arc<Cluster> {
        let mut guest_a = Guest::new(100, "alpha", GuestType::Qemu);
        guest_a.name = "web-frontend".to_string();
        guest_a.status = GuestStatus::Running;
        guest_a.ip = Some("10.0.0.5".to_string());
        let mut guest_b = Guest::new(200, "beta", GuestType::Lxc);
        guest_b.name = "database".to_string();
        Arc::new(Cluster {
            nodes: vec![
                Node {
                    name: "alpha".to_string(),
                    ip: "10.0.0.1".to_string(),
                    online: true,
                    guests: vec![guest_a],
                    ..Default::default()
                },
                Node {
                    name: "beta".to_string(),
                    ip: "10.0.0.2".to_string(),
                    online: true,
                    guests: vec![guest_b],
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
    }

    #[test]
    fn filtered_view_is_subset_with_substring() {
        let texts = ["web-frontend", "database", "Web-Backend"];
        let kept = filter_indices(texts.iter().copied(), "web");
        assert_eq!(kept, vec![0, 2]);
        for &i in &kept {
            assert!(texts[i].to_lowercase().contains("web"));
        }
        // Empty query keeps everything.
        assert_eq!(filter_indices(texts.iter().copied(), "").len(), 3);
    }

    #[test]
    fn guest_filter_rederives_on_each_keystroke() {
        let mut app = App::new();
        app.apply_snapshot(test_snapshot());
        assert_eq!(app.filtered_guests.len(), 2);

        app.focus = FocusPane::GuestList;
        app.handle_key(key(KeyCode::Char('/')));
        app.handle_key(key(KeyCode::Char('d')));
        app.handle_key(key(KeyCode::Char('a')));
        assert_eq!(app.filtered_guests.len(), 1);
        assert_eq!(app.selected_guest().unwrap().name, "database");

        // Backspace widens the view again.
        app.handle_key(key(KeyCode::Backspace));
        app.handle_key(key(KeyCode::Backspace));
        assert_eq!(app.filtered_guests.len(), 2);
    }

    #[test]
    fn selection_remapped_by_identity_across_refresh() {
        let mut app = App::new();
        app.apply_snapshot(test_snapshot());
        app.focus = FocusPane::GuestList;
        app.move_list_selection(1);
        assert_eq!(app.selected_guest().unwrap().vmid, 200);

        // New snapshot with the guest order reversed.
        let snapshot = test_snapshot();
        let mut reordered = (*snapshot).clone();
        reordered.nodes.reverse();
        app.apply_snapshot(Arc::new(reordered));
        assert_eq!(app.selected_guest().unwrap().vmid, 200);
    }

    #[test]
    fn focus_cycles_through_four_panes() {
        let mut app = App::new();
        assert_eq!(app.focus, FocusPane::NodeList);
        app.handle_key(key(KeyCode::Char('l')));
        assert_eq!(app.focus, FocusPane::NodeDetails);
        app.handle_key(key(KeyCode::Char('l')));
        assert_eq!(app.focus, FocusPane::GuestList);
        app.handle_key(key(KeyCode::Char('h')));
        assert_eq!(app.focus, FocusPane::NodeDetails);
    }

    #[test]
    fn error_state_resets_on_any_key() {
        let mut app = App::new();
        app.apply_snapshot(test_snapshot());
        app.detail_state = LoadState::Error("boom".to_string());
        let effect = app.handle_key(key(KeyCode::Char('q')));
        assert!(effect.is_none());
        assert_eq!(app.detail_state, LoadState::Idle);
    }

    #[test]
    fn enter_on_guest_moves_panel_to_loading() {
        let mut app = App::new();
        app.apply_snapshot(test_snapshot());
        app.focus = FocusPane::GuestList;
        let effect = app.handle_key(key(KeyCode::Enter));
        assert!(matches!(
            effect,
            Some(UiEffect::FetchGuestDetail { vmid: 100, .. })
        ));
        assert_eq!(app.detail_state, LoadState::Loading);
    }

    #[test]
    fn template_blocks_start_but_not_stop() {
        let mut app = App::new();
        let snapshot = test_snapshot();
        let mut cluster = (*snapshot).clone();
        cluster.nodes[0].guests[0].template = true;
        cluster.nodes[0].guests[0].status = GuestStatus::Stopped;
        app.apply_snapshot(Arc::new(cluster));
        app.focus = FocusPane::GuestList;

        assert!(app.handle_key(key(KeyCode::Char('S'))).is_none());
        assert!(app.status.as_ref().unwrap().is_error);

        app.status = None;
        assert!(matches!(
            app.handle_key(key(KeyCode::Char('X'))),
            Some(UiEffect::GuestAction {
                action: GuestAction::Stop,
                ..
            })
        ));
    }

    #[test]
    fn qemu_shell_requires_known_ip() {
        let mut app = App::new();
        let snapshot = test_snapshot();
        let mut cluster = (*snapshot).clone();
        cluster.nodes[0].guests[0].ip = None;
        app.apply_snapshot(Arc::new(cluster));
        app.focus = FocusPane::GuestList;
        let effect = app.handle_key(key(KeyCode::Char('s')));
        assert!(effect.is_none());
        assert!(app.status.as_ref().unwrap().is_error);
    }
}
