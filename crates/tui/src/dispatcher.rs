//! UI event dispatcher
//!
//! Two event sources feed the single-threaded UI loop: key events from the
//! terminal and draw jobs posted by background workers. A draw job is a
//! closure executed on the UI thread before the next repaint, which keeps
//! every snapshot consumer lock-free.
//!
//! The worker side runs on the tokio runtime; commands flow one way, draw
//! jobs flow back.

use crate::app::{App, LoadState, ShellTarget, UiEffect};
use crate::config::Config;
use crate::shell::{ShellLauncher, SshLauncher};
use crate::ui;
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use pvedash_api::{Aggregator, Client, GuestAction, SnapshotCallback};
use pvedash_common::Guest;
use pvedash_web::{VncBridge, VncSession};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, warn};

/// Closure run on the UI thread before the next repaint
pub type DrawJob = Box<dyn FnOnce(&mut App) + Send>;

/// Everything the workers need, passed explicitly
pub struct AppContext {
    pub config: Config,
    pub client: Arc<Client>,
    pub aggregator: Arc<Aggregator>,
    pub bridge: Arc<VncBridge>,
}

/// Work items sent from the UI thread to the worker task
enum Command {
    Refresh {
        bypass: bool,
    },
    FetchGuestDetail {
        node: String,
        kind: pvedash_common::GuestType,
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
}

type Backend = CrosstermBackend<io::Stdout>;

pub fn setup_terminal() -> anyhow::Result<Terminal<Backend>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    terminal.clear()?;
    Ok(terminal)
}

pub fn restore_terminal(terminal: &mut Terminal<Backend>) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Run the dashboard loop. Blocks the calling thread until quit.
pub fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let (draw_tx, draw_rx) = mpsc::channel::<DrawJob>();
    let cmd_tx = spawn_worker(Arc::clone(&ctx), draw_tx);

    let mut app = App::new();
    app.refreshing = true;
    app.set_status("loading cluster...", false);
    let _ = cmd_tx.send(Command::Refresh { bypass: false });

    let mut terminal = setup_terminal()?;
    let result = event_loop(&mut terminal, &mut app, &ctx, &cmd_tx, &draw_rx);
    restore_terminal(&mut terminal)?;
    result
}

fn event_loop(
    terminal: &mut Terminal<Backend>,
    app: &mut App,
    ctx: &AppContext,
    cmd_tx: &UnboundedSender<Command>,
    draw_rx: &mpsc::Receiver<DrawJob>,
) -> anyhow::Result<()> {
    let input_poll = Duration::from_millis(100);
    let tick_rate = Duration::from_millis(500);
    let mut last_tick = Instant::now();

    loop {
        // Draw jobs run before the repaint they affect.
        while let Ok(job) = draw_rx.try_recv() {
            job(app);
        }

        terminal.draw(|f| ui::render(f, app))?;

        if event::poll(input_poll)? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                    if let Some(effect) = app.handle_key(key) {
                        perform_effect(terminal, app, ctx, cmd_tx, effect)?;
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn perform_effect(
    terminal: &mut Terminal<Backend>,
    app: &mut App,
    ctx: &AppContext,
    cmd_tx: &UnboundedSender<Command>,
    effect: UiEffect,
) -> anyhow::Result<()> {
    match effect {
        UiEffect::Quit => app.should_quit = true,
        UiEffect::Refresh => {
            let _ = cmd_tx.send(Command::Refresh { bypass: true });
        }
        UiEffect::FetchGuestDetail { node, kind, vmid } => {
            let _ = cmd_tx.send(Command::FetchGuestDetail { node, kind, vmid });
        }
        UiEffect::GuestAction { guest, action } => {
            let _ = cmd_tx.send(Command::GuestAction { guest, action });
        }
        UiEffect::OpenGuestConsole { guest } => {
            app.set_status(format!("opening console for {}...", guest.name), false);
            let _ = cmd_tx.send(Command::OpenGuestConsole { guest });
        }
        UiEffect::OpenNodeConsole { node } => {
            app.set_status(format!("opening console for {}...", node), false);
            let _ = cmd_tx.send(Command::OpenNodeConsole { node });
        }
        UiEffect::OpenShell(target) => {
            // The external process owns the terminal until it exits.
            restore_terminal(terminal)?;
            let launcher = SshLauncher;
            let user = &ctx.config.ssh_user;
            let status = match &target {
                ShellTarget::Node { ip } => launcher.open_node_shell(user, ip),
                ShellTarget::Lxc { node_ip, vmid } => {
                    launcher.open_lxc_shell(user, node_ip, *vmid)
                }
                ShellTarget::Qemu { vm_ip } => launcher.open_qemu_shell(user, vm_ip),
            };
            *terminal = setup_terminal()?;
            match status {
                Ok(code) if code.success() => {}
                Ok(code) => app.set_status(format!("shell exited with {}", code), true),
                Err(e) => app.set_status(format!("could not launch ssh: {}", e), true),
            }
        }
    }
    Ok(())
}

/// Worker task: executes commands on the runtime, posts results back as
/// draw jobs. Console sessions stay alive here for the app's lifetime.
fn spawn_worker(ctx: Arc<AppContext>, draw_tx: mpsc::Sender<DrawJob>) -> UnboundedSender<Command> {
    let (cmd_tx, mut cmd_rx) = unbounded_channel::<Command>();

    tokio::spawn(async move {
        let mut sessions: Vec<VncSession> = Vec::new();
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Refresh { bypass } => refresh(&ctx, &draw_tx, bypass),
                Command::FetchGuestDetail { node, kind, vmid } => {
                    let client = Arc::clone(&ctx.client);
                    let draw = draw_tx.clone();
                    tokio::spawn(async move {
                        let result = client.get_guest_detail(&node, kind, vmid).await;
                        let _ = draw.send(Box::new(move |app| match result {
                            Ok(guest) => {
                                app.guest_detail = Some(guest);
                                app.detail_state = LoadState::Ready;
                            }
                            Err(e) => {
                                app.detail_state = LoadState::Error(e.to_string());
                            }
                        }));
                    });
                }
                Command::GuestAction { guest, action } => {
                    let client = Arc::clone(&ctx.client);
                    let draw = draw_tx.clone();
                    tokio::spawn(async move {
                        let label = format!("{} {}", action.api_segment(), guest.name);
                        let result = client.guest_action(&guest, action).await;
                        let _ = draw.send(Box::new(move |app| match result {
                            Ok(()) => app.set_status(format!("{label} requested"), false),
                            Err(e) => app.set_status(format!("{label} failed: {e}"), true),
                        }));
                    });
                }
                Command::OpenGuestConsole { guest } => {
                    match ctx.bridge.connect_to_guest(&guest).await {
                        Ok(session) => {
                            post_console_ready(&draw_tx, &session);
                            sessions.push(session);
                        }
                        Err(e) => post_console_error(&draw_tx, e),
                    }
                }
                Command::OpenNodeConsole { node } => {
                    match ctx.bridge.connect_to_node(&node).await {
                        Ok(session) => {
                            post_console_ready(&draw_tx, &session);
                            sessions.push(session);
                        }
                        Err(e) => post_console_error(&draw_tx, e),
                    }
                }
            }
        }
        debug!("worker channel closed, {} console sessions drop", sessions.len());
    });

    cmd_tx
}

fn refresh(ctx: &Arc<AppContext>, draw_tx: &mpsc::Sender<DrawJob>, bypass: bool) {
    let agg = Arc::clone(&ctx.aggregator);
    let draw = draw_tx.clone();
    let enrich_draw = draw_tx.clone();

    tokio::spawn(async move {
        let callback: SnapshotCallback = Box::new(move |cluster, err| {
            let _ = enrich_draw.send(Box::new(move |app| {
                app.apply_snapshot(cluster);
                if let Some(e) = err {
                    app.set_status(format!("{e}"), true);
                }
            }));
        });

        match agg.build_snapshot(true, bypass, Some(callback)).await {
            Ok(Some(outcome)) => {
                let error = outcome.error;
                let cluster = outcome.cluster;
                let _ = draw.send(Box::new(move |app| {
                    app.apply_snapshot(cluster);
                    match error {
                        Some(e) => app.set_status(format!("{e}"), true),
                        None => app.set_status("cluster loaded", false),
                    }
                }));
            }
            Ok(None) => {
                let _ = draw.send(Box::new(|app| {
                    app.set_status("refresh already in progress", false);
                }));
            }
            Err(e) => {
                warn!("snapshot build failed: {}", e);
                let _ = draw.send(Box::new(move |app| {
                    app.refreshing = false;
                    app.set_status(format!("refresh failed: {e}"), true);
                }));
            }
        }
    });
}

fn post_console_ready(draw_tx: &mpsc::Sender<DrawJob>, session: &VncSession) {
    let url = session.local_url.clone();
    let _ = draw_tx.send(Box::new(move |app| {
        app.set_status(format!("console at {url}"), false);
    }));
}

fn post_console_error(draw_tx: &mpsc::Sender<DrawJob>, e: pvedash_common::Error) {
    let _ = draw_tx.send(Box::new(move |app| {
        app.set_status(format!("console failed: {e}"), true);
    }));
}
