use pvedash_common::GuestStatus;
use ratatui::style::{Color, Modifier, Style};

pub const HEADER_STYLE: Style = Style::new()
    .fg(Color::Rgb(142, 192, 124))
    .add_modifier(Modifier::BOLD);
pub const SELECTED_STYLE: Style = Style::new()
    .bg(Color::Rgb(131, 165, 152))
    .fg(Color::Black)
    .add_modifier(Modifier::BOLD);
pub const LABEL_STYLE: Style = Style::new().fg(Color::Rgb(250, 189, 47));
pub const ERROR_STYLE: Style = Style::new().fg(Color::Rgb(251, 73, 52));
pub const OK_STYLE: Style = Style::new().fg(Color::Rgb(142, 192, 124));
pub const DIM_STYLE: Style = Style::new().fg(Color::Rgb(146, 131, 116));

pub fn focused_border(focused: bool) -> Style {
    if focused {
        Style::new().fg(Color::Rgb(131, 165, 152))
    } else {
        Style::new().fg(Color::Rgb(80, 73, 69))
    }
}

pub fn status_color(status: &GuestStatus) -> Color {
    match status {
        GuestStatus::Running => Color::Rgb(142, 192, 124),
        GuestStatus::Stopped => Color::Rgb(146, 131, 116),
        GuestStatus::Other(_) => Color::Rgb(250, 189, 47),
    }
}

pub mod icons {
    pub const ONLINE: &str = "●";
    pub const OFFLINE: &str = "○";
    pub const QEMU: &str = "vm";
    pub const LXC: &str = "ct";
}
