use ratatui::style::{Color, Modifier, Style};

use crate::aggregator::Finality;

pub const ACCENT: Color = Color::Rgb(255, 105, 180);

pub const TITLE_STYLE: Style = Style::new().fg(ACCENT).add_modifier(Modifier::BOLD);
pub const BORDER_STYLE: Style = Style::new().fg(ACCENT);
pub const STATUS_STYLE: Style = Style::new().fg(Color::Gray);

pub fn finality_color(finality: Finality) -> Color {
    match finality {
        Finality::ProposedNewEpoch => ACCENT,
        Finality::Proposed => Color::Rgb(255, 0, 0),
        Finality::Confirmed => Color::Rgb(0, 255, 0),
        Finality::Finalized => Color::Rgb(0, 0, 255),
    }
}

pub fn finality_style(finality: Finality) -> Style {
    Style::new().fg(finality_color(finality))
}
