//! Terminal display shell.
//!
//! [`Dashboard`] owns the [`Aggregator`] and draws it; [`run`] is the single
//! consumer loop that fans in both subscription queues and terminal input.

pub mod theme;

use std::io::{self, Stdout};

use anyhow::{Context, Result};
use crossterm::cursor::Show;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures_util::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph};
use ratatui::{Frame, Terminal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::beacon::SlotEvent;
use crate::execution::HeadEvent;
use crate::render::render;
use crate::supervisor::Subscriptions;

const TITLE: &str = "ethtop";
const SLOTS_TITLE: &str = "beacon chain";

/// Everything the screen shows, fed one event at a time.
pub struct Dashboard {
    aggregator: Aggregator,
    last_head: Option<HeadEvent>,
    heads_seen: u64,
}

impl Dashboard {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            aggregator,
            last_head: None,
            heads_seen: 0,
        }
    }

    pub fn on_slot(&mut self, event: SlotEvent) {
        debug!(slot = event.slot, epoch_transition = event.epoch_transition, "slot event");
        self.aggregator.ingest(event);
    }

    /// Heads only drive the liveness line; they never touch aggregation.
    pub fn on_head(&mut self, head: HeadEvent) {
        debug!(number = head.number, hash = %head.hash, "head event");
        self.heads_seen += 1;
        self.last_head = Some(head);
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn last_head(&self) -> Option<&HeadEvent> {
        self.last_head.as_ref()
    }

    pub fn heads_seen(&self) -> u64 {
        self.heads_seen
    }

    pub fn draw(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Min(0),
            ])
            .split(frame.size());

        frame.render_widget(
            Paragraph::new(Span::styled(TITLE, theme::TITLE_STYLE)).alignment(Alignment::Center),
            chunks[0],
        );
        frame.render_widget(
            Paragraph::new(Span::styled(self.status_line(), theme::STATUS_STYLE))
                .alignment(Alignment::Center),
            chunks[1],
        );
        self.draw_slots(frame, chunks[2]);
    }

    fn status_line(&self) -> String {
        let state = self.aggregator.state();
        let head = match &self.last_head {
            Some(head) => format!("head #{}", head.number),
            None => "waiting for head".to_string(),
        };
        if state.is_empty() {
            return format!("{head} | waiting for slots");
        }
        format!(
            "{head} | epoch {} | {} slots",
            state.latest_epoch(),
            state.total_slots()
        )
    }

    fn draw_slots(&self, frame: &mut Frame, area: Rect) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(theme::BORDER_STYLE)
            .title(Span::styled(SLOTS_TITLE, theme::TITLE_STYLE));
        let inner = block.inner(area);

        let lines: Vec<Line> = render(self.aggregator.state(), inner.width as usize)
            .into_iter()
            .take(inner.height as usize)
            .map(|row| {
                Line::from(
                    row.cells
                        .into_iter()
                        .map(|cell| Span::styled(cell.text, theme::finality_style(cell.finality)))
                        .collect::<Vec<_>>(),
                )
            })
            .collect();

        frame.render_widget(Paragraph::new(lines).block(block), area);
    }
}

/// Whether `key` asks the shell to quit.
pub fn handle_key(key: KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Runs an undo action exactly once: on [`Restore::finish`] or on drop.
struct Restore<F: FnMut() -> Result<()>> {
    undo: Option<F>,
}

impl<F: FnMut() -> Result<()>> Restore<F> {
    fn new(undo: F) -> Self {
        Self { undo: Some(undo) }
    }

    fn finish(&mut self) -> Result<()> {
        match self.undo.take() {
            Some(mut undo) => undo(),
            None => Ok(()),
        }
    }
}

impl<F: FnMut() -> Result<()>> Drop for Restore<F> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn restore_terminal() -> Result<()> {
    let raw = disable_raw_mode().context("disabling raw mode");
    execute!(io::stdout(), LeaveAlternateScreen, Show).context("leaving alternate screen")?;
    raw
}

/// Raw-mode alternate screen, restored on drop.
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    restore: Restore<fn() -> Result<()>>,
}

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("enabling raw mode")?;
        // Armed before anything else can fail so every early return undoes raw mode.
        let restore = Restore::new(restore_terminal as fn() -> Result<()>);

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen).context("entering alternate screen")?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout)).context("creating terminal")?;

        Ok(Self { terminal, restore })
    }

    fn restore(&mut self) -> Result<()> {
        self.restore.finish()
    }
}

/// Consume both queues and terminal input until quit or cancellation.
///
/// A queue whose producers are gone is dropped from the select; the view
/// keeps whatever it has already aggregated.
pub async fn run(
    dashboard: &mut Dashboard,
    subs: &mut Subscriptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut guard = TerminalGuard::enter()?;
    let mut events = EventStream::new();
    let mut heads_open = true;
    let mut slots_open = true;

    loop {
        guard
            .terminal
            .draw(|frame| dashboard.draw(frame))
            .context("drawing frame")?;

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                break;
            }
            head = subs.heads.recv(), if heads_open => match head {
                Some(head) => dashboard.on_head(head),
                None => {
                    debug!("head queue closed");
                    heads_open = false;
                }
            },
            slot = subs.slots.recv(), if slots_open => match slot {
                Some(slot) => dashboard.on_slot(slot),
                None => {
                    debug!("slot queue closed");
                    slots_open = false;
                }
            },
            maybe_event = events.next() => match maybe_event {
                Some(Ok(Event::Key(key))) => {
                    if handle_key(key) {
                        info!("quit requested");
                        break;
                    }
                }
                // Resize and other events only need the redraw at the top.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("reading terminal input"),
                None => break,
            },
        }
    }

    guard.restore()
}
