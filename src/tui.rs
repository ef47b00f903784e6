//! Terminal setup and pane rendering for parallel sessions.
//!
//! This module handles switching the terminal into raw mode on the alternate
//! screen, restoring it afterwards, and drawing one bordered pane per process
//! using `ratatui`.

use std::io::{self, Stdout};

use crossterm::cursor::{Hide, Show};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::block::{Position, Title};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph};
use ratatui::{Frame, Terminal};

use crate::ansi::ansi_lines;
use crate::process::ProcessStatus;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const RUNNING_BORDER: Color = Color::Cyan;
const EXITED_BORDER: Color = Color::Red;

/// Snapshot of one pane, taken under the buffer lock and rendered without it.
#[derive(Debug, Clone)]
pub struct PaneView {
    pub name: String,
    pub status: ProcessStatus,
    /// Literal command text shown under the pane.
    pub command: String,
    /// Most recent output lines, oldest first, color codes intact.
    pub lines: Vec<String>,
}

/// Initializes the terminal for the live view.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    if let Err(err) = execute!(stdout, EnterAlternateScreen, Hide) {
        let _ = disable_raw_mode();
        return Err(err);
    }
    Terminal::new(CrosstermBackend::new(stdout))
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show)?;
    terminal.show_cursor()
}

/// Draws every pane: two side by side, otherwise stacked.
pub fn draw_panes<B: Backend>(terminal: &mut Terminal<B>, panes: &[PaneView]) -> io::Result<()> {
    terminal.draw(|frame| render_panes(frame, panes))?;
    Ok(())
}

fn render_panes(frame: &mut Frame, panes: &[PaneView]) {
    if panes.is_empty() {
        return;
    }
    for (pane, area) in panes.iter().zip(pane_areas(frame.size(), panes.len()).iter()) {
        render_pane(frame, *area, pane);
    }
}

fn pane_areas(area: Rect, count: usize) -> Vec<Rect> {
    let direction = if count == 2 {
        Direction::Horizontal
    } else {
        Direction::Vertical
    };
    let count = u32::try_from(count).unwrap_or(u32::MAX);
    Layout::default()
        .direction(direction)
        .constraints((0..count).map(|_| Constraint::Ratio(1, count)))
        .split(area)
        .to_vec()
}

fn render_pane(frame: &mut Frame, area: Rect, pane: &PaneView) {
    let border = if pane.status.is_running() {
        RUNNING_BORDER
    } else {
        EXITED_BORDER
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border))
        .title(Title::from(format!(" {} - {} ", pane.name, pane.status)))
        .title(
            Title::from(format!(" {} ", pane.command))
                .position(Position::Bottom)
                .alignment(Alignment::Left),
        )
        .title_style(Style::default().add_modifier(Modifier::BOLD));

    let visible = usize::from(block.inner(area).height);
    let mut lines = ansi_lines(pane.lines.iter().map(String::as_str));
    let skip = lines.len().saturating_sub(visible);
    lines.drain(..skip);
    frame.render_widget(Paragraph::new(lines).block(block), area);
}
