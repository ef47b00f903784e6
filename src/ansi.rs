//! Terminal color interpretation for pane rendering.
//!
//! Buffered output lines still carry the SGR sequences the child emitted. This
//! module turns them into styled ratatui lines. Style state carries over from
//! one line to the next, the way a terminal would keep a color that was never
//! reset. Other escape sequences are dropped so they cannot reach the screen.

use std::iter::Peekable;
use std::str::Chars;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

/// Running SGR state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgrState {
    fg: Option<Color>,
    bg: Option<Color>,
    modifiers: Modifier,
}

impl Default for SgrState {
    fn default() -> Self {
        Self {
            fg: None,
            bg: None,
            modifiers: Modifier::empty(),
        }
    }
}

impl SgrState {
    pub fn style(&self) -> Style {
        let mut style = Style::default().add_modifier(self.modifiers);
        if let Some(color) = self.fg {
            style = style.fg(color);
        }
        if let Some(color) = self.bg {
            style = style.bg(color);
        }
        style
    }

    /// Applies the numeric parameters of one `ESC [ ... m` sequence.
    fn apply(&mut self, params: &str) {
        let mut codes = parse_params(params).into_iter();
        while let Some(code) = codes.next() {
            match code {
                0 => *self = Self::default(),
                38 | 48 => {
                    let color = extended_color(&mut codes);
                    if code == 38 {
                        self.fg = color.or(self.fg);
                    } else {
                        self.bg = color.or(self.bg);
                    }
                }
                39 => self.fg = None,
                49 => self.bg = None,
                30..=37 => self.fg = Some(palette(code - 30, false)),
                90..=97 => self.fg = Some(palette(code - 90, true)),
                40..=47 => self.bg = Some(palette(code - 40, false)),
                100..=107 => self.bg = Some(palette(code - 100, true)),
                _ => {
                    if let Some(modifier) = enabled_modifier(code) {
                        self.modifiers.insert(modifier);
                    } else if let Some(modifier) = disabled_modifier(code) {
                        self.modifiers.remove(modifier);
                    }
                }
            }
        }
    }
}

/// Styles a run of output lines, carrying color state across them.
pub fn ansi_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<Line<'static>> {
    let mut state = SgrState::default();
    lines
        .into_iter()
        .map(|line| Line::from(styled_spans(line, &mut state)))
        .collect()
}

fn styled_spans(text: &str, state: &mut SgrState) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    let mut pending = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\x1b' => {
                if let Some(params) = read_escape(&mut chars) {
                    push_span(&mut spans, &mut pending, state);
                    state.apply(&params);
                }
            }
            // A bare CR redraws the line from column zero; keep what was drawn last.
            '\r' => {
                pending.clear();
                spans.clear();
            }
            '\n' => {}
            _ => pending.push(ch),
        }
    }
    push_span(&mut spans, &mut pending, state);
    spans
}

/// Consumes one escape sequence after ESC, returning SGR parameters if it was one.
fn read_escape(chars: &mut Peekable<Chars<'_>>) -> Option<String> {
    match chars.peek() {
        Some('[') => {
            chars.next();
            let mut params = String::new();
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    return (c == 'm').then_some(params);
                }
                params.push(c);
            }
            None
        }
        Some(']') => {
            chars.next();
            while let Some(c) = chars.next() {
                if c == '\x07' {
                    break;
                }
                if c == '\x1b' && chars.peek() == Some(&'\\') {
                    chars.next();
                    break;
                }
            }
            None
        }
        _ => None,
    }
}

fn push_span(spans: &mut Vec<Span<'static>>, pending: &mut String, state: &SgrState) {
    if !pending.is_empty() {
        spans.push(Span::styled(std::mem::take(pending), state.style()));
    }
}

fn parse_params(params: &str) -> Vec<u16> {
    let codes: Vec<u16> = params
        .split([';', ':'])
        .filter_map(|part| if part.is_empty() { Some(0) } else { part.parse().ok() })
        .collect();
    if codes.is_empty() {
        vec![0]
    } else {
        codes
    }
}

/// `5;n` (256-color index) or `2;r;g;b` (truecolor) following a 38/48.
fn extended_color(codes: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match codes.next()? {
        5 => component(codes).map(Color::Indexed),
        2 => {
            let r = component(codes)?;
            let g = component(codes)?;
            let b = component(codes)?;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

fn component(codes: &mut impl Iterator<Item = u16>) -> Option<u8> {
    codes.next().and_then(|value| u8::try_from(value).ok())
}

fn enabled_modifier(code: u16) -> Option<Modifier> {
    Some(match code {
        1 => Modifier::BOLD,
        2 => Modifier::DIM,
        3 => Modifier::ITALIC,
        4 => Modifier::UNDERLINED,
        5 => Modifier::SLOW_BLINK,
        6 => Modifier::RAPID_BLINK,
        7 => Modifier::REVERSED,
        8 => Modifier::HIDDEN,
        9 => Modifier::CROSSED_OUT,
        _ => return None,
    })
}

fn disabled_modifier(code: u16) -> Option<Modifier> {
    Some(match code {
        22 => Modifier::BOLD | Modifier::DIM,
        23 => Modifier::ITALIC,
        24 => Modifier::UNDERLINED,
        25 => Modifier::SLOW_BLINK | Modifier::RAPID_BLINK,
        27 => Modifier::REVERSED,
        28 => Modifier::HIDDEN,
        29 => Modifier::CROSSED_OUT,
        _ => return None,
    })
}

fn palette(index: u16, bright: bool) -> Color {
    const NORMAL: [Color; 8] = [
        Color::Black,
        Color::Red,
        Color::Green,
        Color::Yellow,
        Color::Blue,
        Color::Magenta,
        Color::Cyan,
        Color::Gray,
    ];
    const BRIGHT: [Color; 8] = [
        Color::DarkGray,
        Color::LightRed,
        Color::LightGreen,
        Color::LightYellow,
        Color::LightBlue,
        Color::LightMagenta,
        Color::LightCyan,
        Color::White,
    ];
    let table = if bright { &BRIGHT } else { &NORMAL };
    table[usize::from(index) % table.len()]
}
