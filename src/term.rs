//! Terminal emulator wrapper.
//!
//! Wraps `alacritty_terminal::Term` behind the narrow contract the server
//! needs: feed PTY bytes in, collect the write-back data the emulator
//! produces for queries (Device Attributes, cursor position reports), watch
//! title/bell events, and copy style-aware screen snapshots out for diffing.

use std::sync::{Arc, Mutex};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::term::cell::Flags;
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi;

use crate::style::{ColorSpec, Style, UnderlineStyle};

/// Events captured from the emulator between feeds.
#[derive(Default)]
struct EventState {
    title: Option<String>,
    title_dirty: bool,
    bell: bool,
    responses: Vec<String>,
}

/// `Term` requires a cloneable listener, so state lives behind a mutex the
/// emulator and the listener share.
#[derive(Clone)]
pub struct EventSink {
    state: Arc<Mutex<EventState>>,
}

impl EventListener for EventSink {
    fn send_event(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        match event {
            Event::Title(title) => {
                state.title = Some(title);
                state.title_dirty = true;
            }
            Event::ResetTitle => {
                state.title = None;
                state.title_dirty = true;
            }
            Event::Bell => state.bell = true,
            Event::PtyWrite(data) => state.responses.push(data),
            _ => {}
        }
    }
}

struct GridSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for GridSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

/// One screen position: grapheme text plus resolved style. Wide characters
/// occupy two cells; the trailing spacer has empty text and width 0.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub text: String,
    pub style: Style,
    pub width: u8,
}

impl Cell {
    pub fn blank() -> Self {
        Cell {
            text: " ".to_string(),
            style: Style::default(),
            width: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

/// A copied-out view of the whole screen, safe to diff outside the PTY lock.
#[derive(Clone, Debug, PartialEq)]
pub struct ScreenSnapshot {
    pub rows: u16,
    pub cols: u16,
    /// Row-major cell matrix, `rows` entries of `cols` cells each.
    pub cells: Vec<Vec<Cell>>,
    /// Whether each row soft-wraps into the next.
    pub wraps: Vec<bool>,
    pub cursor: CursorState,
}

impl ScreenSnapshot {
    pub fn blank(rows: u16, cols: u16) -> Self {
        ScreenSnapshot {
            rows,
            cols,
            cells: vec![vec![Cell::blank(); cols as usize]; rows as usize],
            wraps: vec![false; rows as usize],
            cursor: CursorState {
                row: 0,
                col: 0,
                visible: true,
            },
        }
    }
}

pub struct Emulator {
    term: Term<EventSink>,
    parser: ansi::Processor,
    events: EventSink,
    rows: u16,
    cols: u16,
}

impl Emulator {
    pub fn new(rows: u16, cols: u16, scrollback: usize) -> Self {
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };
        let size = GridSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        };
        let events = EventSink {
            state: Arc::new(Mutex::new(EventState::default())),
        };
        let term = Term::new(config, &size, events.clone());
        Emulator {
            term,
            parser: ansi::Processor::new(),
            events,
            rows,
            cols,
        }
    }

    /// Feed raw PTY output through the VT state machine.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.parser.advance(&mut self.term, byte);
        }
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.rows = rows;
        self.cols = cols;
        self.term.resize(GridSize {
            columns: cols as usize,
            screen_lines: rows as usize,
        });
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Drain write-back data the emulator produced for terminal queries.
    /// These bytes must reach the PTY master ahead of any queued user input.
    pub fn take_responses(&mut self) -> Vec<String> {
        let mut state = self.events.state.lock().unwrap();
        std::mem::take(&mut state.responses)
    }

    /// The new title if it changed since the last call. `Some(None)` means
    /// the title was reset.
    pub fn take_title_change(&mut self) -> Option<Option<String>> {
        let mut state = self.events.state.lock().unwrap();
        if state.title_dirty {
            state.title_dirty = false;
            Some(state.title.clone())
        } else {
            None
        }
    }

    pub fn title(&self) -> Option<String> {
        self.events.state.lock().unwrap().title.clone()
    }

    /// True once per bell since the last call.
    pub fn take_bell(&mut self) -> bool {
        let mut state = self.events.state.lock().unwrap();
        std::mem::take(&mut state.bell)
    }

    /// Whether the application asked for mouse reporting.
    pub fn wants_mouse(&self) -> bool {
        self.term.mode().intersects(TermMode::MOUSE_MODE)
    }

    /// Whether mouse reports should use SGR encoding.
    pub fn sgr_mouse(&self) -> bool {
        self.term.mode().contains(TermMode::SGR_MOUSE)
    }

    pub fn cursor(&self) -> CursorState {
        let point = self.term.grid().cursor.point;
        CursorState {
            row: point.line.0.max(0) as u16,
            col: point.column.0 as u16,
            visible: self.term.mode().contains(TermMode::SHOW_CURSOR),
        }
    }

    /// Default foreground/background as 24-bit values for
    /// `default_colors_set`.
    pub fn default_colors(&self) -> ((u8, u8, u8), (u8, u8, u8)) {
        let colors = self.term.colors();
        let fg = colors[ansi::NamedColor::Foreground]
            .map(|c| (c.r, c.g, c.b))
            .unwrap_or((255, 255, 255));
        let bg = colors[ansi::NamedColor::Background]
            .map(|c| (c.r, c.g, c.b))
            .unwrap_or((0, 0, 0));
        (fg, bg)
    }

    /// Copy the visible screen out. Called under the PTY lock; the returned
    /// snapshot is diffed on the main thread without holding it.
    pub fn snapshot(&self) -> ScreenSnapshot {
        let grid = self.term.grid();
        let mut rows = Vec::with_capacity(self.rows as usize);
        let mut wraps = Vec::with_capacity(self.rows as usize);
        for line in 0..self.rows {
            let mut cells = Vec::with_capacity(self.cols as usize);
            for col in 0..self.cols {
                let point = Point::new(Line(line as i32), Column(col as usize));
                cells.push(convert_cell(&grid[point]));
            }
            let last = Point::new(Line(line as i32), Column(self.cols.saturating_sub(1) as usize));
            wraps.push(grid[last].flags.contains(Flags::WRAPLINE));
            rows.push(cells);
        }
        ScreenSnapshot {
            rows: self.rows,
            cols: self.cols,
            cells: rows,
            wraps,
            cursor: self.cursor(),
        }
    }
}

fn convert_color(color: ansi::Color) -> ColorSpec {
    match color {
        ansi::Color::Spec(rgb) => ColorSpec::Rgb(rgb.r, rgb.g, rgb.b),
        ansi::Color::Indexed(idx) => ColorSpec::Indexed(idx),
        ansi::Color::Named(named) => {
            let idx = named as usize;
            if idx < 16 {
                ColorSpec::Indexed(idx as u8)
            } else if (ansi::NamedColor::DimBlack as usize..=ansi::NamedColor::DimWhite as usize)
                .contains(&idx)
            {
                ColorSpec::Indexed((idx - ansi::NamedColor::DimBlack as usize) as u8)
            } else {
                // Foreground/Background/Cursor collapse to the defaults
                // carried by default_colors_set.
                ColorSpec::Default
            }
        }
    }
}

fn convert_cell(cell: &alacritty_terminal::term::cell::Cell) -> Cell {
    let flags = cell.flags;

    if flags.contains(Flags::WIDE_CHAR_SPACER) {
        return Cell {
            text: String::new(),
            style: style_of(cell),
            width: 0,
        };
    }

    let mut text = String::new();
    text.push(cell.c);
    if let Some(extra) = cell.zerowidth() {
        // Combining marks ride along with their base cell.
        text.extend(extra.iter());
    }

    Cell {
        text,
        style: style_of(cell),
        width: if flags.contains(Flags::WIDE_CHAR) { 2 } else { 1 },
    }
}

fn style_of(cell: &alacritty_terminal::term::cell::Cell) -> Style {
    let flags = cell.flags;
    let underline = if flags.contains(Flags::DOUBLE_UNDERLINE) {
        UnderlineStyle::Double
    } else if flags.contains(Flags::UNDERCURL) {
        UnderlineStyle::Curly
    } else if flags.contains(Flags::DOTTED_UNDERLINE) {
        UnderlineStyle::Dotted
    } else if flags.contains(Flags::DASHED_UNDERLINE) {
        UnderlineStyle::Dashed
    } else if flags.contains(Flags::UNDERLINE) {
        UnderlineStyle::Single
    } else {
        UnderlineStyle::None
    };

    Style {
        fg: convert_color(cell.fg),
        bg: convert_color(cell.bg),
        special: cell
            .underline_color()
            .map(convert_color)
            .unwrap_or_default(),
        reverse: flags.contains(Flags::INVERSE),
        italic: flags.contains(Flags::ITALIC),
        bold: flags.contains(Flags::BOLD),
        underline,
        strikethrough: flags.contains(Flags::STRIKEOUT),
        blend: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_dimensions() {
        let emu = Emulator::new(24, 80, 100);
        let snap = emu.snapshot();
        assert_eq!(snap.rows, 24);
        assert_eq!(snap.cols, 80);
        assert_eq!(snap.cells.len(), 24);
        assert_eq!(snap.cells[0].len(), 80);
    }

    #[test]
    fn plain_text_lands_in_cells() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed(b"hi");
        let snap = emu.snapshot();
        assert_eq!(snap.cells[0][0].text, "h");
        assert_eq!(snap.cells[0][1].text, "i");
        assert_eq!(snap.cells[0][2].text, " ");
        assert_eq!(snap.cursor.row, 0);
        assert_eq!(snap.cursor.col, 2);
        assert!(snap.cursor.visible);
    }

    #[test]
    fn sgr_colors_become_styles() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed(b"\x1b[31;1mR\x1b[0m.");
        let snap = emu.snapshot();
        let red = &snap.cells[0][0];
        assert_eq!(red.style.fg, ColorSpec::Indexed(1));
        assert!(red.style.bold);
        let plain = &snap.cells[0][1];
        assert_eq!(plain.style, Style::default());
    }

    #[test]
    fn truecolor_is_preserved() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed(b"\x1b[38;2;10;20;30mX");
        let snap = emu.snapshot();
        assert_eq!(snap.cells[0][0].style.fg, ColorSpec::Rgb(10, 20, 30));
    }

    #[test]
    fn wide_char_occupies_two_cells() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed("你".as_bytes());
        let snap = emu.snapshot();
        assert_eq!(snap.cells[0][0].text, "你");
        assert_eq!(snap.cells[0][0].width, 2);
        assert_eq!(snap.cells[0][1].text, "");
        assert_eq!(snap.cells[0][1].width, 0);
        assert_eq!(snap.cursor.col, 2);
    }

    #[test]
    fn resize_changes_grid() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.resize(30, 100);
        let snap = emu.snapshot();
        assert_eq!(snap.rows, 30);
        assert_eq!(snap.cols, 100);
    }

    #[test]
    fn title_change_is_reported_once() {
        let mut emu = Emulator::new(24, 80, 100);
        assert_eq!(emu.take_title_change(), None);
        emu.feed(b"\x1b]0;build: ok\x07");
        assert_eq!(emu.take_title_change(), Some(Some("build: ok".to_string())));
        assert_eq!(emu.take_title_change(), None);
        assert_eq!(emu.title(), Some("build: ok".to_string()));
    }

    #[test]
    fn bell_is_latched_and_cleared() {
        let mut emu = Emulator::new(24, 80, 100);
        assert!(!emu.take_bell());
        emu.feed(b"\x07");
        assert!(emu.take_bell());
        assert!(!emu.take_bell());
    }

    #[test]
    fn cursor_position_query_produces_response() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed(b"\x1b[6n");
        let responses = emu.take_responses();
        assert!(!responses.is_empty());
        assert!(responses[0].starts_with("\x1b["));
        assert!(emu.take_responses().is_empty());
    }

    #[test]
    fn hidden_cursor_is_invisible() {
        let mut emu = Emulator::new(24, 80, 100);
        emu.feed(b"\x1b[?25l");
        assert!(!emu.cursor().visible);
        emu.feed(b"\x1b[?25h");
        assert!(emu.cursor().visible);
    }
}
