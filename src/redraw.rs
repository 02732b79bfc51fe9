//! Redraw event construction.
//!
//! Computes the minimal batch of redraw events that brings one client's view
//! of a grid up to date: diff the emulator's current screen against the
//! client's last-sent snapshot, run-length-encode changed row spans, define
//! any highlight ids the client has not seen, track the cursor, and close
//! with `flush`. Encoding follows the Neovim ui redraw protocol.

use std::collections::HashSet;

use crate::rpc::Value;
use crate::style::{ColorSpec, Style, StyleTable, UnderlineStyle};
use crate::term::{CursorState, ScreenSnapshot};

#[derive(Clone, Debug, PartialEq)]
pub enum RedrawEvent {
    GridResize {
        grid: u64,
        width: u64,
        height: u64,
    },
    HlAttrDefine {
        id: u64,
        style: Style,
    },
    DefaultColorsSet {
        rgb_fg: (u8, u8, u8),
        rgb_bg: (u8, u8, u8),
    },
    GridLine {
        grid: u64,
        row: u64,
        col_start: u64,
        cells: Vec<CellRun>,
        wrap: bool,
    },
    GridCursorGoto {
        grid: u64,
        row: u64,
        col: u64,
    },
    GridClear {
        grid: u64,
    },
    Flush,
}

/// One run inside a `grid_line`: `[text]`, `[text, hl]`, or
/// `[text, hl, repeat]`. A missing hl reuses the previous run's.
#[derive(Clone, Debug, PartialEq)]
pub struct CellRun {
    pub text: String,
    pub hl: Option<u64>,
    pub repeat: Option<u64>,
}

/// The events for one grid's frame plus the style ids it defined; the caller
/// adds `defined` to the client's seen-set only once the frame is accepted.
#[derive(Debug, Default)]
pub struct GridFrame {
    pub events: Vec<RedrawEvent>,
    pub defined: Vec<u64>,
}

/// Diff `cur` against the client's `prev` view of this grid.
///
/// `prev = None` (or a dimension change) produces a full paint starting with
/// `grid_resize` + `grid_clear`. `seen` is the set of highlight ids already
/// defined for this client; fresh ids get `hl_attr_define` events ahead of
/// the lines that use them.
pub fn build_grid_frame(
    grid: u64,
    prev: Option<&ScreenSnapshot>,
    cur: &ScreenSnapshot,
    last_cursor: Option<CursorState>,
    styles: &mut StyleTable,
    seen: &HashSet<u64>,
) -> GridFrame {
    debug_assert_eq!(cur.cells.len(), cur.rows as usize);
    debug_assert!(cur.cells.iter().all(|row| row.len() == cur.cols as usize));

    let mut frame = GridFrame::default();
    let mut defines: Vec<RedrawEvent> = Vec::new();
    let mut defined_here: HashSet<u64> = HashSet::new();
    let mut lines: Vec<RedrawEvent> = Vec::new();

    let full_paint = match prev {
        Some(p) => p.rows != cur.rows || p.cols != cur.cols,
        None => true,
    };
    let blank;
    let base = if full_paint {
        blank = ScreenSnapshot::blank(cur.rows, cur.cols);
        &blank
    } else {
        prev.unwrap()
    };

    for row in 0..cur.rows as usize {
        let cur_row = &cur.cells[row];
        let base_row = &base.cells[row];
        let changed: Vec<usize> = (0..cur.cols as usize)
            .filter(|&c| cur_row[c] != base_row[c])
            .collect();
        let (first, last) = match (changed.first(), changed.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => continue,
        };

        let mut runs: Vec<CellRun> = Vec::new();
        let mut prev_hl: Option<u64> = None;
        for col in first..=last {
            let cell = &cur_row[col];
            let hl = styles.ensure_id(cell.style).as_u64();
            if hl != 0 && !seen.contains(&hl) && defined_here.insert(hl) {
                defines.push(RedrawEvent::HlAttrDefine {
                    id: hl,
                    style: cell.style,
                });
                frame.defined.push(hl);
            }
            let same_hl = prev_hl == Some(hl);
            if let Some(run) = runs.last_mut() {
                if same_hl && run.text == cell.text {
                    run.repeat = Some(run.repeat.unwrap_or(1) + 1);
                    // The three-element cell form cannot omit the hl.
                    run.hl.get_or_insert(hl);
                    continue;
                }
            }
            runs.push(CellRun {
                text: cell.text.clone(),
                // The first run always carries its hl; later runs omit a
                // repeated hl so clients reuse the previous one.
                hl: if same_hl && !runs.is_empty() {
                    None
                } else {
                    Some(hl)
                },
                repeat: None,
            });
            prev_hl = Some(hl);
        }

        lines.push(RedrawEvent::GridLine {
            grid,
            row: row as u64,
            col_start: first as u64,
            cells: runs,
            wrap: cur.wraps.get(row).copied().unwrap_or(false),
        });
    }

    if full_paint {
        frame.events.push(RedrawEvent::GridResize {
            grid,
            width: cur.cols as u64,
            height: cur.rows as u64,
        });
        frame.events.push(RedrawEvent::GridClear { grid });
    }
    frame.events.extend(defines);
    frame.events.extend(lines);

    if full_paint || last_cursor != Some(cur.cursor) {
        frame.events.push(RedrawEvent::GridCursorGoto {
            grid,
            row: cur.cursor.row as u64,
            col: cur.cursor.col as u64,
        });
    }

    frame
}

/// True when a frame would carry nothing but `flush`.
pub fn is_empty_frame(events: &[RedrawEvent]) -> bool {
    events.iter().all(|e| matches!(e, RedrawEvent::Flush))
}

fn rgb_int(rgb: (u8, u8, u8)) -> u64 {
    ((rgb.0 as u64) << 16) | ((rgb.1 as u64) << 8) | rgb.2 as u64
}

fn color_entry(pairs: &mut Vec<(Value, Value)>, key: &str, color: ColorSpec, rgb: bool) {
    match (rgb, color) {
        (_, ColorSpec::Default) => {}
        (true, color) => {
            pairs.push((key.into(), Value::UInt(rgb_int(color.to_rgb((0, 0, 0))))));
        }
        (false, color) => {
            if let Some(idx) = color.cterm_index() {
                pairs.push((key.into(), Value::UInt(idx as u64)));
            }
        }
    }
}

fn attr_map(style: &Style, rgb: bool) -> Value {
    let mut pairs: Vec<(Value, Value)> = Vec::new();
    color_entry(&mut pairs, "foreground", style.fg, rgb);
    color_entry(&mut pairs, "background", style.bg, rgb);
    color_entry(&mut pairs, "special", style.special, rgb);
    if style.reverse {
        pairs.push(("reverse".into(), Value::Bool(true)));
    }
    if style.italic {
        pairs.push(("italic".into(), Value::Bool(true)));
    }
    if style.bold {
        pairs.push(("bold".into(), Value::Bool(true)));
    }
    match style.underline {
        UnderlineStyle::None => {}
        UnderlineStyle::Single => pairs.push(("underline".into(), Value::Bool(true))),
        UnderlineStyle::Double => pairs.push(("underdouble".into(), Value::Bool(true))),
        UnderlineStyle::Curly => pairs.push(("undercurl".into(), Value::Bool(true))),
        UnderlineStyle::Dotted => pairs.push(("underdotted".into(), Value::Bool(true))),
        UnderlineStyle::Dashed => pairs.push(("underdashed".into(), Value::Bool(true))),
    }
    if style.strikethrough {
        pairs.push(("strikethrough".into(), Value::Bool(true)));
    }
    if style.blend > 0 {
        pairs.push(("blend".into(), Value::UInt(style.blend as u64)));
    }
    Value::Map(pairs)
}

impl RedrawEvent {
    /// Encode as one `[name, args]` entry of a `redraw` notification batch.
    pub fn to_value(&self) -> Value {
        match self {
            RedrawEvent::GridResize {
                grid,
                width,
                height,
            } => Value::Array(vec![
                "grid_resize".into(),
                Value::Array(vec![
                    Value::UInt(*grid),
                    Value::UInt(*width),
                    Value::UInt(*height),
                ]),
            ]),
            RedrawEvent::HlAttrDefine { id, style } => Value::Array(vec![
                "hl_attr_define".into(),
                Value::Array(vec![
                    Value::UInt(*id),
                    attr_map(style, true),
                    attr_map(style, false),
                    Value::Array(Vec::new()),
                ]),
            ]),
            RedrawEvent::DefaultColorsSet { rgb_fg, rgb_bg } => Value::Array(vec![
                "default_colors_set".into(),
                Value::Array(vec![
                    Value::UInt(rgb_int(*rgb_fg)),
                    Value::UInt(rgb_int(*rgb_bg)),
                    Value::UInt(rgb_int(*rgb_fg)),
                    Value::UInt(0),
                    Value::UInt(0),
                ]),
            ]),
            RedrawEvent::GridLine {
                grid,
                row,
                col_start,
                cells,
                wrap,
            } => {
                let cell_values: Vec<Value> = cells
                    .iter()
                    .map(|run| {
                        let mut parts = vec![Value::Str(run.text.clone())];
                        if let Some(hl) = run.hl {
                            parts.push(Value::UInt(hl));
                            if let Some(repeat) = run.repeat {
                                parts.push(Value::UInt(repeat));
                            }
                        }
                        Value::Array(parts)
                    })
                    .collect();
                Value::Array(vec![
                    "grid_line".into(),
                    Value::Array(vec![
                        Value::UInt(*grid),
                        Value::UInt(*row),
                        Value::UInt(*col_start),
                        Value::Array(cell_values),
                        Value::Bool(*wrap),
                    ]),
                ])
            }
            RedrawEvent::GridCursorGoto { grid, row, col } => Value::Array(vec![
                "grid_cursor_goto".into(),
                Value::Array(vec![
                    Value::UInt(*grid),
                    Value::UInt(*row),
                    Value::UInt(*col),
                ]),
            ]),
            RedrawEvent::GridClear { grid } => Value::Array(vec![
                "grid_clear".into(),
                Value::Array(vec![Value::UInt(*grid)]),
            ]),
            RedrawEvent::Flush => {
                Value::Array(vec!["flush".into(), Value::Array(Vec::new())])
            }
        }
    }
}

/// Encode a whole frame as the params of a `redraw` notification.
pub fn encode_frame(events: &[RedrawEvent]) -> Value {
    Value::Array(events.iter().map(|e| e.to_value()).collect())
}
