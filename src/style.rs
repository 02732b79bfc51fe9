//! Highlight styles and the deduplicating style table.
//!
//! Every distinct combination of colors and attributes seen on screen gets a
//! stable numeric id; id 0 is the default style. Redraw frames reference
//! cells by id and define each id at most once per client.

use std::collections::HashMap;

/// A color as the emulator reported it: unset, a 256-palette index, or a
/// 24-bit triple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorSpec {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl ColorSpec {
    /// Resolve to a 24-bit value, mapping palette indexes through the
    /// standard xterm-256color table. `Default` resolves to `fallback`.
    pub fn to_rgb(self, fallback: (u8, u8, u8)) -> (u8, u8, u8) {
        match self {
            ColorSpec::Default => fallback,
            ColorSpec::Rgb(r, g, b) => (r, g, b),
            ColorSpec::Indexed(idx) => palette_rgb(idx),
        }
    }

    /// The 256-color index if this color has one.
    pub fn cterm_index(self) -> Option<u8> {
        match self {
            ColorSpec::Indexed(idx) => Some(idx),
            _ => None,
        }
    }
}

/// Standard xterm-256color palette entry.
pub fn palette_rgb(idx: u8) -> (u8, u8, u8) {
    const ANSI: [(u8, u8, u8); 16] = [
        (0, 0, 0),
        (205, 0, 0),
        (0, 205, 0),
        (205, 205, 0),
        (0, 0, 238),
        (205, 0, 205),
        (0, 205, 205),
        (229, 229, 229),
        (127, 127, 127),
        (255, 0, 0),
        (0, 255, 0),
        (255, 255, 0),
        (92, 92, 255),
        (255, 0, 255),
        (0, 255, 255),
        (255, 255, 255),
    ];
    let idx = idx as usize;
    if idx < 16 {
        ANSI[idx]
    } else if idx < 232 {
        // 6x6x6 color cube.
        let n = idx - 16;
        let level = |v: usize| if v == 0 { 0u8 } else { (55 + 40 * v) as u8 };
        (level((n / 36) % 6), level((n / 6) % 6), level(n % 6))
    } else {
        // Grayscale ramp.
        let v = (8 + 10 * (idx - 232)) as u8;
        (v, v, v)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnderlineStyle {
    #[default]
    None,
    Single,
    Double,
    Curly,
    Dotted,
    Dashed,
}

/// One highlight record: colors plus attribute flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Style {
    pub fg: ColorSpec,
    pub bg: ColorSpec,
    /// Underline/undercurl color.
    pub special: ColorSpec,
    pub reverse: bool,
    pub italic: bool,
    pub bold: bool,
    pub underline: UnderlineStyle,
    pub strikethrough: bool,
    /// Background blend level, 0 = opaque.
    pub blend: u8,
}

/// Stable identifier for entries in a [`StyleTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StyleId(pub u32);

impl StyleId {
    pub const DEFAULT: StyleId = StyleId(0);

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

/// Deduplicates styles into stable ids. Owned by the server and touched only
/// on the main thread, so no interior locking.
pub struct StyleTable {
    entries: Vec<Style>,
    ids: HashMap<Style, StyleId>,
}

impl StyleTable {
    pub fn new() -> Self {
        let default = Style::default();
        let mut ids = HashMap::with_capacity(16);
        ids.insert(default, StyleId::DEFAULT);
        StyleTable {
            entries: vec![default],
            ids,
        }
    }

    /// Return the id for `style`, interning it on first sight.
    pub fn ensure_id(&mut self, style: Style) -> StyleId {
        if let Some(id) = self.ids.get(&style) {
            return *id;
        }
        let id = StyleId(self.entries.len() as u32);
        self.entries.push(style);
        self.ids.insert(style, id);
        id
    }

    pub fn get(&self, id: StyleId) -> Option<&Style> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StyleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_style_is_id_zero() {
        let mut table = StyleTable::new();
        assert_eq!(table.ensure_id(Style::default()), StyleId::DEFAULT);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn styles_dedup_to_stable_ids() {
        let mut table = StyleTable::new();
        let red = Style {
            fg: ColorSpec::Indexed(1),
            ..Style::default()
        };
        let bold_red = Style {
            fg: ColorSpec::Indexed(1),
            bold: true,
            ..Style::default()
        };
        let a = table.ensure_id(red);
        let b = table.ensure_id(bold_red);
        assert_ne!(a, b);
        assert_eq!(table.ensure_id(red), a);
        assert_eq!(table.get(a), Some(&red));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn palette_cube_and_ramp() {
        assert_eq!(palette_rgb(0), (0, 0, 0));
        assert_eq!(palette_rgb(15), (255, 255, 255));
        // First cube entry after the ANSI block is pure black.
        assert_eq!(palette_rgb(16), (0, 0, 0));
        // 16 + 5*36 + 5*6 + 5 = 231 is cube white.
        assert_eq!(palette_rgb(231), (255, 255, 255));
        assert_eq!(palette_rgb(232), (8, 8, 8));
        assert_eq!(palette_rgb(255), (238, 238, 238));
    }

    #[test]
    fn rgb_resolution() {
        assert_eq!(ColorSpec::Rgb(1, 2, 3).to_rgb((9, 9, 9)), (1, 2, 3));
        assert_eq!(ColorSpec::Default.to_rgb((9, 9, 9)), (9, 9, 9));
        assert_eq!(ColorSpec::Indexed(1).to_rgb((9, 9, 9)), (205, 0, 0));
        assert_eq!(ColorSpec::Indexed(1).cterm_index(), Some(1));
        assert_eq!(ColorSpec::Rgb(0, 0, 0).cterm_index(), None);
    }
}
