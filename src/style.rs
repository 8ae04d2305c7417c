//! Display styles for task identities.
//!
//! Each identity gets a color/weight pair from a fixed palette, in task-start order,
//! and every identity is right-padded to the widest one so output columns line up.

use std::collections::HashMap;

use crossterm::style::{Attribute, Color, ContentStyle};

const PALETTE: [(Color, bool); 12] = [
    (Color::Cyan, true),
    (Color::Magenta, true),
    (Color::Yellow, true),
    (Color::Green, true),
    (Color::Blue, true),
    (Color::Red, true),
    (Color::DarkCyan, false),
    (Color::DarkMagenta, false),
    (Color::DarkYellow, false),
    (Color::DarkGreen, false),
    (Color::DarkBlue, false),
    (Color::DarkRed, false),
];

/// A color/weight pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: Color,
    pub bold: bool,
}

impl Style {
    pub fn content_style(self) -> ContentStyle {
        let mut style = ContentStyle::new();
        style.foreground_color = Some(self.color);
        if self.bold {
            style.attributes.set(Attribute::Bold);
        }
        style
    }

    /// Renders `text` with this style, or as-is when color is disabled.
    pub fn paint(self, text: &str, color: bool) -> String {
        if !color {
            return text.to_string();
        }
        self.content_style().apply(text).to_string()
    }
}

/// Cycles through the palette, wrapping around once exhausted.
#[derive(Debug, Default)]
pub struct Palette {
    next: usize,
}

impl Palette {
    pub fn next(&mut self) -> Style {
        let (color, bold) = PALETTE[self.next % PALETTE.len()];
        self.next += 1;
        Style { color, bold }
    }
}

/// Column width shared by every identity in a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Padding {
    width: usize,
}

impl Padding {
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let width = ids
            .into_iter()
            .map(|id| id.chars().count())
            .max()
            .unwrap_or(0);
        Self { width }
    }

    pub fn pad(&self, id: &str) -> String {
        format!("{:<width$}", id, width = self.width)
    }
}

/// Style assignment for one run, fixed once all identities are known.
#[derive(Debug, Clone, Default)]
pub struct Styles {
    assigned: HashMap<String, Style>,
    padding: Padding,
}

impl Styles {
    pub fn assign<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let ids: Vec<&str> = ids.into_iter().collect();
        let mut palette = Palette::default();
        let mut assigned = HashMap::new();
        for id in &ids {
            if !assigned.contains_key(*id) {
                assigned.insert(id.to_string(), palette.next());
            }
        }
        Self {
            assigned,
            padding: Padding::new(ids),
        }
    }

    pub fn style(&self, id: &str) -> Style {
        self.assigned.get(id).copied().unwrap_or(Style {
            color: Color::Reset,
            bold: false,
        })
    }

    pub fn padded(&self, id: &str) -> String {
        self.padding.pad(id)
    }
}
