//! Colours for tag pills.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagColor {
    pub background: &'static str,
    pub border: &'static str,
    pub text: &'static str,
}

pub const TAG_COLORS: [TagColor; 8] = [
    TagColor {
        background: "rgba(108,92,231,0.18)",
        border: "rgba(108,92,231,0.5)",
        text: "#6c5ce7",
    },
    TagColor {
        background: "rgba(0,206,201,0.18)",
        border: "rgba(0,206,201,0.5)",
        text: "#00b8b3",
    },
    TagColor {
        background: "rgba(253,121,168,0.18)",
        border: "rgba(253,121,168,0.5)",
        text: "#e8588a",
    },
    TagColor {
        background: "rgba(255,159,67,0.18)",
        border: "rgba(255,159,67,0.5)",
        text: "#e88b30",
    },
    TagColor {
        background: "rgba(46,213,115,0.18)",
        border: "rgba(46,213,115,0.5)",
        text: "#26b568",
    },
    TagColor {
        background: "rgba(30,144,255,0.18)",
        border: "rgba(30,144,255,0.5)",
        text: "#1a85e5",
    },
    TagColor {
        background: "rgba(255,71,87,0.18)",
        border: "rgba(255,71,87,0.5)",
        text: "#e54050",
    },
    TagColor {
        background: "rgba(162,155,254,0.18)",
        border: "rgba(162,155,254,0.5)",
        text: "#8a80f0",
    },
];

/// Deterministic tag-to-colour assignment with a memo of names already seen.
///
/// The slot is `|h| mod 8` where `h` is the 31-multiplier string hash over UTF-16 units in
/// wrapping 32-bit arithmetic, so a tag keeps the colour earlier releases gave it.
#[derive(Debug, Default)]
pub struct TagPalette {
    assigned: Mutex<HashMap<String, TagColor>>,
}

impl TagPalette {
    pub fn new() -> TagPalette {
        TagPalette::default()
    }

    pub fn slot(name: &str) -> usize {
        let h = name
            .encode_utf16()
            .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
        (i64::from(h).abs() % TAG_COLORS.len() as i64) as usize
    }

    pub fn color(&self, name: &str) -> TagColor {
        *self
            .assigned
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| TAG_COLORS[TagPalette::slot(name)])
    }

    pub fn len(&self) -> usize {
        self.assigned.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.lock().is_empty()
    }

    /// Forget memoized names, e.g. after the store was reloaded.
    pub fn clear(&self) {
        self.assigned.lock().clear();
    }
}
