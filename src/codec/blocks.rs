//! Blank-line block splitting.

use crate::{
    codec::tags::{extract_tags, TagOccurrence},
    hash::ContentHash,
};
use serde::{Deserialize, Serialize};

/// A maximal run of non-blank lines, as found in the current text of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBlock {
    /// 0-based line index of the first line of the block.
    pub start_line: u32,
    /// 0-based line index of the last line of the block (inclusive).
    pub end_line: u32,
    pub text: String,
    pub content_hash: ContentHash,
    pub tags: Vec<TagOccurrence>,
}

impl ParsedBlock {
    fn from_lines(start_line: usize, lines: &[&str]) -> ParsedBlock {
        let text = lines.join("\n");
        ParsedBlock {
            start_line: start_line as u32,
            end_line: (start_line + lines.len() - 1) as u32,
            content_hash: ContentHash::of(&text),
            tags: extract_tags(&text),
            text,
        }
    }

    pub fn line_span(&self) -> u32 {
        self.end_line - self.start_line + 1
    }
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Split `text` into blocks separated by blank lines.
///
/// Blank lines (empty after trimming whitespace) are separators and are dropped. A trailing block
/// that is not followed by a blank line is still returned.
pub fn parse_blocks(text: &str) -> Vec<ParsedBlock> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start_line = 0usize;

    for (idx, line) in text.split('\n').enumerate() {
        if is_blank(line) {
            if !current.is_empty() {
                blocks.push(ParsedBlock::from_lines(start_line, &current));
                current.clear();
            }
        } else {
            if current.is_empty() {
                start_line = idx;
            }
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(ParsedBlock::from_lines(start_line, &current));
    }
    blocks
}

/// Number of `\n`-separated lines in `text`. An empty document counts as one line.
pub fn line_count(text: &str) -> u32 {
    text.split('\n').count() as u32
}
