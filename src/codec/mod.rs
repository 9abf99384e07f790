//! Document text to blocks.
//!
//! - [`blocks::parse_blocks`] splits a document into [`ParsedBlock`]s on blank lines
//! - [`tags::extract_tags`] finds `#tag` tokens and their character offsets inside a block
//!
//! Parsing is total: any string yields a (possibly empty) list of blocks, and the same input
//! always yields the same output.

pub mod blocks;
pub mod tags;

pub use blocks::{line_count, parse_blocks, ParsedBlock};
pub use tags::{extract_tags, TagOccurrence};
