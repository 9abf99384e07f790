//! Tag-token extraction.
//!
//! A tag is `#` followed by a word character and then any run of word characters, `/` or `-`.
//! Word characters are Unicode-aware, so CJK tags such as `#中文标签` are recognised. A `#`
//! directly preceded by another `#` never starts a tag, which keeps Markdown heading markers
//! (`##`, `###`, ...) from being read as tags.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#(\w[\w/\-]*)").expect("tag pattern is a valid regex"));

/// One tag occurrence inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagOccurrence {
    pub name: String,
    /// Character offset of the leading `#` within the block text.
    pub offset: usize,
}

/// Extract tag occurrences from `text` in left-to-right order.
pub fn extract_tags(text: &str) -> Vec<TagOccurrence> {
    let mut tags = Vec::new();
    for captures in TAG_PATTERN.captures_iter(text) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if text[..whole.start()].ends_with('#') {
            continue;
        }
        tags.push(TagOccurrence {
            name: name.as_str().to_string(),
            offset: text[..whole.start()].chars().count(),
        });
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn names(tags: &[TagOccurrence]) -> Vec<&str> {
        tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_heading_markers_are_not_tags() {
        let text = "## Heading #project and #feature-x and a #中文标签";
        let tags = extract_tags(text);
        assert_eq!(names(&tags), vec!["project", "feature-x", "中文标签"]);
        assert_eq!(tags[0].offset, 11);
        assert_eq!(tags[1].offset, 24);
        assert_eq!(tags[2].offset, 41);
        for tag in &tags {
            let at: String = text.chars().skip(tag.offset).take(1).collect();
            assert_eq!(at, "#");
        }
    }

    #[test]
    fn test_bare_hashes_yield_nothing() {
        assert!(extract_tags("##").is_empty());
        assert!(extract_tags("#").is_empty());
        assert!(extract_tags("# Title").is_empty());
        assert!(extract_tags("### Sub heading").is_empty());
    }

    #[test]
    fn test_double_hash_word_is_rejected() {
        // `##tag` is a malformed heading, not a tag.
        assert!(extract_tags("##tag").is_empty());
        assert_eq!(names(&extract_tags("##tag #real")), vec!["real"]);
    }

    #[test]
    fn test_nested_and_dashed_names() {
        let tags = extract_tags("#area/work #to-do #v2_final");
        assert_eq!(names(&tags), vec!["area/work", "to-do", "v2_final"]);
    }

    #[test]
    fn test_tag_must_start_with_word_character() {
        assert!(extract_tags("#/path #-dash").is_empty());
    }

    #[test]
    fn test_offsets_count_characters_not_bytes() {
        let tags = extract_tags("中文 #a");
        assert_eq!(tags[0].offset, 3);
    }

    #[test]
    fn test_duplicates_are_reported_in_order() {
        let tags = extract_tags("#a then #b then #a");
        assert_eq!(names(&tags), vec!["a", "b", "a"]);
        assert_eq!(tags[2].offset, 16);
    }

    #[test]
    fn test_tag_names_are_case_sensitive() {
        assert_eq!(names(&extract_tags("#Project #project")), vec!["Project", "project"]);
    }
}
