//! Incremental parsing of streamed assistant text.
//!
//! The accumulated response text is re-parsed after every chunk. Tool uses
//! are written as markup for known tool names:
//!
//! ```text
//! Let me look.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! A block whose closing tag has not arrived yet is returned as partial.

use crate::tools::ToolUseRequest;
use anyhow::Context;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static THINKING_TAGS: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<thinking>\s?|\s?</thinking>"));

static TRAILING_PARTIAL_TAG: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\s*</?[A-Za-z_]*$"));

#[derive(Clone, Debug, PartialEq)]
pub enum AssistantBlock {
    Text { content: String, partial: bool },
    ToolUse(ToolUseRequest),
}

impl AssistantBlock {
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } => *partial,
            Self::ToolUse(request) => request.partial,
        }
    }

    /// Mark the block complete.
    pub const fn finalize(&mut self) {
        match self {
            Self::Text { partial, .. } => *partial = false,
            Self::ToolUse(request) => request.partial = false,
        }
    }
}

/// Split `text` into text and tool-use blocks.
///
/// Only tags named in `tool_names` open a tool use; any other markup stays
/// text. The trailing text block is partial because more text may follow.
#[must_use]
pub fn parse_assistant_message(text: &str, tool_names: &[String]) -> Vec<AssistantBlock> {
    let mut blocks = Vec::new();
    let mut rest = text;

    loop {
        let Some((start, name)) = find_tool_open(rest, tool_names) else {
            push_text(&mut blocks, rest, true);
            break;
        };
        push_text(&mut blocks, &rest[..start], false);

        let body = &rest[start + name.len() + 2..];
        let closing = format!("</{name}>");
        if let Some(end) = body.find(&closing) {
            blocks.push(AssistantBlock::ToolUse(ToolUseRequest {
                id: None,
                name: name.to_string(),
                input: parse_params(&body[..end]),
                partial: false,
            }));
            rest = &body[end + closing.len()..];
        } else {
            blocks.push(AssistantBlock::ToolUse(ToolUseRequest {
                id: None,
                name: name.to_string(),
                input: parse_params(strip_partial_closing(body, &closing)),
                partial: true,
            }));
            break;
        }
    }

    blocks
}

/// Remove `<thinking>` markup from text surfaced to the user.
///
/// # Errors
///
/// Fails if the tag pattern does not compile.
pub fn strip_thinking_tags(text: &str) -> anyhow::Result<String> {
    let re = THINKING_TAGS
        .as_ref()
        .map_err(Clone::clone)
        .context("Invalid thinking tag pattern")?;
    Ok(re.replace_all(text, "").into_owned())
}

/// Drop a tag that is still being streamed at the end of `text`, e.g. a
/// trailing `<read_fi`.
///
/// # Errors
///
/// Fails if the tag pattern does not compile.
pub fn strip_trailing_partial_tag(text: &str) -> anyhow::Result<String> {
    let re = TRAILING_PARTIAL_TAG
        .as_ref()
        .map_err(Clone::clone)
        .context("Invalid partial tag pattern")?;
    Ok(re.replace(text, "").into_owned())
}

fn push_text(blocks: &mut Vec<AssistantBlock>, text: &str, partial: bool) {
    let content = text.trim();
    if !content.is_empty() {
        blocks.push(AssistantBlock::Text {
            content: content.to_string(),
            partial,
        });
    }
}

fn find_tool_open<'a>(text: &str, tool_names: &'a [String]) -> Option<(usize, &'a str)> {
    tool_names
        .iter()
        .filter_map(|name| {
            text.find(&format!("<{name}>"))
                .map(|index| (index, name.as_str()))
        })
        .min_by_key(|(index, _)| *index)
}

fn parse_params(body: &str) -> Value {
    let mut params = Map::new();
    let mut rest = body;

    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(tag_end) = after.find('>') else {
            break;
        };
        let tag = &after[..tag_end];
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            rest = after;
            continue;
        }

        let value = &after[tag_end + 1..];
        let closing = format!("</{tag}>");
        // File contents may themselves contain the closing tag.
        let end = if tag == "content" {
            value.rfind(&closing)
        } else {
            value.find(&closing)
        };
        if let Some(end) = end {
            params.insert(tag.to_string(), Value::String(value[..end].trim().to_string()));
            rest = &value[end + closing.len()..];
        } else {
            let partial = strip_partial_closing(value, &closing);
            params.insert(tag.to_string(), Value::String(partial.trim().to_string()));
            break;
        }
    }

    Value::Object(params)
}

/// Trim a prefix of `closing` that the stream has only partly delivered.
fn strip_partial_closing<'a>(text: &'a str, closing: &str) -> &'a str {
    (1..closing.len())
        .rev()
        .find(|&len| text.ends_with(&closing[..len]))
        .map_or(text, |len| &text[..text.len() - len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools() -> Vec<String> {
        vec!["read_file".to_string(), "list_files".to_string()]
    }

    fn tool(name: &str, input: Value, partial: bool) -> AssistantBlock {
        AssistantBlock::ToolUse(ToolUseRequest {
            id: None,
            name: name.to_string(),
            input,
            partial,
        })
    }

    #[test]
    fn plain_text_is_one_partial_block() {
        let blocks = parse_assistant_message("Hello there", &tools());
        assert_eq!(
            blocks,
            vec![AssistantBlock::Text {
                content: "Hello there".to_string(),
                partial: true
            }]
        );
    }

    #[test]
    fn complete_tool_use_closes_preceding_text() {
        let text = "Let me look.\n<read_file>\n<path>src/main.rs</path>\n</read_file>";
        let blocks = parse_assistant_message(text, &tools());
        assert_eq!(
            blocks,
            vec![
                AssistantBlock::Text {
                    content: "Let me look.".to_string(),
                    partial: false
                },
                tool("read_file", json!({ "path": "src/main.rs" }), false),
            ]
        );
    }

    #[test]
    fn unclosed_tool_use_is_partial_with_params_so_far() {
        let blocks = parse_assistant_message("<list_files>\n<path>sr", &tools());
        assert_eq!(blocks, vec![tool("list_files", json!({ "path": "sr" }), true)]);

        let blocks = parse_assistant_message("<list_files>\n<path>src</pa", &tools());
        assert_eq!(blocks, vec![tool("list_files", json!({ "path": "src" }), true)]);
    }

    #[test]
    fn unknown_tags_stay_text() {
        let blocks = parse_assistant_message("<b>bold</b>", &tools());
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], AssistantBlock::Text { content, .. } if content == "<b>bold</b>"));
    }

    #[test]
    fn text_after_tool_use_is_kept() {
        let text = "<list_files><path>.</path></list_files>\nextra";
        let blocks = parse_assistant_message(text, &tools());
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].is_partial());
        assert!(blocks[1].is_partial());
    }

    #[test]
    fn finalize_clears_partial() {
        let mut block = tool("read_file", json!({}), true);
        block.finalize();
        assert!(!block.is_partial());
    }

    #[test]
    fn tag_patterns_compile() {
        assert!(THINKING_TAGS.is_ok());
        assert!(TRAILING_PARTIAL_TAG.is_ok());
    }

    #[test]
    fn thinking_tags_are_removed() -> anyhow::Result<()> {
        let text = "<thinking>\nplan first\n</thinking>\nAnswer";
        assert_eq!(strip_thinking_tags(text)?, "plan first\nAnswer");
        Ok(())
    }

    #[test]
    fn trailing_partial_tag_is_removed() -> anyhow::Result<()> {
        assert_eq!(strip_trailing_partial_tag("Reading now <read_fi")?, "Reading now");
        assert_eq!(strip_trailing_partial_tag("Done </")?, "Done");
        assert_eq!(strip_trailing_partial_tag("a < b is true")?, "a < b is true");
        Ok(())
    }
}
