//! Locating the JSON payload inside a free-form model reply.
//!
//! Models wrap structured output in reasoning blocks, markdown fences and
//! polite prose. These helpers peel those layers off without calling the
//! model again.

/// Remove `<think>...</think>` and `<thinking>...</thinking>` blocks and trim.
///
/// An unclosed block swallows the rest of the text.
///
/// ```
/// use advisor_pipeline::decoder::extract::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>hmm</think> {\"a\":1}"), "{\"a\":1}");
/// assert_eq!(strip_think_tags("<thinking>never closed"), "");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let once = strip_block(text, "<think>", "</think>");
    strip_block(&once, "<thinking>", "</thinking>").trim().to_string()
}

fn strip_block(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        match rest[start..].find(close) {
            Some(end) => rest = &rest[start + end + close.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Body of the first fenced code block, preferring one tagged `lang`.
///
/// ```
/// use advisor_pipeline::decoder::extract::fenced_block;
///
/// let text = "```text\nnot it\n```\n```json\n{\"a\": 1}\n```";
/// assert_eq!(fenced_block(text, "json"), Some("{\"a\": 1}"));
/// ```
pub fn fenced_block<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let blocks = fenced_blocks(text);
    blocks
        .iter()
        .find(|(tag, _)| tag.eq_ignore_ascii_case(lang))
        .or_else(|| blocks.first())
        .map(|(_, body)| *body)
}

/// All complete fenced blocks as `(language_tag, trimmed_body)`.
fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(line_end) = after.find('\n') else {
            break;
        };
        let tag = after[..line_end].trim();
        let body_start = &after[line_end + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        blocks.push((tag, body_start[..close].trim()));
        rest = &body_start[close + 3..];
    }
    blocks
}

/// The last top-level `open ... close` region, nesting- and string-aware.
///
/// The last region is preferred because models tend to restate examples
/// before giving their actual answer.
///
/// ```
/// use advisor_pipeline::decoder::extract::last_bracketed;
///
/// let text = r#"e.g. {"a": 0}. Answer: {"a": [1, 2]}"#;
/// assert_eq!(last_bracketed(text, '{', '}'), Some(r#"{"a": [1, 2]}"#));
/// ```
pub fn last_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut best = None;
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' && depth > 0 {
            in_string = true;
        } else if ch == open {
            if depth == 0 {
                start = i;
            }
            depth += 1;
        } else if ch == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                best = Some(&text[start..i + ch.len_utf8()]);
            }
        }
    }
    best
}

/// Candidate JSON substrings, most specific first, deduplicated.
pub(crate) fn json_candidates(cleaned: &str) -> Vec<&str> {
    let mut out: Vec<&str> = vec![cleaned];
    if let Some(block) = fenced_block(cleaned, "json") {
        out.push(block);
    }
    if let Some(obj) = last_bracketed(cleaned, '{', '}') {
        out.push(obj);
    }
    if let Some(arr) = last_bracketed(cleaned, '[', ']') {
        out.push(arr);
    }
    let mut seen = Vec::with_capacity(out.len());
    out.retain(|c| {
        if seen.contains(c) {
            false
        } else {
            seen.push(*c);
            true
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_multiple_think_blocks() {
        let text = "<think>a</think>one <thinking>b</thinking>two";
        assert_eq!(strip_think_tags(text), "one two");
    }

    #[test]
    fn test_fenced_block_falls_back_to_untagged() {
        let text = "Here:\n```\n[1, 2]\n```";
        assert_eq!(fenced_block(text, "json"), Some("[1, 2]"));
    }

    #[test]
    fn test_fenced_block_unclosed_is_none() {
        assert_eq!(fenced_block("```json\n{\"a\": 1}", "json"), None);
    }

    #[test]
    fn test_last_bracketed_ignores_braces_in_strings() {
        let text = r#"{"s": "}{", "n": 1}"#;
        assert_eq!(last_bracketed(text, '{', '}'), Some(text));
    }

    #[test]
    fn test_last_bracketed_unbalanced() {
        assert_eq!(last_bracketed("{\"a\": 1", '{', '}'), None);
    }

    #[test]
    fn test_json_candidates_order() {
        let text = "Sure!\n```json\n{\"a\": 1}\n```";
        let c = json_candidates(text);
        assert_eq!(c[0], text);
        assert_eq!(c[1], "{\"a\": 1}");
        assert_eq!(c.len(), 2);
    }
}
