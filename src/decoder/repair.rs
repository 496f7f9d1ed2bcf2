//! Deterministic repair of almost-JSON produced by models.
//!
//! One character pass normalizes the usual mistakes:
//! comments, Python literals (`True`/`False`/`None`), trailing commas,
//! single-quoted strings, unquoted keys, raw newlines inside strings, and
//! unclosed strings/brackets from truncated output.

use serde_json::Value;

/// Repair `broken` into valid JSON.
///
/// Returns `None` when the input is already valid (nothing to repair) or
/// when the repaired text still does not parse.
///
/// ```
/// use advisor_pipeline::decoder::repair::repair_json;
///
/// let fixed = repair_json("{'title': 'Plan', done: True,}").unwrap();
/// assert_eq!(fixed, r#"{"title": "Plan", "done": true}"#);
/// ```
pub fn repair_json(broken: &str) -> Option<String> {
    if serde_json::from_str::<Value>(broken).is_ok() {
        return None;
    }
    let fixed = normalize(broken);
    serde_json::from_str::<Value>(&fixed).ok().map(|_| fixed)
}

/// Close whatever a truncated JSON document left open.
///
/// Only applies to text that starts like JSON (`{` or `[`).
///
/// ```
/// use advisor_pipeline::decoder::repair::complete_truncated;
///
/// let done = complete_truncated(r#"{"name": "Alice", "tags": ["a", "b"#).unwrap();
/// assert_eq!(done, r#"{"name": "Alice", "tags": ["a", "b"]}"#);
/// ```
pub fn complete_truncated(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }
    let fixed = normalize(trimmed);
    serde_json::from_str::<Value>(&fixed).ok().map(|_| fixed)
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    Double,
    Single,
}

fn normalize(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut quote: Option<Quote> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if let Some(q) = quote {
            match ch {
                '\\' if i + 1 < chars.len() => {
                    out.push(ch);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                '"' if q == Quote::Double => {
                    out.push('"');
                    quote = None;
                }
                '"' => out.push_str("\\\""),
                '\'' if q == Quote::Single && closes_single_quote(&chars, i) => {
                    out.push('"');
                    quote = None;
                }
                _ => out.push(ch),
            }
            i += 1;
            continue;
        }

        match ch {
            '"' => {
                quote = Some(Quote::Double);
                out.push('"');
            }
            '\'' if opens_value(&out) => {
                quote = Some(Quote::Single);
                out.push('"');
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            ',' if next_significant(&chars, i + 1).is_some_and(|c| c == '}' || c == ']') => {}
            '{' => {
                closers.push('}');
                out.push(ch);
            }
            '[' => {
                closers.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if closers.last() == Some(&ch) {
                    closers.pop();
                }
                out.push(ch);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    _ if next_significant(&chars, i) == Some(':') => {
                        out.push('"');
                        out.push_str(&word);
                        out.push('"');
                    }
                    _ => out.push_str(&word),
                }
                continue;
            }
            _ => out.push(ch),
        }
        i += 1;
    }

    if quote.is_some() {
        out.push('"');
    }
    close_dangling(&mut out);
    while let Some(closer) = closers.pop() {
        out.push(closer);
    }
    out
}

/// Whether a `'` at this point starts a string (after `{ [ : ,` or at start).
fn opens_value(out: &str) -> bool {
    match out.trim_end().chars().last() {
        None => true,
        Some(c) => matches!(c, '{' | '[' | ':' | ','),
    }
}

/// Whether the `'` at `i` ends a single-quoted string rather than being an apostrophe.
fn closes_single_quote(chars: &[char], i: usize) -> bool {
    match next_significant(chars, i + 1) {
        None => true,
        Some(c) => matches!(c, '}' | ']' | ':' | ','),
    }
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// Drop a trailing comma or a key left without a value.
fn close_dangling(out: &mut String) {
    loop {
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        if out.ends_with(',') {
            out.pop();
        } else if out.ends_with(':') {
            out.push_str(" null");
            return;
        } else {
            return;
        }
    }
}
