//! `{key}` placeholder substitution for request texts.

use serde_json::Value;
use std::collections::HashMap;

/// Render a template, replacing `{key}` with the matching parameter.
///
/// String parameters are inserted verbatim; other JSON values use their
/// compact JSON form. Unknown placeholders are left untouched.
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}`.
///
/// # Example
///
/// ```
/// use advisor_pipeline::prompt::render;
/// use serde_json::json;
/// use std::collections::HashMap;
///
/// let mut params = HashMap::new();
/// params.insert("name".to_string(), json!("Alice"));
/// let result = render("Hello {name}, here is JSON: {{\"key\": \"val\"}}", &params);
/// assert_eq!(result, r#"Hello Alice, here is JSON: {"key": "val"}"#);
/// ```
pub fn render(template: &str, params: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{') {
            if let Some(close) = tail[1..].find('}') {
                let key = &tail[1..1 + close];
                if let Some(value) = params.get(key) {
                    // Inserted values are never scanned again.
                    out.push_str(&value_to_text(value));
                    rest = &tail[close + 2..];
                    continue;
                }
            }
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

/// Convert a parameter value to the text substituted into a template.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
