//! Model-response parsing.
//!
//! Providers are asked for JSON-only output but routinely wrap it in
//! markdown fences or leading prose. This strips the wrapping and pulls the
//! first complete JSON value out of the text; anything that still fails to
//! parse is an `invalid_response`, which the executor treats as
//! advance-to-next-candidate.

use crate::error::{ExtractError, ExtractResult};

/// Parse the model's reply into a JSON value.
pub fn parse_structured(text: &str) -> ExtractResult<serde_json::Value> {
    let trimmed = strip_fences(text.trim());

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(candidate) = first_json_span(trimmed) {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(value);
        }
    }

    Err(ExtractError::invalid_response(
        "model reply did not contain parseable JSON",
    )
    .with_detail(text.chars().take(512).collect::<String>()))
}

/// Strip a ```json ... ``` (or bare ```) fence when the reply is wrapped.
fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// Locate the first balanced `{...}` or `[...]` span.
fn first_json_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let (open, close) = match bytes[start] {
        b'{' => (b'{', b'}'),
        _ => (b'[', b']'),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json() {
        assert_eq!(
            parse_structured(r#"{"title":"Hi"}"#).unwrap(),
            json!({"title":"Hi"})
        );
        assert_eq!(parse_structured("[1,2,3]").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn strips_markdown_fences() {
        let fenced = "```json\n{\"x\": 1}\n```";
        assert_eq!(parse_structured(fenced).unwrap(), json!({"x": 1}));

        let bare_fence = "```\n[true]\n```";
        assert_eq!(parse_structured(bare_fence).unwrap(), json!([true]));
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let chatty = "Here is the data you asked for:\n{\"a\": {\"b\": [1, 2]}}\nHope that helps!";
        assert_eq!(
            parse_structured(chatty).unwrap(),
            json!({"a": {"b": [1, 2]}})
        );
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let tricky = r#"noise {"text": "a } inside", "n": 1} trailing"#;
        assert_eq!(
            parse_structured(tricky).unwrap(),
            json!({"text": "a } inside", "n": 1})
        );
    }

    #[test]
    fn unparseable_reply_is_invalid_response() {
        let err = parse_structured("I could not find any data on that page.").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidResponse);
    }
}
