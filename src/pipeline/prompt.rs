//! Prompt composition.
//!
//! Builds the single user message sent through the fallback chain. The two
//! input forms produce distinct framing so the model knows whether it is
//! filling a schema or answering an instruction; hints from the
//! preprocessor chain are folded in between.

use crate::pipeline::{ExtractionSpec, InputFormat};

/// Compose the extraction prompt. Returns the prompt text and which input
/// form it used, recorded on the result as `input_format`.
pub fn compose(spec: &ExtractionSpec, hints: &[String], content: &str) -> (String, InputFormat) {
    match spec {
        ExtractionSpec::Schema(schema) => {
            let schema_text = serde_json::to_string_pretty(schema)
                .unwrap_or_else(|_| schema.to_string());
            let mut prompt = String::with_capacity(content.len() + schema_text.len() + 512);
            prompt.push_str(
                "Extract structured data from the page content below. \
                 Respond with a single JSON value that conforms to this schema. \
                 Output JSON only, no commentary.\n\nSchema:\n",
            );
            prompt.push_str(&schema_text);
            push_hints(&mut prompt, hints);
            prompt.push_str("\n\nPage content:\n");
            prompt.push_str(content);
            (prompt, InputFormat::Schema)
        }
        ExtractionSpec::Prompt(instruction) => {
            let mut prompt = String::with_capacity(content.len() + instruction.len() + 256);
            prompt.push_str(
                "Answer the instruction using only the page content below. \
                 Respond with a single JSON value. Output JSON only, no commentary.\n\nInstruction:\n",
            );
            prompt.push_str(instruction);
            push_hints(&mut prompt, hints);
            prompt.push_str("\n\nPage content:\n");
            prompt.push_str(content);
            (prompt, InputFormat::Prompt)
        }
    }
}

fn push_hints(prompt: &mut String, hints: &[String]) {
    if hints.is_empty() {
        return;
    }
    prompt.push_str("\n\nPage hints:\n");
    for hint in hints {
        prompt.push_str("- ");
        prompt.push_str(hint);
        prompt.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_input_sets_schema_format() {
        let spec = ExtractionSpec::Schema(json!({"title": "string"}));
        let (prompt, format) = compose(&spec, &[], "<h1>Hi</h1>");
        assert_eq!(format, InputFormat::Schema);
        assert!(prompt.contains("\"title\""));
        assert!(prompt.contains("<h1>Hi</h1>"));
        assert!(!prompt.contains("Page hints"));
    }

    #[test]
    fn freeform_input_sets_prompt_format() {
        let spec = ExtractionSpec::Prompt("List every product name".to_string());
        let (prompt, format) = compose(&spec, &[], "body");
        assert_eq!(format, InputFormat::Prompt);
        assert!(prompt.contains("List every product name"));
    }

    #[test]
    fn hints_are_folded_between_spec_and_content() {
        let spec = ExtractionSpec::Prompt("x".to_string());
        let hints = vec!["listing page with 12 repeated elements".to_string()];
        let (prompt, _) = compose(&spec, &hints, "body");
        let hint_pos = prompt.find("listing page").unwrap();
        let content_pos = prompt.find("Page content").unwrap();
        assert!(hint_pos < content_pos);
    }

    #[test]
    fn composition_is_deterministic() {
        let spec = ExtractionSpec::Schema(json!({"a": 1}));
        let hints = vec!["h1".to_string(), "h2".to_string()];
        let first = compose(&spec, &hints, "content");
        let second = compose(&spec, &hints, "content");
        assert_eq!(first.0, second.0);
    }
}
