//! Token estimation fallback.
//!
//! Providers normally self-report usage counters; when a response omits
//! them the pipeline falls back to a tiktoken estimate so job token
//! accounting and cost fallback stay populated. The cl100k_base encoding is
//! a reasonable cross-provider approximation; exact counts come from the
//! provider whenever available.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Estimate the token count of a text.
///
/// Uses cl100k_base when the encoder loads; otherwise falls back to a
/// chars/4 heuristic so accounting never silently reads zero.
pub fn estimate_tokens(text: &str) -> u32 {
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.chars().count() as u32).div_ceil(4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_input_length() {
        let short = estimate_tokens("hello world");
        let long = estimate_tokens(&"hello world ".repeat(100));
        assert!(short >= 2);
        assert!(long > short * 50);
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }
}
