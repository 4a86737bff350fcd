use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// Token count for a text projection: the BPE when it loads, a chars/4
/// heuristic otherwise. Exactness does not matter here, stability does.
pub(crate) fn count_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => ((text.chars().count() as u64) / 4).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(count_text_tokens(""), 0);
    }

    #[test]
    fn counting_is_deterministic_and_monotonic() {
        let short = count_text_tokens("hello world");
        assert!(short > 0);
        assert_eq!(short, count_text_tokens("hello world"));

        let longer = count_text_tokens(&"hello world ".repeat(50));
        assert!(longer > short);
    }
}
