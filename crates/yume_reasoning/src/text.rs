use regex::Regex;
use std::sync::LazyLock;

static RE_THINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Remove `<think>…</think>` reasoning blocks some models emit, then trim.
pub fn clean_think_tags(text: &str) -> String {
    RE_THINK.replace_all(text, "").trim().to_string()
}

/// Normalise a classifier answer: drop reasoning, quotes and punctuation the
/// model tends to wrap around a single label.
pub fn normalize_label(text: &str) -> String {
    clean_think_tags(text)
        .trim_matches(|c: char| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '“' | '”' | '「' | '」' | '。' | '.' | '；' | ';')
        })
        .to_string()
}
