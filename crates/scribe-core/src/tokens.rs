//! Token estimation shared by every budget decision.

/// Characters per token assumed by the estimator.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text` (characters / 4, rounded up).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

/// Cut `text` so its estimate does not exceed `max_tokens`.
///
/// Cuts on the last whitespace inside the limit when there is one, so
/// words are not split. Text already within the limit is returned as is.
pub fn truncate_to_tokens(text: &str, max_tokens: u32) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = (max_tokens as usize).saturating_mul(CHARS_PER_TOKEN);
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let head = &text[..cut];
    let head = match head.rfind(char::is_whitespace) {
        Some(i) if i > 0 => &head[..i],
        _ => head,
    };
    head.trim_end().to_string()
}
