//! Small string helpers shared across channels and logging.

/// Truncate a string to at most `max_chars` characters, appending "..." when
/// something was cut. Operates on character boundaries so multi-byte UTF-8
/// (emoji, CJK) never panics.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Greatest valid UTF-8 char boundary at or below `index`.
///
/// Mirrors `str::floor_char_boundary` while staying on stable toolchains.
pub fn floor_utf8_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
