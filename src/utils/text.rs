//! Text processing utilities.

/// True when the text has at least one non-whitespace character.
pub fn has_meaningful_content(content: &str) -> bool {
    content.chars().any(|c| !c.is_whitespace())
}

/// First `max_chars` characters, with `...` appended when the text was longer.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Last `max_chars` characters of the text.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    let byte_idx = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(idx, _)| idx);
    &text[byte_idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_meaningful_content() {
        assert!(!has_meaningful_content(""));
        assert!(!has_meaningful_content("   \n\n   "));
        assert!(has_meaningful_content("a"));
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 200), "short");
        let long = "a".repeat(250);
        let cut = excerpt(&long, 200);
        assert_eq!(cut.len(), 203);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt(&"b".repeat(200), 200), "b".repeat(200));
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let text = "é".repeat(10);
        assert_eq!(excerpt(&text, 3), "ééé...");
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("ñandú", 2), "dú");
    }
}
