use unicode_normalization::UnicodeNormalization;

/// Characters that survive HTML extraction but carry no content: zero-width
/// space, BOM, and directional marks.
const HIDDEN_CHARS: [char; 4] = ['\u{200b}', '\u{feff}', '\u{200e}', '\u{200f}'];

/// Normalizes a raw text fragment for comparison and persistence:
/// HTML entities resolved, NFKC fold (full-width Latin/digits become
/// half-width), hidden characters stripped, whitespace collapsed.
///
/// Returns `None` when nothing is left, so callers never store empty strings.
pub fn clean_text(input: &str) -> Option<String> {
    let unescaped = html_escape::decode_html_entities(input);
    let folded: String = unescaped
        .nfkc()
        .filter(|ch| !HIDDEN_CHARS.contains(ch))
        .map(|ch| if ch == '\u{a0}' { ' ' } else { ch })
        .collect();
    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Cleans each item and drops duplicates while preserving first-seen order.
pub fn clean_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if let Some(cleaned) = clean_text(item.as_ref()) {
            if seen.insert(cleaned.clone()) {
                out.push(cleaned);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_strips_hidden_chars() {
        assert_eq!(
            clean_text("  hello\u{200b}   world\u{feff} ").as_deref(),
            Some("hello world")
        );
    }

    #[test]
    fn folds_full_width_to_half_width() {
        assert_eq!(clean_text("ＡＢＣ１２３").as_deref(), Some("ABC123"));
    }

    #[test]
    fn resolves_html_entities() {
        assert_eq!(
            clean_text("Guns &amp; Roses &lt;live&gt;").as_deref(),
            Some("Guns & Roses <live>")
        );
    }

    #[test]
    fn empty_after_cleaning_is_none() {
        assert_eq!(clean_text("  \u{200b}\u{feff} "), None);
        assert_eq!(clean_text(""), None);
    }

    #[test]
    fn cleaning_is_idempotent() {
        for raw in ["ＴＯＫＹＯ  ｄｏｍｅ", "a &amp; b", " plain "] {
            let once = clean_text(raw).unwrap();
            assert_eq!(clean_text(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn list_dedup_preserves_order() {
        let cleaned = clean_list(["B", "Ａ", "A", "B", ""]);
        assert_eq!(cleaned, vec!["B".to_string(), "A".to_string()]);
    }
}
