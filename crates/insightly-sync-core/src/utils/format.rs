/// Number of leading characters kept visible by [`redact`]
const REDACT_VISIBLE_CHARS: usize = 4;

/// Mask a secret for logs and `Debug` output, keeping a short prefix so
/// operators can tell which credential is loaded.
pub fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(REDACT_VISIBLE_CHARS).collect();
    if secret.chars().count() <= REDACT_VISIBLE_CHARS * 2 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

/// Flatten line breaks into spaces and trim, so a CRM text field stays on one
/// spreadsheet row.
pub fn clean_text(s: &str) -> String {
    s.replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string()
}

/// Shorten `s` to at most `max_chars` characters by cutting out the middle.
///
/// Share links differ mostly in their host and trailing token, so both ends
/// are kept and joined with `...`.
pub fn elide_middle(s: &str, max_chars: usize) -> String {
    const MARK: &str = "...";
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }
    if max_chars <= MARK.len() {
        return s.chars().take(max_chars).collect();
    }
    let keep = max_chars - MARK.len();
    let tail = keep / 2;
    let head = keep - tail;
    let head_end = s.char_indices().nth(head).map_or(s.len(), |(i, _)| i);
    let tail_start = s.char_indices().nth(len - tail).map_or(s.len(), |(i, _)| i);
    format!("{}{}{}", &s[..head_end], MARK, &s[tail_start..])
}
