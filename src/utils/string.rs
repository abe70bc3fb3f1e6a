/// Find the largest valid UTF-8 boundary at or before the given byte index.
#[inline]
fn safe_byte_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    s.char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max_bytes)
        .last()
        .unwrap_or(0)
}

/// Truncate a string to a maximum byte length, returning a borrowed slice
/// (UTF-8 safe). Used to bound log lines and event payloads.
#[inline]
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let boundary = safe_byte_boundary(s, max_len);
        &s[..boundary]
    }
}

/// Reduce a human-supplied name to a branch-safe slug: lowercase ASCII
/// alphanumerics with single dashes, no leading/trailing dash.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("worker");
    }
    out
}

/// First 8 characters of an id, for branch names and display.
pub fn short_id(id: &str) -> &str {
    truncate_str(id, 8)
}
