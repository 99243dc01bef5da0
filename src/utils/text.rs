pub fn truncate_utf8_prefix(value: &str, max_bytes: usize) -> String {
    if max_bytes == 0 {
        return String::new();
    }
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// One-line preview for log metadata: newlines flattened, long text cut with an ellipsis.
pub fn preview(value: &str, max_bytes: usize) -> String {
    let flat = value.replace(['\r', '\n'], " ");
    if flat.len() <= max_bytes {
        return flat;
    }
    format!("{}...", truncate_utf8_prefix(&flat, max_bytes))
}

/// Lossy decode that drops a single trailing newline sequence.
pub fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(&['\r', '\n'][..])
        .to_string()
}
