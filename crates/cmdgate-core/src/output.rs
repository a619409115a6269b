//! Shaping of captured process output before it goes into a chat message.

/// Room left in a message for the surrounding reply text.
pub const MESSAGE_MARGIN: usize = 100;

pub const TRUNCATION_MARKER: &str = "(log truncated)\n";

/// Decode `bytes` as UTF-8, replacing every invalid sequence with `.`.
pub fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| if c == char::REPLACEMENT_CHARACTER { '.' } else { c })
        .collect()
}

/// Keep at most the last `limit` bytes of `text`, cut on a char boundary,
/// prefixed by [`TRUNCATION_MARKER`]. Text within the limit is unchanged.
pub fn limit_log(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATION_MARKER}{}", &text[start..])
}

/// Byte budget for output in a message of `message_limit` bytes.
pub fn output_budget(message_limit: usize) -> usize {
    message_limit.saturating_sub(MESSAGE_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_bytes_become_dots() {
        assert_eq!(sanitize_output(b"ok\xff\xfeend"), "ok..end");
        assert_eq!(sanitize_output("日本".as_bytes()), "日本");
    }

    #[test]
    fn short_text_passes_through() {
        let text = "a".repeat(50);
        assert_eq!(limit_log(&text, 50), text);
    }

    #[test]
    fn long_text_keeps_tail() {
        let text = format!("{}{}", "x".repeat(30), "y".repeat(20));
        let limited = limit_log(&text, 20);
        assert_eq!(limited, format!("{TRUNCATION_MARKER}{}", "y".repeat(20)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ああああ";
        let limited = limit_log(text, 5);
        assert_eq!(limited, format!("{TRUNCATION_MARKER}あ"));
    }

    #[test]
    fn budget_subtracts_margin() {
        assert_eq!(output_budget(2000), 1900);
        assert_eq!(output_budget(10), 0);
    }
}
