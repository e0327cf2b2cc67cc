//! Helpers that keep log lines single-line and bounded when they include mesh text or raw
//! frame bytes.
use std::fmt::Write;

/// Escape control characters and cap the output at `max_chars` characters (plus an
/// ellipsis). Safe for any UTF-8 input: truncation happens on character boundaries.
pub fn preview(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars) + 4);
    for (n, ch) in input.chars().enumerate() {
        if n >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Lowercase hex of at most the first `max` bytes.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for b in data.iter().take(max) {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(preview("a\nb\r\tc\u{7}", 80), "a\\nb\\r\\tc\\x07");
    }

    #[test]
    fn truncates_on_char_boundary() {
        // multi-byte characters must never be split
        assert_eq!(preview("ab🙂cd", 3), "ab🙂…");
        assert_eq!(preview("12345—7890", 5), "12345…");
        assert_eq!(preview("hello", 10), "hello");
    }

    #[test]
    fn hex_is_capped() {
        assert_eq!(hex_snippet(&[0x94, 0xC3, 0x00, 0x01], 2), "94c3");
        assert_eq!(hex_snippet(&[], 4), "");
    }
}
