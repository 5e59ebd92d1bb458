//! RFC-5545 §3.3.11 text escaping and §3.1 line folding/unfolding.

/// Escape a text value for use inside an iCalendar content line.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Reverse of `escape_text`.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.peek() {
                Some('n') | Some('N') => {
                    out.push('\n');
                    chars.next();
                }
                Some(';') => {
                    out.push(';');
                    chars.next();
                }
                Some(',') => {
                    out.push(',');
                    chars.next();
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

const FOLD_WIDTH: usize = 75;

/// Fold a single logical content line at 75 octets, continuation lines
/// prefixed with a single space.
pub fn fold_line(line: &str) -> String {
    let bytes = line.as_bytes();
    if bytes.len() <= FOLD_WIDTH {
        return line.to_string();
    }

    let mut out = String::new();
    let mut start = 0;
    let mut first = true;
    while start < bytes.len() {
        let width = if first { FOLD_WIDTH } else { FOLD_WIDTH - 1 };
        let mut end = (start + width).min(bytes.len());
        // never split a UTF-8 sequence
        while end < bytes.len() && (bytes[end] & 0xC0) == 0x80 {
            end -= 1;
        }
        if !first {
            out.push_str("\r\n ");
        }
        out.push_str(&line[start..end]);
        start = end;
        first = false;
    }
    out
}

/// Unfold a full iCalendar body: accepts CRLF+SP, CRLF+HTAB, LF+SP, LF+HTAB
/// continuations.
pub fn unfold(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut lines: Vec<String> = Vec::new();
    for raw in normalized.split('\n') {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            let last = lines.last_mut().unwrap();
            last.push_str(&raw[1..]);
        } else if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_special_characters() {
        let input = "Line1\nwith; comma, and \\backslash\r\n";
        let escaped = escape_text(input);
        assert_eq!(escaped, "Line1\\nwith\\; comma\\, and \\\\backslash");
    }

    #[test]
    fn escape_unescape_roundtrip() {
        let input = "Team sync; agenda, notes\nand a \\ literal";
        let escaped = escape_text(input);
        let restored = unescape_text(&escaped);
        assert_eq!(restored, input);
    }

    #[test]
    fn folds_long_lines_at_75_octets() {
        let long = "DESCRIPTION:".to_string() + &"x".repeat(200);
        let folded = fold_line(&long);
        for line in folded.split("\r\n") {
            assert!(line.as_bytes().len() <= 75);
        }
    }

    #[test]
    fn unfolds_mixed_continuations() {
        let text = "BEGIN:VEVENT\r\nSUMMARY:Long\r\n title\nDESCRIPTION:another\r\n\tvalue\r\nEND:VEVENT";
        let lines = unfold(text);
        assert_eq!(lines[1], "SUMMARY:Long title");
        assert_eq!(lines[2], "DESCRIPTION:anothervalue");
    }
}
