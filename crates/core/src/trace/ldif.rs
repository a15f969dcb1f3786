//! Minimal LDIF line handling: value safety, base64, folding and
//! attribute line parsing (RFC 2849).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Maximum physical line length before folding.
pub const FOLD_WIDTH: usize = 76;

/// Whether `value` may be written as a plain `SAFE-STRING`.
///
/// Only printable ASCII is written verbatim; a value may not start with a
/// space, colon or `<`, nor end with a space.
pub fn is_safe(value: &[u8]) -> bool {
    if let Some(first) = value.first() {
        if matches!(first, b' ' | b':' | b'<') {
            return false;
        }
    }
    if value.last() == Some(&b' ') {
        return false;
    }
    value.iter().all(|b| (0x20..=0x7e).contains(b))
}

/// Render one `name: value` or `name:: base64` line (unfolded).
pub fn attr_line(name: &str, value: &[u8]) -> String {
    if is_safe(value) {
        // Safe values are ASCII.
        format!("{name}: {}", String::from_utf8_lossy(value))
    } else {
        format!("{name}:: {}", STANDARD.encode(value))
    }
}

/// Append `line` to `out`, folded at [`FOLD_WIDTH`], followed by a newline.
pub fn push_folded(out: &mut String, line: &str) {
    // Every line produced by `attr_line` for an ASCII name is ASCII, so
    // byte offsets are character boundaries.
    if !line.is_ascii() || line.len() <= FOLD_WIDTH {
        out.push_str(line);
        out.push('\n');
        return;
    }
    let (head, mut rest) = line.split_at(FOLD_WIDTH);
    out.push_str(head);
    out.push('\n');
    while !rest.is_empty() {
        let take = rest.len().min(FOLD_WIDTH - 1);
        let (chunk, tail) = rest.split_at(take);
        out.push(' ');
        out.push_str(chunk);
        out.push('\n');
        rest = tail;
    }
}

/// Split an unfolded attribute line into its name and decoded value.
pub fn parse_attr_line(line: &str) -> Result<(String, Vec<u8>), String> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| format!("missing ':' in '{line}'"))?;
    if name.is_empty() {
        return Err(format!("missing attribute name in '{line}'"));
    }
    let value = match rest.strip_prefix(':') {
        Some(encoded) => STANDARD
            .decode(encoded.trim_start_matches(' '))
            .map_err(|e| format!("bad base64 for '{name}': {e}"))?,
        None => rest.trim_start_matches(' ').as_bytes().to_vec(),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_values() {
        assert!(is_safe(b"alice"));
        assert!(is_safe(b""));
        assert!(!is_safe(b" leading"));
        assert!(!is_safe(b"trailing "));
        assert!(!is_safe(b":colon"));
        assert!(!is_safe(b"<url"));
        assert!(!is_safe("caf\u{e9}".as_bytes()));
        assert!(!is_safe(b"two\nlines"));
    }

    #[test]
    fn test_attr_line_roundtrip() {
        let values: [&[u8]; 4] = [b"alice", b"", b" x", &[0, 159, 146, 150]];
        for value in values {
            let line = attr_line("cn", value);
            assert_eq!(parse_attr_line(&line).unwrap(), ("cn".to_string(), value.to_vec()));
        }
        assert_eq!(attr_line("cn", b" x"), "cn:: IHg=");
    }

    #[test]
    fn test_folding() {
        let long = format!("description: {}", "x".repeat(200));
        let mut out = String::new();
        push_folded(&mut out, &long);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines.iter().all(|l| l.len() <= FOLD_WIDTH));
        assert!(lines[1..].iter().all(|l| l.starts_with(' ')));
        let unfolded: String = lines
            .iter()
            .enumerate()
            .map(|(i, l)| if i == 0 { *l } else { &l[1..] })
            .collect();
        assert_eq!(unfolded, long);
    }

    #[test]
    fn test_parse_attr_line_errors() {
        assert!(parse_attr_line("no colon here").is_err());
        assert!(parse_attr_line(": value").is_err());
        assert!(parse_attr_line("cn:: !!!").is_err());
    }
}
