//! FHIR search value escaping (`\$`, `\|`, `\,`, `\\`).

/// Splits `input` on `sep`, treating a backslash-escaped separator as a
/// literal character rather than a split point.
pub fn split_unescaped(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                current.push('\\');
                current.push(next);
                chars.next();
                continue;
            }
        }
        if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Unescapes a FHIR search value: `\\`, `\,`, `\$`, `\|` map to the literal
/// character; any other escape sequence is malformed.
pub fn unescape_search_value(input: &str) -> Result<String, ()> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some(',') => out.push(','),
                Some('$') => out.push('$'),
                Some('|') => out.push('|'),
                _ => return Err(()),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_unescaped_comma() {
        assert_eq!(split_unescaped("a,b,c", ','), vec!["a", "b", "c"]);
    }

    #[test]
    fn keeps_escaped_comma_together() {
        assert_eq!(split_unescaped(r"a\,b,c", ','), vec![r"a\,b", "c"]);
    }

    #[test]
    fn unescapes_known_sequences() {
        assert_eq!(unescape_search_value(r"a\,b\|c\$d\\e"), Ok("a,b|c$d\\e".to_string()));
    }

    #[test]
    fn rejects_unknown_escape() {
        assert_eq!(unescape_search_value(r"a\nb"), Err(()));
    }
}
