//! Text encoding for row values and protocol lines.
//!
//! A line is a comma separated list of fields. Non-null values are written
//! in double quotes with `""` for an embedded quote and backslash escapes
//! for line breaks, so every line stays a single physical line. An empty
//! unquoted field is SQL NULL, which keeps NULL distinct from the empty
//! string (`""`). Keywords and simple names are written bare.

use crate::error::SyncError;
use crate::model::RowValues;

/// Encode a list of values as one line without a trailing newline.
pub fn encode(values: &[Option<String>]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if let Some(value) = value {
            push_quoted(&mut out, value);
        }
    }
    out
}

/// Encode a protocol line: a bare keyword followed by quoted values.
pub fn encode_line(keyword: &str, values: &[Option<String>]) -> String {
    let mut out = String::from(keyword);
    for value in values {
        out.push(',');
        if let Some(value) = value {
            push_quoted(&mut out, value);
        }
    }
    out
}

/// Encode a protocol line whose arguments are names, written bare when safe.
pub fn encode_names_line<S: AsRef<str>>(keyword: &str, names: &[S]) -> String {
    let mut out = String::from(keyword);
    for name in names {
        out.push(',');
        let name = name.as_ref();
        if is_bare(name) {
            out.push_str(name);
        } else {
            push_quoted(&mut out, name);
        }
    }
    out
}

/// Decode one line into fields. Bare fields keep their text; empty bare fields are NULL.
pub fn decode(line: &str) -> Result<RowValues, SyncError> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            value.push('"');
                        } else {
                            break;
                        }
                    }
                    Some('\\') => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('r') => value.push('\r'),
                        Some('\\') => value.push('\\'),
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => return Err(malformed("dangling escape")),
                    },
                    Some(c) => value.push(c),
                    None => return Err(malformed("unterminated quoted value")),
                }
            }
            fields.push(Some(value));
            match chars.next() {
                None => break,
                Some(',') => continue,
                Some(c) => {
                    return Err(malformed(&format!(
                        "unexpected character '{c}' after quoted value"
                    )))
                }
            }
        } else {
            let mut value = String::new();
            let mut ended = true;
            for c in chars.by_ref() {
                if c == ',' {
                    ended = false;
                    break;
                }
                value.push(c);
            }
            fields.push(if value.is_empty() { None } else { Some(value) });
            if ended {
                break;
            }
        }
    }
    Ok(fields)
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn is_bare(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '$' | ':'))
}

fn malformed(message: &str) -> SyncError {
    SyncError::Protocol {
        line: 0,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn test_null_and_empty_are_distinct() {
        let values = vec![s("1"), None, s(""), s("x")];
        let line = encode(&values);
        assert_eq!(line, r#""1",,"","x""#);
        assert_eq!(decode(&line).unwrap(), values);
    }

    #[test]
    fn test_special_characters_survive() {
        let values = vec![s("say \"hi\""), s("a,b"), s("line1\nline2\r"), s("back\\slash")];
        let line = encode(&values);
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line).unwrap(), values);
    }

    #[test]
    fn test_protocol_line_with_keyword() {
        let line = encode_line("insert", &[s("1"), None]);
        assert_eq!(line, r#"insert,"1","#);
        assert_eq!(decode(&line).unwrap(), vec![s("insert"), s("1"), None]);
    }

    #[test]
    fn test_names_line_quotes_only_when_needed() {
        let line = encode_names_line("columns", &["id", "first name", "qty"]);
        assert_eq!(line, r#"columns,id,"first name",qty"#);
        assert_eq!(
            decode(&line).unwrap(),
            vec![s("columns"), s("id"), s("first name"), s("qty")]
        );
    }

    #[test]
    fn test_trailing_null() {
        assert_eq!(decode("a,").unwrap(), vec![s("a"), None]);
        assert_eq!(decode("").unwrap(), vec![None]);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(decode(r#""open"#).is_err());
        assert!(decode(r#""a"b"#).is_err());
    }
}
