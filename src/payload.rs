//! CSV row payload codec.
//!
//! Captured rows store their new, old and primary key values as a single CSV
//! line in snapshot column order:
//!
//! ```text
//! "42","widget",,"say \"hi\""
//!  │     │     │   └── quoted value, \" and \\ escapes
//!  │     │     └────── unquoted empty token = NULL
//!  │     └──────────── quoted value
//!  └────────────────── values are always quoted on encode
//! ```
//!
//! `""` (a quoted empty token) is the empty string, distinct from NULL.
//! Unquoted non-empty tokens are accepted on decode (hand-written payloads,
//! numeric literals) and returned verbatim.

use crate::error::{ReplicationError, Result};

/// Encode values into a payload line.
pub fn encode_row(values: &[Option<&str>]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if let Some(value) = value {
            out.push('"');
            for ch in value.chars() {
                if ch == '"' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
    }
    out
}

/// Encode owned values.
pub fn encode_values(values: &[Option<String>]) -> String {
    let borrowed: Vec<Option<&str>> = values.iter().map(|v| v.as_deref()).collect();
    encode_row(&borrowed)
}

/// Decode a payload line. Never panics on malformed input.
pub fn decode_row(line: &str) -> Result<Vec<Option<String>>> {
    let mut values = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => {
                            return Err(ReplicationError::Payload(
                                "dangling escape at end of payload".to_string(),
                            ))
                        }
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(ReplicationError::Payload(format!(
                    "unterminated quoted value at column {}",
                    values.len() + 1
                )));
            }
            values.push(Some(value));
            match chars.next() {
                None => break,
                Some(',') => continue,
                Some(other) => {
                    return Err(ReplicationError::Payload(format!(
                        "unexpected '{}' after quoted value at column {}",
                        other,
                        values.len()
                    )))
                }
            }
        } else {
            let mut raw = String::new();
            let mut more = false;
            for ch in chars.by_ref() {
                if ch == ',' {
                    more = true;
                    break;
                }
                if ch == '"' {
                    return Err(ReplicationError::Payload(format!(
                        "stray quote in unquoted value at column {}",
                        values.len() + 1
                    )));
                }
                raw.push(ch);
            }
            values.push(if raw.is_empty() { None } else { Some(raw) });
            if !more {
                break;
            }
        }
    }

    Ok(values)
}
