//! Script minifier / humanizer.
//!
//! The embedded script language is Lua-shaped; the minifier only needs to
//! produce a single-line body safe to round-trip under whitespace
//! normalization. It strips line comments, collapses whitespace outside
//! string literals, and refuses input it cannot re-flow safely (unbalanced
//! delimiters, unterminated strings, bare block fragments) so callers can
//! fall back to plain whitespace collapse.

#[derive(Debug, thiserror::Error)]
pub enum MinifyError {
    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unbalanced {0:?}")]
    Unbalanced(char),

    #[error("bare block fragment")]
    BareFragment,
}

/// Keywords that open a statement; `humanize` breaks lines before these.
const STATEMENT_KEYWORDS: [&str; 9] = [
    "local", "if", "for", "while", "repeat", "return", "function", "end", "else",
];

/// Block openers the minifier refuses to lead with.
const FRAGMENT_KEYWORDS: [&str; 5] = ["if", "for", "while", "do", "repeat"];

pub fn minify(script: &str) -> Result<String, MinifyError> {
    let trimmed = script.trim();
    if let Some(first) = first_word(trimmed) {
        if FRAGMENT_KEYWORDS.contains(&first) {
            return Err(MinifyError::BareFragment);
        }
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut depth: Vec<char> = Vec::new();
    let mut chars = trimmed.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                flush_space(&mut out, &mut pending_space);
                out.push(c);
                let mut closed = false;
                let mut escaped = false;
                for s in chars.by_ref() {
                    out.push(s);
                    if escaped {
                        escaped = false;
                    } else if s == '\\' {
                        escaped = true;
                    } else if s == c {
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(MinifyError::UnterminatedString);
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                // line comment, dropped to end of line
                for s in chars.by_ref() {
                    if s == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '(' | '[' | '{' => {
                flush_space(&mut out, &mut pending_space);
                depth.push(c);
                out.push(c);
            }
            ')' | ']' | '}' => {
                flush_space(&mut out, &mut pending_space);
                let open = matching_open(c);
                if depth.pop() != Some(open) {
                    return Err(MinifyError::Unbalanced(c));
                }
                out.push(c);
            }
            c if c.is_whitespace() => {
                if !out.is_empty() {
                    pending_space = true;
                }
            }
            _ => {
                flush_space(&mut out, &mut pending_space);
                out.push(c);
            }
        }
    }

    if let Some(open) = depth.pop() {
        return Err(MinifyError::Unbalanced(open));
    }

    Ok(out.trim_end().to_string())
}

/// Re-insert line breaks before statement keywords so pulled scripts are
/// readable on disk. Breaks are only placed where whitespace already was,
/// so the result stays equal under whitespace normalization.
pub fn humanize(script: &str) -> String {
    let mut out = String::with_capacity(script.len());
    let mut chars = script.char_indices().peekable();
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    while let Some((i, c)) = chars.next() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = Some(c);
                out.push(c);
            }
            ' ' | '\t' => {
                let rest = &script[i + c.len_utf8()..];
                if let Some(word) = first_word(rest) {
                    if STATEMENT_KEYWORDS.contains(&word) && !out.ends_with('\n') {
                        out.push('\n');
                        continue;
                    }
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}

fn first_word(s: &str) -> Option<&str> {
    let start = s.find(|c: char| !c.is_whitespace())?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

fn matching_open(close: char) -> char {
    match close {
        ')' => '(',
        ']' => '[',
        '}' => '{',
        _ => unreachable!(),
    }
}

fn flush_space(out: &mut String, pending: &mut bool) {
    if *pending {
        out.push(' ');
        *pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::normalize_ws;

    #[test]
    fn collapses_whitespace_and_comments() {
        let script = "local n = self:ind()\n-- send it\ngms(0, 144, n, 127)";
        assert_eq!(
            minify(script).unwrap(),
            "local n = self:ind() gms(0, 144, n, 127)"
        );
    }

    #[test]
    fn string_contents_are_preserved() {
        let script = "print('two  spaces')";
        assert_eq!(minify(script).unwrap(), "print('two  spaces')");
    }

    #[test]
    fn bare_block_fragment_is_rejected() {
        assert!(matches!(
            minify("if self:bva() == 1 then gms() end"),
            Err(MinifyError::BareFragment)
        ));
    }

    #[test]
    fn unbalanced_input_is_rejected() {
        assert!(matches!(
            minify("gms(0, 144"),
            Err(MinifyError::Unbalanced(_))
        ));
        assert!(matches!(
            minify("print('open"),
            Err(MinifyError::UnterminatedString)
        ));
    }

    #[test]
    fn humanize_is_whitespace_normalization_safe() {
        let script = "local n = self:ind() if n > 0 then gms(0, 144, n, 127) end";
        let pretty = humanize(script);
        assert!(pretty.contains('\n'));
        assert_eq!(normalize_ws(&pretty), normalize_ws(script));
    }

    #[test]
    fn humanize_leaves_strings_alone() {
        let script = "print('no if inside')";
        assert_eq!(humanize(script), script);
    }
}
