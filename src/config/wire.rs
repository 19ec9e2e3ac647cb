//! Device wire form of an event's action list.
//!
//! On the wire an event binding is a single line: `--[[@short#name]]`
//! headers each followed by a minified script body, the whole thing wrapped
//! in `<?lua ` / ` ?>` when placed in an `ACTIONSTRING` parameter.

use super::minify;
use super::model::{normalize_ws, Action};
use super::{ConfigError, Result};

/// Upper bound accepted by the parser.
pub const MAX_WIRE_SCRIPT: usize = 100_000;

const LUA_OPEN: &str = "<?lua ";
const LUA_CLOSE: &str = " ?>";
const HEADER_OPEN: &str = "--[[@";
const HEADER_CLOSE: &str = "]]";

pub fn wrap_actionstring(serialized: &str) -> String {
    format!("{}{}{}", LUA_OPEN, serialized, LUA_CLOSE)
}

/// Strip the `<?lua ?>` wrappers from a received action string.
pub fn unwrap_actionstring(s: &str) -> Option<&str> {
    s.trim()
        .strip_prefix(LUA_OPEN.trim_end())
        .and_then(|rest| rest.strip_suffix(LUA_CLOSE.trim_start()))
        .map(str::trim)
}

/// Parse the action stream of a device-resident script.
///
/// The split on `--[[@…]]` headers is non-greedy: each header's body runs
/// to the next header. An empty or whitespace-only input is a valid empty
/// binding.
pub fn parse_actions(wire: &str) -> Result<Vec<Action>> {
    if wire.len() > MAX_WIRE_SCRIPT {
        return Err(ConfigError::ScriptTooLarge(wire.len()));
    }
    let trimmed = wire.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut actions = Vec::new();
    let mut rest = trimmed;

    let first = rest
        .find(HEADER_OPEN)
        .ok_or_else(|| ConfigError::MalformedActionString("no action header".to_string()))?;
    if !rest[..first].trim().is_empty() {
        return Err(ConfigError::MalformedActionString(format!(
            "unexpected content before first action header: {:?}",
            &rest[..first]
        )));
    }
    rest = &rest[first..];

    while !rest.is_empty() {
        let after_open = &rest[HEADER_OPEN.len()..];
        let close = after_open.find(HEADER_CLOSE).ok_or_else(|| {
            ConfigError::MalformedActionString("unterminated action header".to_string())
        })?;
        let header = &after_open[..close];
        let body_start = HEADER_OPEN.len() + close + HEADER_CLOSE.len();

        let (short, name) = parse_header(header)?;

        let tail = &rest[body_start..];
        let (body, next) = match tail.find(HEADER_OPEN) {
            Some(pos) => (&tail[..pos], &tail[pos..]),
            None => (tail, ""),
        };

        actions.push(Action {
            short: short.to_string(),
            name: name.map(str::to_string),
            script: body.trim().to_string(),
        });
        rest = next;
    }

    Ok(actions)
}

fn parse_header(header: &str) -> Result<(&str, Option<&str>)> {
    let (short, name) = match header.split_once('#') {
        Some((short, name)) => (short, Some(name)),
        None => (header, None),
    };
    if short.is_empty() || !short.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::MalformedActionString(format!(
            "invalid action short: {:?}",
            short
        )));
    }
    if let Some(name) = name {
        if name.is_empty() {
            return Err(ConfigError::MalformedActionString(
                "empty action name".to_string(),
            ));
        }
    }
    Ok((short, name))
}

/// Serialize an action list to the single-line wire form.
///
/// Bodies go through the minifier; bodies the minifier rejects (bare
/// statement fragments) are collapsed to single-space whitespace instead.
pub fn serialize_actions(actions: &[Action]) -> String {
    let mut out = String::new();
    for action in actions {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(HEADER_OPEN);
        out.push_str(&action.short);
        if let Some(name) = &action.name {
            out.push('#');
            out.push_str(name);
        }
        out.push_str(HEADER_CLOSE);

        let body = match minify::minify(&action.script) {
            Ok(minified) => minified,
            Err(e) => {
                log::debug!("Minifier rejected body ({}), collapsing whitespace", e);
                normalize_ws(&action.script)
            }
        };
        if !body.is_empty() {
            out.push(' ');
            out.push_str(&body);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_actions() {
        let wire = "--[[@l#locals]] local n = 1 --[[@gms]] gms(0, 144, n, 127)";
        let actions = parse_actions(wire).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].short, "l");
        assert_eq!(actions[0].name.as_deref(), Some("locals"));
        assert_eq!(actions[0].script, "local n = 1");
        assert_eq!(actions[1].short, "gms");
        assert_eq!(actions[1].name, None);
        assert_eq!(actions[1].script, "gms(0, 144, n, 127)");
    }

    #[test]
    fn empty_input_is_an_empty_binding() {
        assert!(parse_actions("").unwrap().is_empty());
        assert!(parse_actions("   ").unwrap().is_empty());
    }

    #[test]
    fn leading_junk_is_rejected() {
        assert!(parse_actions("junk --[[@l]] x = 1").is_err());
    }

    #[test]
    fn unterminated_header_is_rejected() {
        assert!(parse_actions("--[[@l local n = 1").is_err());
    }

    #[test]
    fn oversized_input_is_rejected() {
        let wire = "x".repeat(MAX_WIRE_SCRIPT + 1);
        assert!(matches!(
            parse_actions(&wire),
            Err(ConfigError::ScriptTooLarge(_))
        ));
    }

    #[test]
    fn wrap_and_unwrap_are_inverse() {
        let wrapped = wrap_actionstring("--[[@l]] x = 1");
        assert_eq!(wrapped, "<?lua --[[@l]] x = 1 ?>");
        assert_eq!(unwrap_actionstring(&wrapped), Some("--[[@l]] x = 1"));
        assert_eq!(unwrap_actionstring("not wrapped"), None);
    }

    #[test]
    fn serialize_round_trips_through_parse() {
        let actions = vec![
            Action::new("l", Some("locals"), "local n =\n  self:ind()"),
            Action::new("gms", None, "gms(0, 144, n, 127)"),
        ];
        let wire = serialize_actions(&actions);
        let parsed = parse_actions(&wire).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            super::super::model::normalize_ws(&parsed[0].script),
            "local n = self:ind()"
        );
    }
}
