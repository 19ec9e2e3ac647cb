//! Per-page script file codec.
//!
//! A page file opens with `-- grid:` front-matter, then one block per
//! event, each introduced by a `-- grid:event` header and holding the
//! event's action list as `--[[@short#name]]` headers with script bodies.

use crate::config::minify;
use crate::device::types::ModuleInfo;

use super::model::{Action, EventConfig};
use super::{ConfigError, Result};

const FRONT_MATTER_PREFIX: &str = "-- grid:";
const EVENT_PREFIX: &str = "-- grid:event";
const ACTION_OPEN: &str = "--[[@";
const LEGACY_ACTION_OPEN: &str = "--[[";
const HEADER_CLOSE: &str = "]]";
const SEPARATOR: &str =
    "-- ============================================================";
const SENTINEL_COMMENT: &str = "-- All events use default configuration";

/// Body lines that are formatting artifacts, never script content.
const IGNORED_PREFIXES: [&str; 6] = [
    "-- Grid Configuration",
    "-- Module:",
    "-- Element:",
    "-- Event:",
    "-- Page:",
    "-- action:",
];

#[derive(Debug, Default)]
pub struct ParsedPage {
    pub page: Option<u8>,
    pub module: Option<String>,
    pub position: Option<(i8, i8)>,
    pub events: Vec<ParsedEventBlock>,
}

#[derive(Debug)]
pub struct ParsedEventBlock {
    pub element: u8,
    pub event: String,
    pub element_type: Option<String>,
    pub actions: Vec<Action>,
}

pub fn parse_page_file(file: &str, content: &str) -> Result<ParsedPage> {
    let mut parsed = ParsedPage::default();
    let mut block: Option<BlockBuilder> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();

        if trimmed.starts_with(EVENT_PREFIX) {
            if let Some(done) = block.take() {
                push_block(file, &mut parsed, done)?;
            }
            block = Some(parse_event_header(file, trimmed)?);
            continue;
        }

        match &mut block {
            None => parse_front_matter_line(file, &mut parsed, trimmed)?,
            Some(builder) => {
                if is_ignored_line(trimmed) {
                    continue;
                }
                if let Some((action, inline)) = parse_action_header(trimmed) {
                    builder.finish_action();
                    builder.current = Some(action);
                    if !inline.is_empty() {
                        builder.body.push(inline.to_string());
                    }
                } else if builder.current.is_some() {
                    builder.body.push(line.to_string());
                } else if !trimmed.is_empty() {
                    log::warn!("{}: stray line outside an action, ignored: {:?}", file, trimmed);
                }
            }
        }
    }

    if let Some(done) = block.take() {
        push_block(file, &mut parsed, done)?;
    }

    Ok(parsed)
}

fn parse_front_matter_line(file: &str, parsed: &mut ParsedPage, line: &str) -> Result<()> {
    if line.is_empty() || !line.starts_with(FRONT_MATTER_PREFIX) {
        return Ok(());
    }
    let rest = line[FRONT_MATTER_PREFIX.len()..].trim();
    let (key, value) = rest.split_once('=').ok_or_else(|| {
        ConfigError::MalformedFrontMatter {
            file: file.to_string(),
            line: line.to_string(),
        }
    })?;
    let (key, value) = (key.trim(), unquote(value.trim()));
    if key.is_empty() || value.is_empty() {
        return Err(ConfigError::MalformedFrontMatter {
            file: file.to_string(),
            line: line.to_string(),
        });
    }

    match key {
        "page" => {
            parsed.page = Some(value.parse().map_err(|_| ConfigError::MalformedFrontMatter {
                file: file.to_string(),
                line: line.to_string(),
            })?)
        }
        "module" => parsed.module = Some(value.to_string()),
        "position" => {
            let pair = value
                .split_once(',')
                .and_then(|(dx, dy)| {
                    Some((dx.trim().parse().ok()?, dy.trim().parse().ok()?))
                })
                .ok_or_else(|| ConfigError::MalformedFrontMatter {
                    file: file.to_string(),
                    line: line.to_string(),
                })?;
            parsed.position = Some(pair);
        }
        _ => log::debug!("{}: unrecognized front-matter key {:?}", file, key),
    }
    Ok(())
}

struct BlockBuilder {
    element: u8,
    event: String,
    element_type: Option<String>,
    actions: Vec<Action>,
    current: Option<Action>,
    body: Vec<String>,
}

impl BlockBuilder {
    fn finish_action(&mut self) {
        if let Some(mut action) = self.current.take() {
            action.script = self.body.join("\n").trim().to_string();
            self.body.clear();
            self.actions.push(action);
        }
    }
}

fn push_block(file: &str, parsed: &mut ParsedPage, mut builder: BlockBuilder) -> Result<()> {
    builder.finish_action();
    if parsed
        .events
        .iter()
        .any(|e| e.element == builder.element && e.event == builder.event)
    {
        return Err(ConfigError::DuplicateEvent {
            file: file.to_string(),
            element: builder.element,
            event: builder.event,
        });
    }
    parsed.events.push(ParsedEventBlock {
        element: builder.element,
        event: builder.event,
        element_type: builder.element_type,
        actions: builder.actions,
    });
    Ok(())
}

fn parse_event_header(file: &str, line: &str) -> Result<BlockBuilder> {
    let malformed = || ConfigError::MalformedEventHeader {
        file: file.to_string(),
        line: line.to_string(),
    };

    let mut element = None;
    let mut event = None;
    let mut element_type = None;

    for token in line[EVENT_PREFIX.len()..].split_whitespace() {
        let (key, value) = token.split_once('=').ok_or_else(malformed)?;
        let value = unquote(value);
        match key {
            "element" => element = Some(value.parse().map_err(|_| malformed())?),
            "event" => event = Some(value.to_string()),
            "elementType" => element_type = Some(value.to_string()),
            _ => log::debug!("{}: unrecognized event header key {:?}", file, key),
        }
    }

    Ok(BlockBuilder {
        element: element.ok_or_else(malformed)?,
        event: event.ok_or_else(malformed)?,
        element_type,
        actions: Vec::new(),
        current: None,
        body: Vec::new(),
    })
}

/// Recognize `--[[@short#name]]` (with optional inline code after the
/// header) and the legacy `--[[ @action short "name" ]]` shape.
fn parse_action_header(line: &str) -> Option<(Action, &str)> {
    if let Some(after) = line.strip_prefix(ACTION_OPEN) {
        let close = after.find(HEADER_CLOSE)?;
        let header = &after[..close];
        let (short, name) = match header.split_once('#') {
            Some((short, name)) => (short, Some(name)),
            None => (header, None),
        };
        if short.is_empty() {
            return None;
        }
        let inline = after[close + HEADER_CLOSE.len()..].trim();
        return Some((Action::new(short, name, ""), inline));
    }

    let inner = line
        .strip_prefix(LEGACY_ACTION_OPEN)?
        .trim_start()
        .strip_prefix("@action")?;
    let inner = inner.strip_suffix(HEADER_CLOSE)?.trim();
    let (short, rest) = match inner.split_once(char::is_whitespace) {
        Some((short, rest)) => (short, rest.trim()),
        None => (inner, ""),
    };
    if short.is_empty() {
        return None;
    }
    let name = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .filter(|n| !n.is_empty());
    Some((Action::new(short, name, ""), ""))
}

fn is_ignored_line(line: &str) -> bool {
    if line.starts_with(FRONT_MATTER_PREFIX) {
        return true;
    }
    if IGNORED_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return true;
    }
    if let Some(rest) = line.strip_prefix("--") {
        let rest = rest.trim();
        if rest.len() >= 3 && (rest.chars().all(|c| c == '=') || rest.chars().all(|c| c == '-')) {
            return true;
        }
    }
    false
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Render a page file carrying the given (non-default) events.
pub fn render_page(module: &ModuleInfo, page_number: u8, events: &[&EventConfig]) -> String {
    let mut out = front_matter(module, page_number);

    for (i, event) in events.iter().enumerate() {
        out.push('\n');
        if i > 0 {
            out.push_str(SEPARATOR);
            out.push('\n');
        }
        out.push_str(&format!(
            "-- grid:event element={} event={}",
            event.element,
            event.event.name()
        ));
        if let Some(element_type) = module.element_type(event.element) {
            out.push_str(&format!(" elementType={}", element_type.name()));
        }
        out.push('\n');

        for action in &event.actions {
            out.push_str(ACTION_OPEN);
            out.push_str(&action.short);
            if let Some(name) = &action.name {
                out.push('#');
                out.push_str(name);
            }
            out.push_str(HEADER_CLOSE);
            out.push('\n');
            if !action.script.is_empty() {
                let body = if action.script.contains('\n') {
                    action.script.clone()
                } else {
                    minify::humanize(&action.script)
                };
                out.push_str(&body);
                out.push('\n');
            }
        }
    }

    out
}

/// Render the sentinel file for a module whose configuration is entirely
/// factory-default, keeping the directory round-trippable.
pub fn render_sentinel(module: &ModuleInfo) -> String {
    let mut out = front_matter(module, 0);
    out.push('\n');
    out.push_str(SENTINEL_COMMENT);
    out.push('\n');
    out
}

fn front_matter(module: &ModuleInfo, page_number: u8) -> String {
    format!(
        "-- grid: page={}\n-- grid: module={}\n-- grid: position={},{}\n",
        page_number, module.type_name, module.dx, module.dy
    )
}
