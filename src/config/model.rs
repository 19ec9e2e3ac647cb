use std::collections::HashSet;

use crate::device::types::{EventType, ModuleInfo};
use crate::protocol::CONFIG_LENGTH;

use super::{wire, ConfigError, Result};

/// One script binding inside an event: a short tag, an optional display
/// name, and the script body.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub short: String,
    pub name: Option<String>,
    pub script: String,
}

impl Action {
    pub fn new(short: &str, name: Option<&str>, script: &str) -> Self {
        Self {
            short: short.to_string(),
            name: name.map(str::to_string),
            script: script.to_string(),
        }
    }

    /// Equality used for default collapse: `short` and `name` exact,
    /// scripts compared after whitespace normalization.
    pub fn structurally_eq(&self, other: &Action) -> bool {
        self.short == other.short
            && self.name == other.name
            && normalize_ws(&self.script) == normalize_ws(&other.script)
    }
}

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn actions_eq(a: &[Action], b: &[Action]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_eq(y))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventConfig {
    pub element: u8,
    pub event: EventType,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageConfig {
    pub number: u8,
    pub events: Vec<EventConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub module: ModuleInfo,
    pub pages: Vec<PageConfig>,
}

impl ModuleConfig {
    pub fn page(&self, number: u8) -> Option<&PageConfig> {
        self.pages.iter().find(|p| p.number == number)
    }

    /// Drop pages outside `keep`, preserving order. Used by the push path
    /// when a page filter is given.
    pub fn retain_pages(&mut self, keep: &[u8]) {
        self.pages.retain(|p| keep.contains(&p.number));
    }
}

/// Validate a configuration before any device operation starts.
///
/// All problems are aggregated into one `Validation` error; each diagnostic
/// is prefixed with `TYPE(dx,dy)/page-N/element-i/eventName`.
pub fn validate(config: &ModuleConfig) -> Result<()> {
    let module = &config.module;
    let mut diagnostics = Vec::new();
    let mut seen: HashSet<(u8, u8, u8)> = HashSet::new();

    for page in &config.pages {
        for event in &page.events {
            let prefix = format!(
                "{}({},{})/page-{}/element-{}/{}",
                module.type_name,
                module.dx,
                module.dy,
                page.number,
                event.element,
                event.event.name()
            );

            if page.number > 3 {
                diagnostics.push(format!("{}: page number out of range 0..3", prefix));
            }

            if !seen.insert((page.number, event.element, event.event.code())) {
                diagnostics.push(format!("{}: duplicate event configuration", prefix));
            }

            match module.element_type(event.element) {
                None => {
                    diagnostics.push(format!(
                        "{}: module has no element at index {}",
                        prefix, event.element
                    ));
                }
                Some(element_type) => {
                    if !element_type.supported_events().contains(&event.event) {
                        diagnostics.push(format!(
                            "{}: event not supported by {} elements",
                            prefix,
                            element_type.name()
                        ));
                    }
                }
            }

            let wrapped = wire::wrap_actionstring(&wire::serialize_actions(&event.actions));
            if wrapped.len() > CONFIG_LENGTH {
                diagnostics.push(format!(
                    "{}: action string is {} bytes, device limit is {}",
                    prefix,
                    wrapped.len(),
                    CONFIG_LENGTH
                ));
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::{ElementEntry, ElementType, FirmwareVersion};

    fn test_module() -> ModuleInfo {
        ModuleInfo {
            dx: 0,
            dy: 0,
            type_name: "BU16".to_string(),
            type_id: 1,
            firmware: FirmwareVersion::default(),
            elements: vec![
                ElementEntry {
                    index: 0,
                    element_type: ElementType::Button,
                },
                ElementEntry {
                    index: 1,
                    element_type: ElementType::Button,
                },
            ],
        }
    }

    fn event(element: u8, event: EventType, script: &str) -> EventConfig {
        EventConfig {
            element,
            event,
            actions: vec![Action::new("cb", None, script)],
        }
    }

    #[test]
    fn structural_equality_normalizes_whitespace() {
        let a = Action::new("gms", Some("midi"), "gms(0, 144,\n  32)");
        let b = Action::new("gms", Some("midi"), "gms(0, 144, 32)");
        assert!(a.structurally_eq(&b));
        let c = Action::new("gms", None, "gms(0, 144, 32)");
        assert!(!a.structurally_eq(&c));
    }

    #[test]
    fn validation_aggregates_all_diagnostics() {
        let config = ModuleConfig {
            module: test_module(),
            pages: vec![PageConfig {
                number: 0,
                events: vec![
                    event(0, EventType::Button, "ok()"),
                    event(0, EventType::Button, "dup()"),
                    event(7, EventType::Button, "no_such_element()"),
                    event(1, EventType::Potmeter, "unsupported()"),
                ],
            }],
        };
        match validate(&config) {
            Err(ConfigError::Validation(diagnostics)) => {
                assert_eq!(diagnostics.len(), 3);
                assert!(diagnostics[0].contains("BU16(0,0)/page-0/element-0/button"));
                assert!(diagnostics[0].contains("duplicate"));
                assert!(diagnostics[1].contains("no element at index 7"));
                assert!(diagnostics[2].contains("not supported"));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn validation_accepts_a_clean_config() {
        let config = ModuleConfig {
            module: test_module(),
            pages: vec![PageConfig {
                number: 0,
                events: vec![event(0, EventType::Init, "print('init')")],
            }],
        };
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn oversized_action_string_is_reported() {
        let long = "x".repeat(CONFIG_LENGTH);
        let config = ModuleConfig {
            module: test_module(),
            pages: vec![PageConfig {
                number: 0,
                events: vec![event(0, EventType::Button, &long)],
            }],
        };
        match validate(&config) {
            Err(ConfigError::Validation(diagnostics)) => {
                assert!(diagnostics[0].contains("device limit"));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }
}
