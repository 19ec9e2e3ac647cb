use serde::{Deserialize, Serialize};

use crate::config::model::Action;
use crate::config::wire;

/// Index of the virtual system element present on every module.
pub const SYSTEM_ELEMENT_INDEX: u8 = 255;

/// Control kinds a module can carry. Closed enumeration; each variant
/// declares its supported events and factory defaults in the tables below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Button,
    Potmeter,
    Encoder,
    Fader,
    Lcd,
    System,
}

impl ElementType {
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Button => "button",
            ElementType::Potmeter => "potmeter",
            ElementType::Encoder => "encoder",
            ElementType::Fader => "fader",
            ElementType::Lcd => "lcd",
            ElementType::System => "system",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "button" => Some(ElementType::Button),
            "potmeter" => Some(ElementType::Potmeter),
            "encoder" => Some(ElementType::Encoder),
            "fader" => Some(ElementType::Fader),
            "lcd" => Some(ElementType::Lcd),
            "system" => Some(ElementType::System),
            _ => None,
        }
    }

    pub fn supported_events(&self) -> &'static [EventType] {
        match self {
            ElementType::Button => &[EventType::Init, EventType::Button, EventType::Timer],
            ElementType::Potmeter => &[EventType::Init, EventType::Potmeter, EventType::Timer],
            ElementType::Encoder => &[
                EventType::Init,
                EventType::Encoder,
                EventType::Button,
                EventType::Timer,
            ],
            ElementType::Fader => &[EventType::Init, EventType::Potmeter, EventType::Timer],
            ElementType::Lcd => &[EventType::Init, EventType::Draw, EventType::Timer],
            ElementType::System => &[
                EventType::Init,
                EventType::MapMode,
                EventType::MidiRx,
                EventType::Timer,
            ],
        }
    }
}

/// Event triggers, identified on the wire by their small integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Init,
    Potmeter,
    Encoder,
    Button,
    MapMode,
    MidiRx,
    Timer,
    Draw,
}

impl EventType {
    pub fn code(&self) -> u8 {
        match self {
            EventType::Init => 0,
            EventType::Potmeter => 1,
            EventType::Encoder => 2,
            EventType::Button => 3,
            EventType::MapMode => 4,
            EventType::MidiRx => 5,
            EventType::Timer => 6,
            EventType::Draw => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventType::Init),
            1 => Some(EventType::Potmeter),
            2 => Some(EventType::Encoder),
            3 => Some(EventType::Button),
            4 => Some(EventType::MapMode),
            5 => Some(EventType::MidiRx),
            6 => Some(EventType::Timer),
            7 => Some(EventType::Draw),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventType::Init => "init",
            EventType::Potmeter => "potmeter",
            EventType::Encoder => "encoder",
            EventType::Button => "button",
            EventType::MapMode => "mapmode",
            EventType::MidiRx => "midirx",
            EventType::Timer => "timer",
            EventType::Draw => "draw",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "init" => Some(EventType::Init),
            "potmeter" => Some(EventType::Potmeter),
            "encoder" => Some(EventType::Encoder),
            "button" => Some(EventType::Button),
            "mapmode" => Some(EventType::MapMode),
            "midirx" => Some(EventType::MidiRx),
            "timer" => Some(EventType::Timer),
            "draw" => Some(EventType::Draw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEntry {
    pub index: u8,
    #[serde(rename = "type")]
    pub element_type: ElementType,
}

/// One physical module in the chain, keyed by its `(dx, dy)` position.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    pub dx: i8,
    pub dy: i8,
    pub type_name: String,
    pub type_id: u8,
    pub firmware: FirmwareVersion,
    pub elements: Vec<ElementEntry>,
}

impl ModuleInfo {
    pub fn position(&self) -> (i8, i8) {
        (self.dx, self.dy)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn element_type(&self, index: u8) -> Option<ElementType> {
        self.elements
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.element_type)
    }
}

/// Exact HWCFG lookup, including revision ids that carry their own entry.
pub fn module_type_from_hwcfg(hwcfg: u8) -> Option<&'static str> {
    match hwcfg {
        0 => Some("PO16"),
        1 => Some("BU16"),
        2 => Some("PBF4"),
        3 => Some("EN16"),
        4 => Some("EF44"),
        5 => Some("TEK2"),
        0x20 => Some("EN16_ND"),
        _ => None,
    }
}

/// Base type table consulted with the revision bit masked off.
fn module_type_masked(hwcfg: u8) -> Option<&'static str> {
    module_type_from_hwcfg(hwcfg & 0x7F)
}

/// Resolve a heartbeat HWCFG to a type name: exact id first, then the
/// masked table, then `Unknown(raw)`.
pub fn module_type_name(hwcfg: u8) -> String {
    module_type_from_hwcfg(hwcfg)
        .or_else(|| module_type_masked(hwcfg))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown({})", hwcfg))
}

/// Positional element table for a module type, plus the virtual system
/// element. Unknown types get only the system element.
pub fn elements_for_type(type_name: &str) -> Vec<ElementEntry> {
    let positional: &[(usize, ElementType)] = match type_name {
        "PO16" => &[(16, ElementType::Potmeter)],
        "BU16" => &[(16, ElementType::Button)],
        "EN16" | "EN16_ND" => &[(16, ElementType::Encoder)],
        "PBF4" => &[
            (4, ElementType::Potmeter),
            (4, ElementType::Button),
            (4, ElementType::Fader),
        ],
        "EF44" => &[(4, ElementType::Encoder), (4, ElementType::Fader)],
        "TEK2" => &[
            (2, ElementType::Encoder),
            (8, ElementType::Button),
            (1, ElementType::Lcd),
        ],
        _ => &[],
    };

    let mut elements = Vec::new();
    let mut index = 0u8;
    for &(count, element_type) in positional {
        for _ in 0..count {
            elements.push(ElementEntry {
                index,
                element_type,
            });
            index += 1;
        }
    }
    elements.push(ElementEntry {
        index: SYSTEM_ELEMENT_INDEX,
        element_type: ElementType::System,
    });
    elements
}

/// Factory default binding for an (element-type, event-type) pair, in wire
/// form. Events without a default expand to an empty action list.
fn default_wire(element: ElementType, event: EventType) -> Option<&'static str> {
    match (element, event) {
        (ElementType::Button, EventType::Init) => {
            Some("--[[@l#locals]] local num, val = self:ind(), self:bva()")
        }
        (ElementType::Button, EventType::Button) => {
            Some("--[[@gms#midi]] gms(0, 144, 32 + self:ind(), self:bva())")
        }
        (ElementType::Potmeter, EventType::Init) | (ElementType::Fader, EventType::Init) => {
            Some("--[[@l#locals]] local num, val = self:ind(), self:pva()")
        }
        (ElementType::Potmeter, EventType::Potmeter) | (ElementType::Fader, EventType::Potmeter) => {
            Some("--[[@gms#midi]] gms(0, 176, 32 + self:ind(), self:pva())")
        }
        (ElementType::Encoder, EventType::Init) => {
            Some("--[[@l#locals]] local num, val = self:ind(), self:eva()")
        }
        (ElementType::Encoder, EventType::Encoder) => {
            Some("--[[@gms#midi]] gms(0, 176, 32 + self:ind(), self:eva())")
        }
        (ElementType::Encoder, EventType::Button) => {
            Some("--[[@gms#midi]] gms(0, 144, 32 + self:ind(), self:bva())")
        }
        _ => None,
    }
}

/// Parsed default action list for an (element-type, event-type) pair.
/// `None` when no default is defined or the stored default fails to parse.
pub fn default_actions(element: ElementType, event: EventType) -> Option<Vec<Action>> {
    default_wire(element, event).and_then(|wire_form| wire::parse_actions(wire_form).ok())
}
