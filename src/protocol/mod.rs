pub mod codec;

pub use codec::TextCodec;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Device-side capacity of a CONFIG action string, in UTF-8 bytes.
pub const CONFIG_LENGTH: usize = 400;

/// Protocol version advertised in CONFIG FETCH/EXECUTE requests.
pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 2, 0);

/// Address reaching every module on the chain.
pub const BROADCAST: (i8, i8) = (-127, -127);

/// Valid range for module coordinates.
pub const POSITION_MIN: i8 = -127;
pub const POSITION_MAX: i8 = 127;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol codec not initialized")]
    NotInitialized,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A class parameter value. The device emits numbers and strings
/// interchangeably, so equality is loose across the numeric/string boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    /// Numeric view: `Int` directly, or a `Str` that parses as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    /// Value equality accepting numeric ≡ numeric-string, symmetrically.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => match (self.as_int(), other.as_int()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i8> for Value {
    fn from(n: i8) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Execute,
    Fetch,
    Report,
    Acknowledge,
}

impl Instruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::Execute => "EXECUTE",
            Instruction::Fetch => "FETCH",
            Instruction::Report => "REPORT",
            Instruction::Acknowledge => "ACKNOWLEDGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXECUTE" => Some(Instruction::Execute),
            "FETCH" => Some(Instruction::Fetch),
            "REPORT" => Some(Instruction::Report),
            "ACKNOWLEDGE" => Some(Instruction::Acknowledge),
            _ => None,
        }
    }
}

/// An outbound request at the Device's altitude: broadcast-header address,
/// class, instruction and ordered class parameters. Consumed by
/// [`PacketCodec::encode_packet`].
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    pub dx: i8,
    pub dy: i8,
    pub class: String,
    pub instruction: Instruction,
    pub parameters: Vec<(String, Value)>,
}

impl MessageDescriptor {
    pub fn new(dx: i8, dy: i8, class: &str, instruction: Instruction) -> Self {
        Self {
            dx,
            dy,
            class: class.to_string(),
            instruction,
            parameters: Vec::new(),
        }
    }

    pub fn broadcast(class: &str, instruction: Instruction) -> Self {
        Self::new(BROADCAST.0, BROADCAST.1, class, instruction)
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.push((key.to_string(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dx < POSITION_MIN || self.dy < POSITION_MIN {
            return Err(ProtocolError::InvalidParameter(format!(
                "position ({},{}) out of range",
                self.dx, self.dy
            )));
        }
        if self.class.is_empty() {
            return Err(ProtocolError::InvalidParameter("empty class name".into()));
        }
        for (key, _) in &self.parameters {
            if key.is_empty() {
                return Err(ProtocolError::InvalidParameter("empty parameter key".into()));
            }
        }
        Ok(())
    }
}

/// One decoded class from an inbound frame, carrying the source address in
/// its broadcast-header parameters (`SX`, `SY`).
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub brc: HashMap<String, Value>,
    pub class: String,
    pub instruction: Instruction,
    pub parameters: HashMap<String, Value>,
}

impl DecodedMessage {
    pub fn brc_int(&self, key: &str) -> Option<i64> {
        self.brc.get(key).and_then(Value::as_int)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn param_int(&self, key: &str) -> Option<i64> {
        self.parameters.get(key).and_then(Value::as_int)
    }
}

/// Match conditions for inbound messages; unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub sx: Option<i64>,
    pub sy: Option<i64>,
    pub class: Option<String>,
    pub instruction: Option<Instruction>,
    pub parameters: Vec<(String, Value)>,
}

impl Filter {
    pub fn class(name: &str) -> Self {
        Self {
            class: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instruction = Some(instruction);
        self
    }

    pub fn source(mut self, sx: i8, sy: i8) -> Self {
        self.sx = Some(sx as i64);
        self.sy = Some(sy as i64);
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.push((key.to_string(), value.into()));
        self
    }

    pub fn matches(&self, msg: &DecodedMessage) -> bool {
        if let Some(class) = &self.class {
            if msg.class != *class {
                return false;
            }
        }
        if let Some(instruction) = self.instruction {
            if msg.instruction != instruction {
                return false;
            }
        }
        if let Some(sx) = self.sx {
            if msg.brc_int("SX") != Some(sx) {
                return false;
            }
        }
        if let Some(sy) = self.sy {
            if msg.brc_int("SY") != Some(sy) {
                return false;
            }
        }
        for (key, expected) in &self.parameters {
            match msg.parameters.get(key) {
                Some(actual) if expected.loose_eq(actual) => {}
                _ => return false,
            }
        }
        true
    }
}

/// The lower-level packet byte layout is a collaborator behind this trait;
/// the crate ships [`TextCodec`] as the reference implementation.
pub trait PacketCodec: Send + Sync {
    fn encode_packet(&self, descriptor: &MessageDescriptor) -> Result<Vec<u8>>;
    fn decode_packet_frame(&self, payload: &[u8]) -> Result<Vec<DecodedMessage>>;
}

static CODEC: RwLock<Option<Arc<dyn PacketCodec>>> = RwLock::new(None);

/// Install the process-wide packet codec. Called once at startup; tests may
/// re-install freely.
pub fn init_protocol(codec: Arc<dyn PacketCodec>) {
    *CODEC.write().expect("codec lock poisoned") = Some(codec);
}

/// Drop the process-wide codec; subsequent [`codec`] calls fail.
pub fn teardown_protocol() {
    *CODEC.write().expect("codec lock poisoned") = None;
}

/// Typed accessor for the installed codec.
pub fn codec() -> Result<Arc<dyn PacketCodec>> {
    CODEC
        .read()
        .expect("codec lock poisoned")
        .clone()
        .ok_or(ProtocolError::NotInitialized)
}
