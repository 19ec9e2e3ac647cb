//! Reference packet codec.
//!
//! Frames are ASCII: a broadcast-header segment followed by one or more
//! class segments, separated by `|`, sealed with EOT and a two-character
//! hex XOR checksum. The Framer owns the trailing newline; this codec owns
//! everything before it, checksum included.
//!
//! ```text
//! BRC DX=0 DY=0|CONFIG FETCH PAGENUMBER=0 ELEMENTNUMBER=1 EVENTTYPE=3<EOT>c0c1
//! ```

use std::collections::HashMap;

use super::{
    DecodedMessage, Instruction, MessageDescriptor, PacketCodec, ProtocolError, Result, Value,
};

const EOT: u8 = 0x04;
const SEGMENT_SEP: char = '|';
const BRC_TAG: &str = "BRC";

pub struct TextCodec;

impl TextCodec {
    /// Append the EOT marker and checksum tail to a frame body.
    ///
    /// The checksum is the XOR of every byte up to and including EOT,
    /// rendered as two uppercase hex characters.
    pub fn seal_frame(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 3);
        out.extend_from_slice(body);
        out.push(EOT);
        let checksum = out.iter().fold(0u8, |acc, b| acc ^ b);
        out.extend_from_slice(format!("{:02X}", checksum).as_bytes());
        out
    }

    /// Build a sealed device-to-host frame. The binary never sends these;
    /// the loopback device in tests does.
    pub fn encode_reply(
        sx: i8,
        sy: i8,
        class: &str,
        instruction: Instruction,
        parameters: &[(String, Value)],
    ) -> Vec<u8> {
        let mut body = format!("{} SX={} SY={}", BRC_TAG, sx, sy);
        body.push(SEGMENT_SEP);
        body.push_str(&format_segment(class, instruction, parameters));
        Self::seal_frame(body.as_bytes())
    }
}

impl PacketCodec for TextCodec {
    fn encode_packet(&self, descriptor: &MessageDescriptor) -> Result<Vec<u8>> {
        descriptor.validate()?;
        let mut body = format!("{} DX={} DY={}", BRC_TAG, descriptor.dx, descriptor.dy);
        body.push(SEGMENT_SEP);
        body.push_str(&format_segment(
            &descriptor.class,
            descriptor.instruction,
            &descriptor.parameters,
        ));
        Ok(Self::seal_frame(body.as_bytes()))
    }

    fn decode_packet_frame(&self, payload: &[u8]) -> Result<Vec<DecodedMessage>> {
        if payload.len() < 4 {
            return Err(ProtocolError::MalformedFrame("frame too short".into()));
        }
        let eot_at = payload.len() - 3;
        if payload[eot_at] != EOT {
            return Err(ProtocolError::MalformedFrame("missing EOT marker".into()));
        }

        let expected = std::str::from_utf8(&payload[eot_at + 1..])
            .ok()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| ProtocolError::MalformedFrame("invalid checksum tail".into()))?;
        let actual = payload[..=eot_at].iter().fold(0u8, |acc, b| acc ^ b);
        if actual != expected {
            return Err(ProtocolError::MalformedFrame(format!(
                "checksum mismatch: expected {:02X}, computed {:02X}",
                expected, actual
            )));
        }

        let body = std::str::from_utf8(&payload[..eot_at])
            .map_err(|_| ProtocolError::MalformedFrame("frame body is not UTF-8".into()))?;

        let mut segments = split_segments(body).into_iter();
        let header = segments
            .next()
            .ok_or_else(|| ProtocolError::MalformedFrame("empty frame body".into()))?;
        let brc = parse_header(&header)?;

        let mut messages = Vec::new();
        for segment in segments {
            messages.push(parse_segment(&segment, &brc)?);
        }
        if messages.is_empty() {
            return Err(ProtocolError::MalformedFrame("frame carries no class".into()));
        }
        Ok(messages)
    }
}

fn format_segment(class: &str, instruction: Instruction, parameters: &[(String, Value)]) -> String {
    let mut out = format!("{} {}", class, instruction.as_str());
    for (key, value) in parameters {
        out.push(' ');
        out.push_str(key);
        out.push('=');
        match value {
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }
    out
}

fn parse_header(segment: &str) -> Result<HashMap<String, Value>> {
    let mut tokens = split_tokens(segment)?;
    if tokens.is_empty() || tokens.remove(0) != BRC_TAG {
        return Err(ProtocolError::MalformedFrame(
            "frame does not start with a BRC header".into(),
        ));
    }
    parse_params(tokens)
}

fn parse_segment(segment: &str, brc: &HashMap<String, Value>) -> Result<DecodedMessage> {
    let mut tokens = split_tokens(segment)?;
    if tokens.len() < 2 {
        return Err(ProtocolError::MalformedFrame(format!(
            "incomplete class segment: {:?}",
            segment
        )));
    }
    let class = tokens.remove(0);
    let instruction = tokens.remove(0);
    let instruction = Instruction::parse(&instruction).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!("unknown instruction: {}", instruction))
    })?;

    Ok(DecodedMessage {
        brc: brc.clone(),
        class,
        instruction,
        parameters: parse_params(tokens)?,
    })
}

fn parse_params(tokens: Vec<String>) -> Result<HashMap<String, Value>> {
    let mut params = HashMap::new();
    for token in tokens {
        let (key, raw) = token.split_once('=').ok_or_else(|| {
            ProtocolError::MalformedFrame(format!("parameter without '=': {}", token))
        })?;
        if key.is_empty() {
            return Err(ProtocolError::MalformedFrame(format!(
                "parameter with empty key: {}",
                token
            )));
        }
        params.insert(key.to_string(), parse_value(raw));
    }
    Ok(params)
}

fn parse_value(raw: &str) -> Value {
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut escaped = false;
        for c in inner.chars() {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else {
                out.push(c);
            }
        }
        return Value::Str(out);
    }
    match raw.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::Str(raw.to_string()),
    }
}

/// Split a frame body on `|`, keeping quoted spans intact so separator
/// characters inside string values survive.
fn split_segments(body: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in body.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            SEGMENT_SEP if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Split a segment on spaces, keeping quoted spans (with `\` escapes) intact.
fn split_tokens(segment: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in segment.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(ProtocolError::MalformedFrame(format!(
            "unterminated quote in segment: {:?}",
            segment
        )));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let desc = MessageDescriptor::new(1, -2, "CONFIG", Instruction::Fetch)
            .param("PAGENUMBER", 0u8)
            .param("ACTIONSTRING", "<?lua gms(0, 144) ?>");
        let frame = TextCodec.encode_packet(&desc).unwrap();
        // host frames decode too: DX/DY land in the header map
        let messages = TextCodec.decode_packet_frame(&frame).unwrap();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.class, "CONFIG");
        assert_eq!(msg.instruction, Instruction::Fetch);
        assert_eq!(msg.brc_int("DX"), Some(1));
        assert_eq!(msg.brc_int("DY"), Some(-2));
        assert_eq!(msg.param_int("PAGENUMBER"), Some(0));
        assert_eq!(
            msg.param("ACTIONSTRING").and_then(Value::as_str),
            Some("<?lua gms(0, 144) ?>")
        );
    }

    #[test]
    fn reply_frames_carry_source_address() {
        let frame = TextCodec::encode_reply(
            0,
            1,
            "HEARTBEAT",
            Instruction::Report,
            &[("HWCFG".to_string(), Value::Int(1))],
        );
        let messages = TextCodec.decode_packet_frame(&frame).unwrap();
        assert_eq!(messages[0].brc_int("SX"), Some(0));
        assert_eq!(messages[0].brc_int("SY"), Some(1));
        assert_eq!(messages[0].param_int("HWCFG"), Some(1));
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut frame = TextCodec::encode_reply(0, 0, "HEARTBEAT", Instruction::Report, &[]);
        let last = frame.len() - 1;
        frame[last] = if frame[last] == b'0' { b'1' } else { b'0' };
        assert!(TextCodec.decode_packet_frame(&frame).is_err());
    }

    #[test]
    fn quoted_values_keep_spaces_and_escapes() {
        let frame = TextCodec::encode_reply(
            0,
            0,
            "DEBUGTEXT",
            Instruction::Report,
            &[(
                "TEXT".to_string(),
                Value::Str(r#"page change is "disabled" \ here"#.to_string()),
            )],
        );
        let messages = TextCodec.decode_packet_frame(&frame).unwrap();
        assert_eq!(
            messages[0].param("TEXT").and_then(Value::as_str),
            Some(r#"page change is "disabled" \ here"#)
        );
    }

    #[test]
    fn segment_separator_inside_string_value_survives() {
        let frame = TextCodec::encode_reply(
            0,
            0,
            "CONFIG",
            Instruction::Report,
            &[("ACTIONSTRING".to_string(), Value::Str("a | b".to_string()))],
        );
        let messages = TextCodec.decode_packet_frame(&frame).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].param("ACTIONSTRING").and_then(Value::as_str),
            Some("a | b")
        );
    }

    #[test]
    fn missing_eot_is_malformed() {
        assert!(TextCodec.decode_packet_frame(b"BRC SX=0 SY=0|X REPORT").is_err());
    }
}
