//! Control message wire format.
//!
//! A fixed 8-byte header carries the two attribute codes and a 32-bit value
//! word; string values replace the word with a marker (24-bit flag of zero
//! plus a length byte) and follow the header as a NUL-terminated run. The
//! encoding is compact but lossy about scalar types: the wire cannot tell a
//! bool from an integer from a float, and a scalar whose low 24 bits are all
//! zero is indistinguishable from a string marker. Receivers interpret the
//! word according to the attribute they are asked to change.

use super::Attribute;

/// Encoded size of a message without the trailing string.
pub const CONTROL_FIXED_LEN: usize = 8;

/// Value carried by a control message.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
}

impl ControlValue {
    /// The 32-bit image of a scalar value.
    fn word(&self) -> Option<u32> {
        match self {
            ControlValue::Bool(v) => Some(u32::from(*v)),
            ControlValue::Int(v) => Some(*v as u32),
            ControlValue::Float(v) => Some(v.to_bits()),
            ControlValue::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ControlValue::Str(_) => false,
            _ => self.word() != Some(0),
        }
    }

    pub fn as_i32(&self) -> i32 {
        self.word().unwrap_or(0) as i32
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.word().unwrap_or(0))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ControlValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// An attribute/value command from an initiator to its bound responders.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlMessage {
    /// Which initiator key or sensor produced the command.
    pub initiator_attribute: Attribute,
    /// Which responder property the command targets.
    pub responder_attribute: Attribute,
    pub value: ControlValue,
}

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("control message is truncated ({len}B)")]
    Truncated { len: usize },

    #[error("string value does not fit the length byte ({len}B)")]
    StringTooLong { len: usize },
}

impl ControlMessage {
    pub fn new(
        initiator_attribute: Attribute,
        responder_attribute: Attribute,
        value: ControlValue,
    ) -> Self {
        ControlMessage {
            initiator_attribute,
            responder_attribute,
            value,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::with_capacity(CONTROL_FIXED_LEN);
        bytes.extend_from_slice(&self.initiator_attribute.to_le_bytes());
        bytes.extend_from_slice(&self.responder_attribute.to_le_bytes());
        match &self.value {
            ControlValue::Str(s) => {
                // Size counts the NUL terminator.
                let size = s.len() + 1;
                if size > u8::MAX as usize {
                    return Err(MessageError::StringTooLong { len: s.len() });
                }
                bytes.extend_from_slice(&[0, 0, 0, size as u8]);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
            }
            scalar => {
                let word = scalar.word().unwrap_or(0);
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        Ok(bytes)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, usize), MessageError> {
        if bytes.len() < CONTROL_FIXED_LEN {
            return Err(MessageError::Truncated { len: bytes.len() });
        }
        let initiator_attribute = u16::from_le_bytes([bytes[0], bytes[1]]);
        let responder_attribute = u16::from_le_bytes([bytes[2], bytes[3]]);
        let word = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let string_flag = word & 0x00ff_ffff;
        let string_size = (word >> 24) as usize;

        if string_flag == 0 && string_size != 0 {
            if bytes.len() < CONTROL_FIXED_LEN + string_size {
                return Err(MessageError::Truncated { len: bytes.len() });
            }
            let raw = &bytes[CONTROL_FIXED_LEN..CONTROL_FIXED_LEN + string_size];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            let value = ControlValue::Str(String::from_utf8_lossy(&raw[..end]).into_owned());
            return Ok((
                ControlMessage {
                    initiator_attribute,
                    responder_attribute,
                    value,
                },
                CONTROL_FIXED_LEN + string_size,
            ));
        }

        Ok((
            ControlMessage {
                initiator_attribute,
                responder_attribute,
                value: ControlValue::Int(word as i32),
            },
            CONTROL_FIXED_LEN,
        ))
    }
}
