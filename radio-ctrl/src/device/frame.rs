//! On-wire representation of protocol frames.
//!
//! The layout is defined byte by byte here instead of relying on any in-memory
//! struct layout, so the encoding stays stable across compilers and targets.
//! All multi-byte integers are little-endian.

use crate::RadioAddress;

/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD_LEN: usize = 230;

/// Wire protocol version. Frames with a different version are dropped.
pub const PROTOCOL_VERSION: u8 = 2;

/// Channel selector meaning "the channel the radio is currently parked on".
pub const CHANNEL_CURRENT: u8 = 0x0;
/// Channel selector meaning "sweep every channel of the regulatory domain".
pub const CHANNEL_ALL: u8 = 0x0f;

/// Upper bound of the retransmission counter (5 bits on the wire).
pub const RETRANSMIT_MAX: u8 = 0x1f;
/// Upper bound of the forward time-to-live (5 bits on the wire).
pub const FORWARD_TTL_MAX: u8 = 0x1f;

/// Encoded size of a [FrameHeader].
pub const HEADER_LEN: usize = 7;

/// Encoded size of a [Packet] with an empty payload.
pub const PACKET_MIN_LEN: usize = 2 + HEADER_LEN + 12;

/// Logical frame kinds multiplexed over the single radio primitive.
///
/// Discriminants are wire values and must not be renumbered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Delivery acknowledgment for a frame that requested one.
    Ack = 0,
    /// Frame re-broadcast by a relay on behalf of another node.
    Forward = 1,
    /// Bind or unbind request.
    Bind = 4,
    /// Attribute/value control message.
    ControlData = 5,
    /// Status of a key-establishment exchange.
    SecurityStatus = 11,
    /// Key-establishment handshake traffic.
    SecurityHandshake = 12,
}

impl FrameKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FrameKind::Ack),
            1 => Some(FrameKind::Forward),
            4 => Some(FrameKind::Bind),
            5 => Some(FrameKind::ControlData),
            11 => Some(FrameKind::SecurityStatus),
            12 => Some(FrameKind::SecurityHandshake),
            _ => None,
        }
    }

    /// Kinds that must stay processable before a session key exists and are
    /// therefore never encrypted.
    pub fn is_plaintext_only(&self) -> bool {
        matches!(
            self,
            FrameKind::Ack
                | FrameKind::Forward
                | FrameKind::SecurityStatus
                | FrameKind::SecurityHandshake
        )
    }
}

/// Frame header prepended to every payload.
///
/// Byte table of the encoded form:
///
/// | offset | contents                                                          |
/// |--------|-------------------------------------------------------------------|
/// | 0..2   | `magic`, dedup identifier                                         |
/// | 2      | bits 0-3 `channel`, bit 4 adjacent-channel filter, bit 5 weak-signal filter |
/// | 3      | bit 0 `broadcast`, bit 1 `group`, bit 2 `ack`, bit 3 `security`   |
/// | 4      | bits 0-4 `retransmit_count`                                       |
/// | 5      | bits 0-4 `forward_ttl`                                            |
/// | 6      | `forward_rssi` (two's complement)                                 |
///
/// Reserved bits encode as zero and are ignored on decode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// Per-packet identifier; packets seen twice with the same identifier are
    /// filtered. Zero is replaced by a random value at send time.
    pub magic: u16,
    /// Channel the packet is intended for, [CHANNEL_CURRENT] or [CHANNEL_ALL].
    pub channel: u8,
    /// Drop the frame when it was picked up on an adjacent channel.
    pub filter_adjacent_channel: bool,
    /// Drop the frame when it arrived below `forward_rssi`.
    pub filter_weak_signal: bool,
    /// Broadcast or unicast transmission.
    pub broadcast: bool,
    /// Destination address is a group address.
    pub group: bool,
    /// The receiver is asked to return an acknowledgment.
    pub ack: bool,
    /// The payload is encrypted under the session key.
    pub security: bool,
    /// Retransmission budget per channel, capped at [RETRANSMIT_MAX].
    pub retransmit_count: u8,
    /// Hop budget for the lower multi-hop relay layer, capped at
    /// [FORWARD_TTL_MAX]. The one-hop control relay leaves it untouched.
    pub forward_ttl: u8,
    /// Minimum signal strength below which relays refuse to forward.
    pub forward_rssi: i8,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            magic: 0,
            channel: CHANNEL_CURRENT,
            filter_adjacent_channel: false,
            filter_weak_signal: false,
            broadcast: true,
            group: false,
            ack: false,
            security: false,
            retransmit_count: 10,
            forward_ttl: 0,
            forward_rssi: 0,
        }
    }
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.magic.to_le_bytes());
        bytes[2] = (self.channel & 0x0f)
            | u8::from(self.filter_adjacent_channel) << 4
            | u8::from(self.filter_weak_signal) << 5;
        bytes[3] = u8::from(self.broadcast)
            | u8::from(self.group) << 1
            | u8::from(self.ack) << 2
            | u8::from(self.security) << 3;
        bytes[4] = self.retransmit_count.min(RETRANSMIT_MAX);
        bytes[5] = self.forward_ttl.min(FORWARD_TTL_MAX);
        bytes[6] = self.forward_rssi as u8;
        bytes
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        let mut magic_raw = [0u8; 2];
        magic_raw.copy_from_slice(&bytes[0..2]);
        let header = FrameHeader {
            magic: u16::from_le_bytes(magic_raw),
            channel: bytes[2] & 0x0f,
            filter_adjacent_channel: bytes[2] & (1 << 4) != 0,
            filter_weak_signal: bytes[2] & (1 << 5) != 0,
            broadcast: bytes[3] & 1 != 0,
            group: bytes[3] & (1 << 1) != 0,
            ack: bytes[3] & (1 << 2) != 0,
            security: bytes[3] & (1 << 3) != 0,
            retransmit_count: bytes[4] & RETRANSMIT_MAX,
            forward_ttl: bytes[5] & FORWARD_TTL_MAX,
            forward_rssi: bytes[6] as i8,
        };
        Ok((header, HEADER_LEN))
    }
}

/// A complete frame: kind, header, addressing and payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub kind: FrameKind,
    pub header: FrameHeader,
    pub dest: RadioAddress,
    pub src: RadioAddress,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
            });
        }
        let mut bytes = Vec::with_capacity(PACKET_MIN_LEN + self.payload.len());
        bytes.push((self.kind as u8) | PROTOCOL_VERSION << 4);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.dest);
        bytes.extend_from_slice(&self.src);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < PACKET_MIN_LEN {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        let version = (bytes[0] >> 4) & 0x03;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::BadVersion { version });
        }
        let kind = FrameKind::from_wire(bytes[0] & 0x0f)
            .ok_or(FrameError::UnknownKind { kind: bytes[0] & 0x0f })?;
        let payload_len = bytes[1] as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { len: payload_len });
        }
        let (header, read) = FrameHeader::try_from_bytes(&bytes[2..])?;
        let mut cursor = 2 + read;
        let mut dest = [0u8; 6];
        dest.copy_from_slice(&bytes[cursor..cursor + 6]);
        cursor += 6;
        let mut src = [0u8; 6];
        src.copy_from_slice(&bytes[cursor..cursor + 6]);
        cursor += 6;
        if bytes.len() < cursor + payload_len {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        let payload = bytes[cursor..cursor + payload_len].to_vec();
        cursor += payload_len;
        Ok((
            Packet {
                kind,
                header,
                dest,
                src,
                payload,
            },
            cursor,
        ))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame is truncated ({len}B)")]
    Truncated { len: usize },

    #[error("unknown frame kind ({kind})")]
    UnknownKind { kind: u8 },

    #[error("unsupported protocol version ({version})")]
    BadVersion { version: u8 },

    #[error("payload is too large to be transmitted (is: {len}B, max: {MAX_PAYLOAD_LEN}B)")]
    PayloadTooLarge { len: usize },
}
