//! # FrameLock Protocol
//!
//! Wire protocol definitions for the FrameLock LAN sync toolkit.
//!
//! Every datagram starts with a fixed header; the payload layout depends on
//! the message type.
//!
//! ## Wire Format
//!
//! ```text
//! ┌─────────┬────────┬────────┬─────────┬────────────┬─────────┬─────────┐
//! │ Magic   │ Type   │ Size   │ Seq     │ ProjectId  │ Version │ Flags   │
//! │ 4 bytes │ 1 byte │ 2 bytes│ 2 bytes │ 16 bytes   │ 1 byte  │ 1 byte  │
//! │ "MSYN"  │ enum   │ total  │ mod 2^16│ UUID       │ 1       │ bitmask │
//! └─────────┴────────┴────────┴─────────┴────────────┴─────────┴─────────┘
//! ```
//!
//! `Size` is the total datagram length including the header. All integers
//! are little-endian; this is the documented on-wire choice and every peer
//! on the LAN must agree.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod payload;
pub mod settings;

pub use payload::{
    decode_frame_number, decode_utf16_payload, encode_frame_number, encode_utf16_payload,
    parse_host_port, MasterAnnouncePayload, MasterElectionPayload, MasterResignPayload,
    MasterVotePayload, PingKind, PingPayload, PtpKind, PtpMessage, RoleChangePayload,
};
pub use settings::GlobalSettings;

/// Protocol magic: "MSYN" interpreted as a little-endian u32.
pub const MAGIC: u32 = 0x4D53_594E;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 27; // 4 + 1 + 2 + 2 + 16 + 1 + 1

/// Maximum payload size. Everything this protocol sends fits in 2 KiB.
pub const MAX_PAYLOAD_SIZE: usize = 2048;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic: expected {MAGIC:#010x}, got {got:#010x}")]
    InvalidMagic { got: u32 },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("truncated header: need {need} bytes, have {have}")]
    TruncatedHeader { need: usize, have: usize },

    #[error("size mismatch: header declares {declared} bytes, received {received}")]
    SizeMismatch { declared: usize, received: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("truncated payload: need {need} bytes, have {have}")]
    TruncatedPayload { need: usize, have: usize },

    #[error("payload is not valid UTF-16")]
    InvalidUtf16,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Server discovery broadcast
    Discovery = 0,
    /// Unicast reply to a discovery broadcast
    DiscoveryResponse = 1,
    /// PTP time synchronization exchange
    TimeSync = 2,
    /// Master frame counter broadcast
    FrameSync = 3,
    /// Generic command
    Command = 4,
    /// Generic data transfer
    Data = 5,

    /// Master announces itself periodically
    MasterAnnouncement = 10,
    /// Query for the current master
    MasterQuery = 11,
    /// Reply to a master query
    MasterResponse = 12,
    /// Election start, carries the candidate
    MasterElection = 13,
    /// Vote for a candidate in the current term
    MasterVote = 14,
    /// Master steps down voluntarily
    MasterResign = 15,
    /// Role change notification
    RoleChange = 16,

    /// Settings replication broadcast
    SettingsSync = 20,
    /// Ask any peer for its current settings
    SettingsRequest = 21,
    /// Reply carrying serialized settings
    SettingsResponse = 22,

    /// RTT probe
    PingRequest = 30,
    /// RTT probe echo
    PingResponse = 31,

    /// Application-defined message
    Custom = 255,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Discovery),
            1 => Ok(Self::DiscoveryResponse),
            2 => Ok(Self::TimeSync),
            3 => Ok(Self::FrameSync),
            4 => Ok(Self::Command),
            5 => Ok(Self::Data),
            10 => Ok(Self::MasterAnnouncement),
            11 => Ok(Self::MasterQuery),
            12 => Ok(Self::MasterResponse),
            13 => Ok(Self::MasterElection),
            14 => Ok(Self::MasterVote),
            15 => Ok(Self::MasterResign),
            16 => Ok(Self::RoleChange),
            20 => Ok(Self::SettingsSync),
            21 => Ok(Self::SettingsRequest),
            22 => Ok(Self::SettingsResponse),
            30 => Ok(Self::PingRequest),
            31 => Ok(Self::PingResponse),
            255 => Ok(Self::Custom),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub msg_type: MessageType,
    /// Total datagram size including this header.
    pub size: u16,
    /// Per-sender sequence number, wrapping mod 2^16.
    pub sequence: u16,
    pub project_id: Uuid,
    pub version: u8,
    pub flags: u8,
}

impl Header {
    /// Parse a header from the front of a datagram.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedHeader {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic { got: magic });
        }

        let msg_type = MessageType::try_from(bytes[4])?;
        let size = u16::from_le_bytes(bytes[5..7].try_into().unwrap());
        let sequence = u16::from_le_bytes(bytes[7..9].try_into().unwrap());

        let project_id = Uuid::from_bytes(bytes[9..25].try_into().unwrap());

        let version = bytes[25];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = bytes[26];

        Ok(Self {
            magic,
            msg_type,
            size,
            sequence,
            project_id,
            version,
            flags,
        })
    }

    /// Append this header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(self.project_id.as_bytes());
        out.push(self.version);
        out.push(self.flags);
    }
}

/// A parsed or to-be-sent datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub sequence: u16,
    pub project_id: Uuid,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, project_id: Uuid, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sequence,
            project_id,
            flags: 0,
            payload,
        }
    }

    /// Serialize into `scratch`, clearing it first. The buffer is reused
    /// across sends so steady-state encoding does not allocate.
    pub fn encode_into(&self, scratch: &mut Vec<u8>) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        scratch.clear();
        scratch.reserve(HEADER_SIZE + self.payload.len());

        let header = Header {
            magic: MAGIC,
            msg_type: self.msg_type,
            size: (HEADER_SIZE + self.payload.len()) as u16,
            sequence: self.sequence,
            project_id: self.project_id,
            version: PROTOCOL_VERSION,
            flags: self.flags,
        };
        header.write_to(scratch);
        scratch.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Serialize into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Parse a received datagram. Rejects bad magic, truncation, declared
    /// size not matching the received byte count, unknown types and
    /// unsupported versions; the caller drops such datagrams.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::read_from(bytes)?;

        if header.size as usize != bytes.len() {
            return Err(ProtocolError::SizeMismatch {
                declared: header.size as usize,
                received: bytes.len(),
            });
        }

        Ok(Self {
            msg_type: header.msg_type,
            sequence: header.sequence,
            project_id: header.project_id,
            flags: header.flags,
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Bincode configuration shared by all struct-shaped payloads: fixed-width
/// little-endian integers with a size limit against allocation bombs.
pub(crate) fn bincode_config() -> impl bincode::Options {
    bincode::options()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .with_little_endian()
        .with_fixint_encoding()
}

/// Encode a struct-shaped payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_config().serialize(value)?)
}

/// Decode a struct-shaped payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_config().deserialize(bytes)?)
}
