//! Typed payloads for the fixed-layout message types.
//!
//! Struct-shaped payloads (election, settings) go through bincode; the
//! payloads whose byte layout is pinned by the wire contract (PTP sub-header,
//! frame counter, ping probe, UTF-16 discovery strings) are laid out by hand.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

// ============================================================================
// UTF-16 discovery strings
// ============================================================================

/// Encode a string as UTF-16LE bytes for Discovery / DiscoveryResponse.
///
/// The wire keeps 16-bit code units for compatibility with existing peers;
/// everything in-process is UTF-8.
pub fn encode_utf16_payload(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Decode a UTF-16LE payload back into a string.
pub fn decode_utf16_payload(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidUtf16);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16)
}

/// Split a `hostname:port` discovery response payload. A missing or
/// unparsable port falls back to `default_port`.
pub fn parse_host_port(s: &str, default_port: u16) -> (String, u16) {
    match s.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (s.to_string(), default_port),
        },
        None => (s.to_string(), default_port),
    }
}

// ============================================================================
// Frame sync
// ============================================================================

/// Encode a frame counter as 8 little-endian bytes.
pub fn encode_frame_number(frame: i64) -> Vec<u8> {
    frame.to_le_bytes().to_vec()
}

/// Decode a frame counter payload.
pub fn decode_frame_number(bytes: &[u8]) -> Result<i64> {
    if bytes.len() < 8 {
        return Err(ProtocolError::TruncatedPayload {
            need: 8,
            have: bytes.len(),
        });
    }
    Ok(i64::from_le_bytes(bytes[..8].try_into().unwrap()))
}

// ============================================================================
// Ping probes
// ============================================================================

/// Ping payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PingKind {
    Request = 0,
    Response = 1,
}

/// RTT probe payload: `{ kind u8, timestamp_us u64, sequence u32 }`,
/// 13 bytes little-endian. The response echoes the request's timestamp so
/// the requester computes RTT without any clock agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub kind: PingKind,
    pub timestamp_us: u64,
    pub sequence: u32,
}

impl PingPayload {
    pub const WIRE_SIZE: usize = 13;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::TruncatedPayload {
                need: Self::WIRE_SIZE,
                have: bytes.len(),
            });
        }
        let kind = match bytes[0] {
            0 => PingKind::Request,
            1 => PingKind::Response,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(Self {
            kind,
            timestamp_us: u64::from_le_bytes(bytes[1..9].try_into().unwrap()),
            sequence: u32::from_le_bytes(bytes[9..13].try_into().unwrap()),
        })
    }
}

// ============================================================================
// PTP sub-messages
// ============================================================================

/// PTP message kind, first byte of the sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtpKind {
    Sync = 0,
    DelayReq = 1,
    FollowUp = 2,
    DelayResp = 3,
}

impl TryFrom<u8> for PtpKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Sync),
            1 => Ok(Self::DelayReq),
            2 => Ok(Self::FollowUp),
            3 => Ok(Self::DelayResp),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Fixed PTP-like sub-header length.
pub const PTP_HEADER_SIZE: usize = 34;

/// IEEE-1588 PTP version advertised in the sub-header.
pub const PTP_VERSION: u8 = 2;

const PTP_TIMESTAMP_SIZE: usize = 8; // seconds u32 + nanos u32
const PORT_ID_SIZE: usize = 10;

/// One PTP sub-message carried inside a `TimeSync` datagram.
///
/// Layout: a 34-byte sub-header `{ kind u8, ptp_version u8, msg_len u16,
/// domain u8, reserved u8, flags u16, correction i64, reserved u32,
/// source_port_id [10]u8, sequence u16, control u8, log_interval i8 }`
/// followed by one `{ seconds u32, nanos u32 }` timestamp. DelayResp also
/// carries the requesting port identity (10 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpMessage {
    pub kind: PtpKind,
    pub sequence: u16,
    /// Origin (Sync/DelayReq), precise-origin (FollowUp) or receive
    /// (DelayResp) timestamp, microseconds.
    pub timestamp_us: i64,
    /// Present on DelayResp only.
    pub requesting_port_id: Option<[u8; PORT_ID_SIZE]>,
}

impl PtpMessage {
    pub fn new(kind: PtpKind, sequence: u16, timestamp_us: i64) -> Self {
        Self {
            kind,
            sequence,
            timestamp_us,
            requesting_port_id: None,
        }
    }

    pub fn delay_resp(sequence: u16, timestamp_us: i64, requesting_port_id: [u8; 10]) -> Self {
        Self {
            kind: PtpKind::DelayResp,
            sequence,
            timestamp_us,
            requesting_port_id: Some(requesting_port_id),
        }
    }

    fn wire_size(&self) -> usize {
        let mut size = PTP_HEADER_SIZE + PTP_TIMESTAMP_SIZE;
        if self.kind == PtpKind::DelayResp {
            size += PORT_ID_SIZE;
        }
        size
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.wire_size();
        let mut out = Vec::with_capacity(size);

        // Sub-header
        out.push(self.kind as u8);
        out.push(PTP_VERSION);
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.push(0); // domain
        out.push(0); // reserved
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0i64.to_le_bytes()); // correction
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.extend_from_slice(&[0u8; PORT_ID_SIZE]); // source port id
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(0); // control
        out.push(0); // log message interval

        // Timestamp as seconds + nanoseconds
        let seconds = (self.timestamp_us / 1_000_000) as u32;
        let nanos = ((self.timestamp_us % 1_000_000) * 1000) as u32;
        out.extend_from_slice(&seconds.to_le_bytes());
        out.extend_from_slice(&nanos.to_le_bytes());

        if let Some(port_id) = self.requesting_port_id {
            out.extend_from_slice(&port_id);
        }

        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PTP_HEADER_SIZE + PTP_TIMESTAMP_SIZE {
            return Err(ProtocolError::TruncatedPayload {
                need: PTP_HEADER_SIZE + PTP_TIMESTAMP_SIZE,
                have: bytes.len(),
            });
        }

        let kind = PtpKind::try_from(bytes[0])?;
        let sequence = u16::from_le_bytes(bytes[30..32].try_into().unwrap());

        let seconds = u32::from_le_bytes(bytes[34..38].try_into().unwrap());
        let nanos = u32::from_le_bytes(bytes[38..42].try_into().unwrap());
        let timestamp_us = i64::from(seconds) * 1_000_000 + i64::from(nanos) / 1000;

        let requesting_port_id = if kind == PtpKind::DelayResp {
            let start = PTP_HEADER_SIZE + PTP_TIMESTAMP_SIZE;
            if bytes.len() < start + PORT_ID_SIZE {
                return Err(ProtocolError::TruncatedPayload {
                    need: start + PORT_ID_SIZE,
                    have: bytes.len(),
                });
            }
            Some(bytes[start..start + PORT_ID_SIZE].try_into().unwrap())
        } else {
            None
        };

        Ok(Self {
            kind,
            sequence,
            timestamp_us,
            requesting_port_id,
        })
    }
}

// ============================================================================
// Election payloads
// ============================================================================

/// Periodic leader heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterAnnouncePayload {
    pub identity: String,
    pub priority: f32,
    pub term: i32,
}

/// Election start: the sender offers itself as a candidate for `term`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterElectionPayload {
    pub candidate: String,
    pub priority: f32,
    pub term: i32,
}

/// A vote for `candidate` in `term`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterVotePayload {
    pub candidate: String,
    pub voter: String,
    pub term: i32,
}

/// Voluntary leader step-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterResignPayload {
    pub identity: String,
    pub term: i32,
}

/// Role change notification, broadcast after a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleChangePayload {
    pub identity: String,
    pub is_master: bool,
    pub term: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_payload, encode_payload};

    #[test]
    fn utf16_roundtrip() {
        for s in ["render-01", "host:7000", "", "café-렌더"] {
            let bytes = encode_utf16_payload(s);
            assert_eq!(decode_utf16_payload(&bytes).unwrap(), s);
        }
    }

    #[test]
    fn utf16_odd_length_rejected() {
        assert!(matches!(
            decode_utf16_payload(&[0x41, 0x00, 0x42]),
            Err(ProtocolError::InvalidUtf16)
        ));
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("render-01:7010", 7000), ("render-01".into(), 7010));
        assert_eq!(parse_host_port("render-01", 7000), ("render-01".into(), 7000));
        assert_eq!(parse_host_port("render-01:nan", 7000), ("render-01:nan".into(), 7000));
    }

    #[test]
    fn frame_number_roundtrip() {
        for n in [0i64, 1, -1, i64::MAX, i64::MIN, 250] {
            assert_eq!(decode_frame_number(&encode_frame_number(n)).unwrap(), n);
        }
        assert!(decode_frame_number(&[0; 7]).is_err());
    }

    #[test]
    fn ping_roundtrip() {
        let ping = PingPayload {
            kind: PingKind::Request,
            timestamp_us: 1_726_000_123_456,
            sequence: 77,
        };
        let bytes = ping.encode();
        assert_eq!(bytes.len(), PingPayload::WIRE_SIZE);
        assert_eq!(PingPayload::decode(&bytes).unwrap(), ping);
    }

    #[test]
    fn ptp_sync_roundtrip() {
        let msg = PtpMessage::new(PtpKind::Sync, 9, 1_234_567_890);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), PTP_HEADER_SIZE + 8);
        assert_eq!(PtpMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn ptp_delay_resp_carries_port_id() {
        let mut port_id = [0u8; 10];
        port_id[..2].copy_from_slice(&42u16.to_le_bytes());
        let msg = PtpMessage::delay_resp(42, 987_654_321, port_id);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), PTP_HEADER_SIZE + 8 + 10);
        let decoded = PtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.requesting_port_id, Some(port_id));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ptp_truncated_rejected() {
        let bytes = PtpMessage::new(PtpKind::FollowUp, 1, 1).encode();
        assert!(PtpMessage::decode(&bytes[..bytes.len() - 1]).is_err());

        let resp = PtpMessage::delay_resp(1, 1, [0; 10]).encode();
        assert!(PtpMessage::decode(&resp[..resp.len() - 1]).is_err());
    }

    #[test]
    fn ptp_timestamp_microsecond_precision() {
        // Nanosecond field is 1000x the microsecond remainder, so the
        // round-trip is exact at microsecond granularity.
        let msg = PtpMessage::new(PtpKind::FollowUp, 3, 5_000_000 + 999_999);
        assert_eq!(PtpMessage::decode(&msg.encode()).unwrap().timestamp_us, 5_999_999);
    }

    #[test]
    fn election_payload_roundtrip() {
        let announce = MasterAnnouncePayload {
            identity: "alpha".into(),
            priority: 0.7,
            term: 3,
        };
        let bytes = encode_payload(&announce).unwrap();
        assert_eq!(decode_payload::<MasterAnnouncePayload>(&bytes).unwrap(), announce);

        let vote = MasterVotePayload {
            candidate: "alpha".into(),
            voter: "beta".into(),
            term: 3,
        };
        let bytes = encode_payload(&vote).unwrap();
        assert_eq!(decode_payload::<MasterVotePayload>(&bytes).unwrap(), vote);
    }
}
