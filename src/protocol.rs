use crate::error::CoreError;
use crate::identity::PeerId;
use std::time::Duration;

macro_rules! protocol_newtype {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

protocol_newtype!(
    MessageKind,
    u16,
    "Wire type tag of one part inside a frame; keys handler registration."
);
protocol_newtype!(
    TransportKind,
    u16,
    "Protocol number of a transport driver (UDP, TCP, ...)."
);
protocol_newtype!(
    Challenge,
    u32,
    "Random PING challenge echoed verbatim by the matching PONG."
);
protocol_newtype!(
    FragmentId,
    u32,
    "Identifier shared by all fragments of one oversized message."
);

/// Core part kinds. Application modules register handlers for kinds
/// above [`MessageKind::MAX_RESERVED`].
impl MessageKind {
    pub const HELLO: MessageKind = MessageKind(0);
    pub const SET_KEY: MessageKind = MessageKind(1);
    pub const PING: MessageKind = MessageKind(2);
    pub const PONG: MessageKind = MessageKind(3);
    pub const HANGUP: MessageKind = MessageKind(4);
    pub const FRAGMENT: MessageKind = MessageKind(5);
    pub const NOISE: MessageKind = MessageKind(6);
    pub const MAX_RESERVED: MessageKind = MessageKind(31);
}

/// Bytes of the hash-MAC that opens every frame.
pub const MAC_LEN: usize = 64;
/// Plaintext frame header: MAC, sequence number, timestamp, bandwidth cap.
pub const PACKET_HEADER_LEN: usize = MAC_LEN + 12;
/// Size/type prefix of each part body.
pub const PART_HEADER_LEN: usize = 4;

/// Hard cap on one assembled frame for streaming transports.
pub const MAX_STREAM_FRAME: usize = 64 * 1024;
/// MTU assumed for peers whose transport has not told us better.
pub const EXPECTED_MTU: usize = 1500;

/// Priority granted to administrative messages (key exchange, PONG).
pub const ADMIN_PRIORITY: u32 = 0xFFFF;
/// Priority above which scheduling constraints (window, load) are bypassed.
pub const EXTREME_PRIORITY: u32 = 0xFF_FFFF;

/// Idle messages per inactivity interval the keepalive padding targets.
pub const TARGET_MSG_SID: u32 = 8;
/// Connection is dropped after this long without confirmed traffic.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
/// Handshake must make progress within this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(150);
/// Queued messages expire this long past their deadline.
pub const SEND_EXPIRY: Duration = Duration::from_secs(120);
/// Inbound frames older than this are replayed or badly skewed.
pub const MAX_FRAME_AGE: Duration = Duration::from_secs(24 * 3600);

/// Floor on the per-peer inbound allocation (bytes per minute):
/// enough for `TARGET_MSG_SID` MTU-sized frames per inactivity interval.
pub const MIN_BPM_PER_PEER: u64 =
    (TARGET_MSG_SID as u64) * (EXPECTED_MTU as u64) * 60 / INACTIVITY_TIMEOUT.as_secs();
/// Send window may buffer at most this many minutes of credit.
pub const MAX_BUF_FACT: u64 = 2;
/// Scheduler passes required per sampling interval.
pub const MINIMUM_SAMPLE_COUNT: u32 = 2;
/// Outbound queue byte budget per peer before expiry kicks in.
pub const MAX_SEND_BUFFER_SIZE: usize = EXPECTED_MTU * 8;

/// Minimum representative window for the fair-share allocator.
pub fn min_sample_time() -> Duration {
    Duration::from_millis(
        MINIMUM_SAMPLE_COUNT as u64 * 60_000 * EXPECTED_MTU as u64 / MIN_BPM_PER_PEER,
    )
}

/// Plaintext header of every wire frame.
///
/// A frame with `mac == sha512(body)` and all other fields zero is a
/// plaintext frame (handshake traffic); anything else is encrypted from
/// `sequence_number` to the end, with the MAC prefix as IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub mac: [u8; MAC_LEN],
    pub sequence_number: u32,
    pub time_stamp: u32,
    pub bandwidth: u32,
}

impl PacketHeader {
    pub fn zeroed() -> Self {
        Self {
            mac: [0u8; MAC_LEN],
            sequence_number: 0,
            time_stamp: 0,
            bandwidth: 0,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[..MAC_LEN].copy_from_slice(&self.mac);
        out[MAC_LEN..MAC_LEN + 4].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[MAC_LEN + 4..MAC_LEN + 8].copy_from_slice(&self.time_stamp.to_be_bytes());
        out[MAC_LEN + 8..MAC_LEN + 12].copy_from_slice(&self.bandwidth.to_be_bytes());
    }

    pub fn parse(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(CoreError::Wire("frame shorter than packet header"));
        }
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&data[..MAC_LEN]);
        Ok(Self {
            mac,
            sequence_number: read_u32(&data[MAC_LEN..]),
            time_stamp: read_u32(&data[MAC_LEN + 4..]),
            bandwidth: read_u32(&data[MAC_LEN + 8..]),
        })
    }
}

/// Size/type prefix of each concatenated part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    /// Total part size including this header.
    pub size: u16,
    pub kind: MessageKind,
}

impl PartHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.size.to_be_bytes());
        out[2..4].copy_from_slice(&self.kind.0.to_be_bytes());
    }

    pub fn parse(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < PART_HEADER_LEN {
            return Err(CoreError::Wire("truncated part header"));
        }
        Ok(Self {
            size: read_u16(data),
            kind: MessageKind(read_u16(&data[2..])),
        })
    }
}

/// Builds one part (header + body) into a fresh buffer.
pub fn build_part(kind: MessageKind, body: &[u8]) -> Vec<u8> {
    let size = PART_HEADER_LEN + body.len();
    debug_assert!(size <= u16::MAX as usize);
    let mut out = vec![0u8; size];
    PartHeader {
        size: size as u16,
        kind,
    }
    .write_to(&mut out);
    out[PART_HEADER_LEN..].copy_from_slice(body);
    out
}

/// Iterates the parts of a decrypted frame body, realigning by copy.
///
/// Parts are packed back to back with no alignment guarantee; each item
/// is the part kind plus an owned copy of its body.
pub struct PartIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PartIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for PartIter<'_> {
    type Item = Result<(MessageKind, Vec<u8>), CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let header = match PartHeader::parse(&self.data[self.pos..]) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let size = header.size as usize;
        if size < PART_HEADER_LEN || self.pos + size > self.data.len() {
            return Some(Err(CoreError::Wire("part size out of bounds")));
        }
        let body = self.data[self.pos + PART_HEADER_LEN..self.pos + size].to_vec();
        self.pos += size;
        Some(Ok((header.kind, body)))
    }
}

/// PING and PONG share one body: target identity plus challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongBody {
    pub receiver: PeerId,
    pub challenge: Challenge,
}

impl PingPongBody {
    pub const LEN: usize = PeerId::LEN + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(self.receiver.as_bytes());
        out.extend_from_slice(&self.challenge.0.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() != Self::LEN {
            return Err(CoreError::Wire("bad ping/pong size"));
        }
        Ok(Self {
            receiver: PeerId::from_slice(&data[..PeerId::LEN]),
            challenge: Challenge(read_u32(&data[PeerId::LEN..])),
        })
    }
}

/// HANGUP carries the sender's identity so a mis-delivered part cannot
/// tear down an unrelated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HangupBody {
    pub sender: PeerId,
}

impl HangupBody {
    pub const LEN: usize = PeerId::LEN;

    pub fn encode(&self) -> Vec<u8> {
        self.sender.as_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() != Self::LEN {
            return Err(CoreError::Wire("bad hangup size"));
        }
        Ok(Self {
            sender: PeerId::from_slice(data),
        })
    }
}

/// Session-key exchange: the key wrapped to the receiver's public key,
/// signed by the sender over (creation time, wrapped key, receiver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyBody {
    /// Creation time of the key (Unix seconds); older keys never
    /// replace newer ones.
    pub creation_time: u32,
    pub wrapped_key: [u8; 32],
    pub signature: [u8; 64],
}

impl SetKeyBody {
    pub const LEN: usize = 4 + 32 + 64;

    /// The bytes the signature covers, bound to the intended receiver
    /// so a wrapped key cannot be replayed at a third party.
    pub fn signed_payload(creation_time: u32, wrapped_key: &[u8; 32], receiver: &PeerId) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + PeerId::LEN);
        out.extend_from_slice(&creation_time.to_be_bytes());
        out.extend_from_slice(wrapped_key);
        out.extend_from_slice(receiver.as_bytes());
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.creation_time.to_be_bytes());
        out.extend_from_slice(&self.wrapped_key);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() != Self::LEN {
            return Err(CoreError::Wire("bad setkey size"));
        }
        let mut wrapped_key = [0u8; 32];
        wrapped_key.copy_from_slice(&data[4..36]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[36..100]);
        Ok(Self {
            creation_time: read_u32(data),
            wrapped_key,
            signature,
        })
    }
}

/// One slice of an oversized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBody {
    pub id: FragmentId,
    pub total_len: u16,
    pub offset: u16,
    pub payload: Vec<u8>,
}

impl FragmentBody {
    pub const FIXED_LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.payload.len());
        out.extend_from_slice(&self.id.0.to_be_bytes());
        out.extend_from_slice(&self.total_len.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < Self::FIXED_LEN {
            return Err(CoreError::Wire("truncated fragment"));
        }
        let payload = data[Self::FIXED_LEN..].to_vec();
        if payload.is_empty() {
            return Err(CoreError::Wire("empty fragment"));
        }
        Ok(Self {
            id: FragmentId(read_u32(data)),
            total_len: read_u16(&data[4..]),
            offset: read_u16(&data[6..]),
            payload,
        })
    }
}

pub(crate) fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

pub(crate) fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}
