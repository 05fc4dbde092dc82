//! PTPv2 (IEEE 1588-2008) message structures sent by the grandmaster.
//!
//! Only the messages the transmit path emits are modelled here: Sync, Follow-Up,
//! Announce and Delay-Response. Every message shares the 34-byte common header
//! and is serialized big-endian into a caller-provided buffer so the send path
//! can reuse one buffer for every datagram.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// UDP port for PTP event messages (Sync, Delay_Req).
pub const PTP_EVENT_PORT: u16 = 319;
/// UDP port for PTP general messages (Follow_Up, Announce, Delay_Resp).
pub const PTP_GENERAL_PORT: u16 = 320;

/// Size of the reusable payload buffers. Large enough for any message sent here
/// plus the TLVs a unicast negotiation could append.
pub const PAYLOAD_SIZE_BYTES: usize = 508;
/// Size of the reusable ancillary (control message) buffer.
pub const CONTROL_SIZE_BYTES: usize = 256;

/// Common header size.
pub const HEADER_SIZE: usize = 34;
/// PTP timestamp size on the wire (48-bit seconds + 32-bit nanoseconds).
pub const TIMESTAMP_SIZE: usize = 10;
/// Port identity size on the wire (clock identity + port number).
pub const PORT_IDENTITY_SIZE: usize = 10;

/// PTP version carried in every header.
pub const PTP_VERSION: u8 = 2;

/// flagField bits (octet 0 is the high byte).
pub const FLAG_TWO_STEP: u16 = 0x0200;
pub const FLAG_UNICAST: u16 = 0x0400;
/// currentUtcOffset in Announce is known to be correct.
pub const FLAG_UTC_OFFSET_VALID: u16 = 0x0004;
/// The grandmaster timescale is PTP (TAI), not ARB.
pub const FLAG_PTP_TIMESCALE: u16 = 0x0008;

const MAX_48BIT_SECONDS: u64 = (1 << 48) - 1;

/// Errors produced while encoding or decoding PTP messages.
#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    /// The buffer cannot hold (or does not contain) the whole message.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    /// The messageType nibble is not a type defined by IEEE 1588-2008.
    #[error("Unknown PTP message type: {0:#x}")]
    UnknownMessageType(u8),
    /// The datagram holds a different message than the one being decoded.
    #[error("Unexpected message type {0}")]
    UnexpectedMessageType(MessageType),
    /// The timestamp cannot be represented as a calendar time.
    #[error("Timestamp out of range")]
    TimestampOutOfRange,
}

/// PTP message types (messageType nibble of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    PDelayReq = 0x2,
    PDelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PDelayRespFollowUp = 0xA,
    Announce = 0xB,
    Signaling = 0xC,
    Management = 0xD,
}

impl MessageType {
    /// Upper-case name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Sync => "SYNC",
            MessageType::DelayReq => "DELAY_REQ",
            MessageType::PDelayReq => "PDELAY_REQ",
            MessageType::PDelayResp => "PDELAY_RESP",
            MessageType::FollowUp => "FOLLOW_UP",
            MessageType::DelayResp => "DELAY_RESP",
            MessageType::PDelayRespFollowUp => "PDELAY_RESP_FOLLOW_UP",
            MessageType::Announce => "ANNOUNCE",
            MessageType::Signaling => "SIGNALING",
            MessageType::Management => "MANAGEMENT",
        }
    }

    /// controlField value mandated for PTPv1 compatibility.
    fn control_field(&self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::DelayReq => 1,
            MessageType::FollowUp => 2,
            MessageType::DelayResp => 3,
            MessageType::Management => 4,
            _ => 5,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x0F {
            0x0 => Ok(MessageType::Sync),
            0x1 => Ok(MessageType::DelayReq),
            0x2 => Ok(MessageType::PDelayReq),
            0x3 => Ok(MessageType::PDelayResp),
            0x8 => Ok(MessageType::FollowUp),
            0x9 => Ok(MessageType::DelayResp),
            0xA => Ok(MessageType::PDelayRespFollowUp),
            0xB => Ok(MessageType::Announce),
            0xC => Ok(MessageType::Signaling),
            0xD => Ok(MessageType::Management),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that can be written to the wire.
pub trait Packet {
    /// Serializes the message into `buf`, returning the number of bytes written.
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError>;
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

/// PTP timestamp: 48-bit seconds and 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    /// Seconds since the PTP epoch; only the low 48 bits go on the wire.
    pub seconds: u64,
    /// Nanoseconds within the second.
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    /// Serializes the timestamp into a 10-byte slice.
    pub fn write(&self, buf: &mut [u8]) {
        let secs = self.seconds.min(MAX_48BIT_SECONDS).to_be_bytes();
        buf[0..6].copy_from_slice(&secs[2..8]);
        buf[6..10].copy_from_slice(&self.nanoseconds.to_be_bytes());
    }

    /// Deserializes a timestamp from a 10-byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(buf, TIMESTAMP_SIZE)?;
        let mut secs = [0u8; 8];
        secs[2..8].copy_from_slice(&buf[0..6]);
        Ok(PtpTimestamp {
            seconds: u64::from_be_bytes(secs),
            nanoseconds: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Converts back into a calendar time.
    pub fn to_datetime(&self) -> Result<DateTime<Utc>, ProtocolError> {
        DateTime::<Utc>::from_timestamp(self.seconds as i64, self.nanoseconds)
            .ok_or(ProtocolError::TimestampOutOfRange)
    }
}

impl From<DateTime<Utc>> for PtpTimestamp {
    fn from(date: DateTime<Utc>) -> Self {
        PtpTimestamp {
            seconds: date.timestamp().max(0) as u64,
            nanoseconds: date.timestamp_subsec_nanos(),
        }
    }
}

/// Identity of a PTP port: EUI-64 clock identity plus port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PortIdentity {
    pub clock_identity: u64,
    pub port_number: u16,
}

impl PortIdentity {
    fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.clock_identity.to_be_bytes());
        buf[8..10].copy_from_slice(&self.port_number.to_be_bytes());
    }

    fn from_bytes(buf: &[u8]) -> Self {
        PortIdentity {
            clock_identity: read_u64(buf, 0),
            port_number: read_u16(buf, 8),
        }
    }
}

/// Common PTP message header.
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |TSpec. | MsgTyp|  Rsvd |Version|         Message Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Domain Number |   Reserved    |           Flag Field          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Correction Field                        |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Reserved                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  Source Port Identity (10 octets)             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Sequence Id          | Control Field | Log Msg Intvl |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub transport_specific: u8,
    pub message_type: MessageType,
    pub version: u8,
    pub message_length: u16,
    pub domain_number: u8,
    /// `FLAG_*` bits.
    pub flag_field: u16,
    /// Residence and path corrections in nanoseconds scaled by 2^16.
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    /// Deprecated PTPv1 field, derived from the message type.
    pub control_field: u8,
    /// log2 of the message interval in seconds, 0x7f when not applicable.
    pub log_message_interval: i8,
}

impl Header {
    /// Creates a header for `message_type` with the length and control field filled in.
    pub fn new(
        message_type: MessageType,
        message_length: u16,
        domain_number: u8,
        source_port_identity: PortIdentity,
        sequence_id: u16,
    ) -> Self {
        Header {
            transport_specific: 0,
            message_type,
            version: PTP_VERSION,
            message_length,
            domain_number,
            flag_field: FLAG_UNICAST,
            correction_field: 0,
            source_port_identity,
            sequence_id,
            control_field: message_type.control_field(),
            log_message_interval: 0x7f,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0] = (self.transport_specific << 4) | (self.message_type as u8 & 0x0F);
        buf[1] = self.version & 0x0F;
        buf[2..4].copy_from_slice(&self.message_length.to_be_bytes());
        buf[4] = self.domain_number;
        buf[5] = 0;
        buf[6..8].copy_from_slice(&self.flag_field.to_be_bytes());
        buf[8..16].copy_from_slice(&self.correction_field.to_be_bytes());
        buf[16..20].fill(0);
        self.source_port_identity.write(&mut buf[20..30]);
        buf[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
        buf[32] = self.control_field;
        buf[33] = self.log_message_interval as u8;
    }

    /// Deserializes a header from the start of a datagram.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(buf, HEADER_SIZE)?;
        Ok(Header {
            transport_specific: buf[0] >> 4,
            message_type: MessageType::try_from(buf[0])?,
            version: buf[1] & 0x0F,
            message_length: read_u16(buf, 2),
            domain_number: buf[4],
            flag_field: read_u16(buf, 6),
            correction_field: read_u64(buf, 8) as i64,
            source_port_identity: PortIdentity::from_bytes(&buf[20..30]),
            sequence_id: read_u16(buf, 30),
            control_field: buf[32],
            log_message_interval: buf[33] as i8,
        })
    }

    fn expect(buf: &[u8], message_type: MessageType) -> Result<Self, ProtocolError> {
        let header = Header::from_bytes(buf)?;
        if header.message_type != message_type {
            return Err(ProtocolError::UnexpectedMessageType(header.message_type));
        }
        Ok(header)
    }
}

/// Sync (and Delay_Req, which shares the layout) message, 44 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDelayReq {
    pub header: Header,
    pub origin_timestamp: PtpTimestamp,
}

impl SyncDelayReq {
    pub const SIZE: usize = HEADER_SIZE + TIMESTAMP_SIZE;
}

impl Packet for SyncDelayReq {
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        self.header.write(buf);
        self.origin_timestamp.write(&mut buf[HEADER_SIZE..Self::SIZE]);
        Ok(Self::SIZE)
    }
}

/// Follow_Up message carrying the precise transmit time of the matching Sync, 44 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowUp {
    pub header: Header,
    pub precise_origin_timestamp: PtpTimestamp,
}

impl FollowUp {
    pub const SIZE: usize = HEADER_SIZE + TIMESTAMP_SIZE;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        Ok(FollowUp {
            header: Header::expect(buf, MessageType::FollowUp)?,
            precise_origin_timestamp: PtpTimestamp::from_bytes(&buf[HEADER_SIZE..])?,
        })
    }
}

impl Packet for FollowUp {
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        self.header.write(buf);
        self.precise_origin_timestamp
            .write(&mut buf[HEADER_SIZE..Self::SIZE]);
        Ok(Self::SIZE)
    }
}

/// Quality of the grandmaster clock as advertised in Announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockQuality {
    /// Traceability of the clock (6 = locked to a primary reference).
    pub clock_class: u8,
    /// Enumerated accuracy (0x21 = within 100 ns).
    pub clock_accuracy: u8,
    /// Scaled log2 of the Allan variance.
    pub offset_scaled_log_variance: u16,
}

/// Announce message, 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Announce {
    pub header: Header,
    /// Left at zero; clients only use the dataset fields.
    pub origin_timestamp: PtpTimestamp,
    /// TAI - UTC in seconds.
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    /// Clock identity of this grandmaster.
    pub grandmaster_identity: u64,
    /// Always 0, the grandmaster is the root of the tree.
    pub steps_removed: u16,
    /// Source of time (0x20 = GNSS, 0xA0 = internal oscillator).
    pub time_source: u8,
}

impl Announce {
    pub const SIZE: usize = HEADER_SIZE + 30;
}

impl Packet for Announce {
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        self.header.write(buf);
        let body = &mut buf[HEADER_SIZE..Self::SIZE];
        self.origin_timestamp.write(&mut body[0..10]);
        body[10..12].copy_from_slice(&self.current_utc_offset.to_be_bytes());
        body[12] = 0;
        body[13] = self.grandmaster_priority1;
        body[14] = self.grandmaster_clock_quality.clock_class;
        body[15] = self.grandmaster_clock_quality.clock_accuracy;
        body[16..18].copy_from_slice(
            &self
                .grandmaster_clock_quality
                .offset_scaled_log_variance
                .to_be_bytes(),
        );
        body[18] = self.grandmaster_priority2;
        body[19..27].copy_from_slice(&self.grandmaster_identity.to_be_bytes());
        body[27..29].copy_from_slice(&self.steps_removed.to_be_bytes());
        body[29] = self.time_source;
        Ok(Self::SIZE)
    }
}

/// Delay_Resp message answering a client's Delay_Req, 54 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayResp {
    pub header: Header,
    /// When the Delay_Req reached the grandmaster.
    pub receive_timestamp: PtpTimestamp,
    /// Source port identity of the Delay_Req being answered.
    pub requesting_port_identity: PortIdentity,
}

impl DelayResp {
    pub const SIZE: usize = HEADER_SIZE + TIMESTAMP_SIZE + PORT_IDENTITY_SIZE;

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        Ok(DelayResp {
            header: Header::expect(buf, MessageType::DelayResp)?,
            receive_timestamp: PtpTimestamp::from_bytes(&buf[HEADER_SIZE..])?,
            requesting_port_identity: PortIdentity::from_bytes(
                &buf[HEADER_SIZE + TIMESTAMP_SIZE..Self::SIZE],
            ),
        })
    }
}

impl Packet for DelayResp {
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        ensure_len(buf, Self::SIZE)?;
        self.header.write(buf);
        self.receive_timestamp
            .write(&mut buf[HEADER_SIZE..HEADER_SIZE + TIMESTAMP_SIZE]);
        self.requesting_port_identity
            .write(&mut buf[HEADER_SIZE + TIMESTAMP_SIZE..Self::SIZE]);
        Ok(Self::SIZE)
    }
}
