// Wire format: fixed 4-byte header plus four bit-packed message bodies.

use std::convert::TryFrom;

use crate::bits::{BitReader, BitWriter, CodecError};

use thiserror::Error;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 4;

/// Payload length of a negotiation request or response.
pub const NEGOTIATION_PAYLOAD_LEN: usize = 4;

/// Payload length of a sample message in either direction.
pub const SAMPLE_PAYLOAD_LEN: usize = 12;

/// Largest magnitude carried by the 9-bit signed sample value.
pub const SIGNED_VALUE_LIMIT: i16 = 255;

/// Message kind carried in the header's type byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Peer → Controller session negotiation.
    NegotiationRequest = 0x01,
    /// Controller → Peer session assignment.
    NegotiationResponse = 0x02,
    /// Peer → Controller sample payload.
    SampleUp = 0x03,
    /// Controller → Peer sample payload.
    SampleDown = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::NegotiationRequest),
            0x02 => Ok(MessageType::NegotiationResponse),
            0x03 => Ok(MessageType::SampleUp),
            0x04 => Ok(MessageType::SampleDown),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

/// Wire-level error.
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Type code not assigned by the protocol.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// Declared payload length exceeds the bytes actually present.
    #[error("payload truncated: declared {declared} bytes, {available} available")]
    PayloadTruncated { declared: usize, available: usize },

    /// Bit-level encode or decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Fixed header as carried on the wire: `type | reserved(0) | payload_len BE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind.
    pub message_type: MessageType,
    /// Payload length in bytes, excluding the header itself.
    pub payload_len: u16,
}

impl Header {
    /// Encodes the header into its 4-byte form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_len.to_be_bytes();
        [u8::from(self.message_type), 0, len[0], len[1]]
    }

    /// Parses a header from the front of `bytes`.
    ///
    /// The reserved byte is ignored on the read side.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::BufferTooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let message_type = MessageType::try_from(bytes[0])?;
        let payload_len = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(Self {
            message_type,
            payload_len,
        })
    }
}

/// Command carried by a [`SampleUp`] message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// No command.
    #[default]
    None = 0,
    Start = 1,
    Stop = 2,
    Reset = 3,
    Query = 4,
    Update = 5,
}

impl CommandType {
    /// Decodes a 3-bit field; the reserved codes 6-7 map to `None`.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => CommandType::Start,
            2 => CommandType::Stop,
            3 => CommandType::Reset,
            4 => CommandType::Query,
            5 => CommandType::Update,
            _ => CommandType::None,
        }
    }
}

/// Status carried by a [`SampleDown`] message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StatusType {
    /// Status not known or not applicable.
    #[default]
    Unknown = 0,
    Ready = 1,
    Running = 2,
    Paused = 3,
    Error = 4,
    Complete = 5,
}

impl StatusType {
    /// Decodes a 3-bit field; the reserved codes 6-7 map to `Unknown`.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => StatusType::Ready,
            2 => StatusType::Running,
            3 => StatusType::Paused,
            4 => StatusType::Error,
            5 => StatusType::Complete,
            _ => StatusType::Unknown,
        }
    }
}

/// Session negotiation request (Peer → Controller).
///
/// `session_id` is the peer's current session, zero when not associated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub session_id: u16,
    pub peer_id: u16,
}

/// Session negotiation response (Controller → Peer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationResponse {
    pub session_id: u16,
    pub peer_id: u16,
}

/// Sample payload sent by the Peer.
///
/// `value` is a 9-bit signed quantity on the wire; magnitudes above 255
/// saturate on encode. `position` travels as signed 16.16 fixed point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleUp {
    pub session_id: u16,
    pub peer_id: u16,
    pub command: CommandType,
    pub value: i16,
    pub sequence: u16,
    pub position: f64,
}

/// Sample payload sent by the Controller.
///
/// Same layout as [`SampleUp`] with a status in place of the command and a
/// velocity in place of the position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleDown {
    pub session_id: u16,
    pub peer_id: u16,
    pub status: StatusType,
    pub value: i16,
    pub timestamp: u16,
    pub velocity: f64,
}

fn encode_negotiation_body(session_id: u16, peer_id: u16) -> Result<Vec<u8>, WireError> {
    let mut writer = BitWriter::with_capacity(NEGOTIATION_PAYLOAD_LEN);
    writer.write_u16(session_id)?;
    writer.write_u16(peer_id)?;
    Ok(writer.into_bytes())
}

fn encode_sample_body(
    session_id: u16,
    peer_id: u16,
    kind_bits: u8,
    value: i16,
    stamp: u16,
    fixed: f64,
) -> Result<Vec<u8>, WireError> {
    let mut writer = BitWriter::with_capacity(SAMPLE_PAYLOAD_LEN);
    writer.write_u16(session_id)?;
    writer.write_u16(peer_id)?;
    writer.write_bits(u32::from(kind_bits), 3)?;
    writer.write_bool(value < 0)?;
    writer.write_bits(
        u32::from(value.unsigned_abs().min(SIGNED_VALUE_LIMIT as u16)),
        8,
    )?;
    writer.write_bits(0, 4)?;
    writer.write_u16(stamp)?;
    writer.write_fixed(fixed)?;
    Ok(writer.into_bytes())
}

struct SampleBody {
    session_id: u16,
    peer_id: u16,
    kind_bits: u8,
    value: i16,
    stamp: u16,
    fixed: f64,
}

fn decode_sample_body(reader: &mut BitReader<'_>) -> Result<SampleBody, WireError> {
    let session_id = reader.read_u16()?;
    let peer_id = reader.read_u16()?;
    let kind_bits = reader.read_bits(3)? as u8;
    let negative = reader.read_bool()?;
    let magnitude = reader.read_bits(8)? as i16;
    reader.skip(4)?;
    let stamp = reader.read_u16()?;
    let fixed = reader.read_fixed()?;
    Ok(SampleBody {
        session_id,
        peer_id,
        kind_bits,
        value: if negative { -magnitude } else { magnitude },
        stamp,
        fixed,
    })
}

fn frame(message_type: MessageType, body: Vec<u8>) -> Vec<u8> {
    let header = Header {
        message_type,
        payload_len: body.len() as u16,
    };
    let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
    datagram.extend_from_slice(&header.encode());
    datagram.extend_from_slice(&body);
    datagram
}

impl NegotiationRequest {
    /// Encodes the full datagram, header included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(frame(
            MessageType::NegotiationRequest,
            encode_negotiation_body(self.session_id, self.peer_id)?,
        ))
    }
}

impl NegotiationResponse {
    /// Encodes the full datagram, header included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(frame(
            MessageType::NegotiationResponse,
            encode_negotiation_body(self.session_id, self.peer_id)?,
        ))
    }
}

impl SampleUp {
    /// Encodes the full datagram, header included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(frame(
            MessageType::SampleUp,
            encode_sample_body(
                self.session_id,
                self.peer_id,
                self.command as u8,
                self.value,
                self.sequence,
                self.position,
            )?,
        ))
    }
}

impl SampleDown {
    /// Encodes the full datagram, header included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(frame(
            MessageType::SampleDown,
            encode_sample_body(
                self.session_id,
                self.peer_id,
                self.status as u8,
                self.value,
                self.timestamp,
                self.velocity,
            )?,
        ))
    }
}

/// A fully decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    NegotiationRequest(NegotiationRequest),
    NegotiationResponse(NegotiationResponse),
    SampleUp(SampleUp),
    SampleDown(SampleDown),
}

impl Message {
    /// Returns the wire type of the decoded message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::NegotiationRequest(_) => MessageType::NegotiationRequest,
            Message::NegotiationResponse(_) => MessageType::NegotiationResponse,
            Message::SampleUp(_) => MessageType::SampleUp,
            Message::SampleDown(_) => MessageType::SampleDown,
        }
    }
}

/// Decodes a datagram in two passes: the header is parsed from the full
/// buffer, then a body-only reader is built over the declared payload range,
/// so truncation is detected before any body parsing starts. Bytes past the
/// declared payload are ignored.
pub fn decode_datagram(datagram: &[u8]) -> Result<Message, WireError> {
    let header = Header::parse(datagram)?;
    let declared = header.payload_len as usize;
    let available = datagram.len() - HEADER_LEN;
    if available < declared {
        return Err(WireError::PayloadTruncated {
            declared,
            available,
        });
    }
    let mut reader = BitReader::new(&datagram[HEADER_LEN..HEADER_LEN + declared]);

    match header.message_type {
        MessageType::NegotiationRequest => Ok(Message::NegotiationRequest(NegotiationRequest {
            session_id: reader.read_u16()?,
            peer_id: reader.read_u16()?,
        })),
        MessageType::NegotiationResponse => {
            Ok(Message::NegotiationResponse(NegotiationResponse {
                session_id: reader.read_u16()?,
                peer_id: reader.read_u16()?,
            }))
        }
        MessageType::SampleUp => {
            let body = decode_sample_body(&mut reader)?;
            Ok(Message::SampleUp(SampleUp {
                session_id: body.session_id,
                peer_id: body.peer_id,
                command: CommandType::from_bits(body.kind_bits),
                value: body.value,
                sequence: body.stamp,
                position: body.fixed,
            }))
        }
        MessageType::SampleDown => {
            let body = decode_sample_body(&mut reader)?;
            Ok(Message::SampleDown(SampleDown {
                session_id: body.session_id,
                peer_id: body.peer_id,
                status: StatusType::from_bits(body.kind_bits),
                value: body.value,
                timestamp: body.stamp,
                velocity: body.fixed,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed;
    use proptest::prelude::*;

    #[test]
    fn header_layout_is_type_reserved_len() {
        let header = Header {
            message_type: MessageType::SampleUp,
            payload_len: SAMPLE_PAYLOAD_LEN as u16,
        };
        assert_eq!(header.encode(), [0x03, 0x00, 0x00, 0x0C]);
        assert_eq!(Header::parse(&header.encode()).unwrap(), header);
    }

    #[test]
    fn negotiation_request_bytes() {
        let request = NegotiationRequest {
            session_id: 0x0001,
            peer_id: 0x1234,
        };
        let datagram = request.encode().unwrap();
        assert_eq!(
            datagram,
            vec![0x01, 0x00, 0x00, 0x04, 0x00, 0x01, 0x12, 0x34]
        );
        assert_eq!(
            decode_datagram(&datagram).unwrap(),
            Message::NegotiationRequest(request)
        );
    }

    #[test]
    fn sample_bitfield_packing() {
        // command=Update(0b101), sign=1, magnitude=2, reserved=0.
        let sample = SampleUp {
            session_id: 0x0102,
            peer_id: 0x0304,
            command: CommandType::Update,
            value: -2,
            sequence: 0,
            position: 0.0,
        };
        let datagram = sample.encode().unwrap();
        assert_eq!(datagram.len(), HEADER_LEN + SAMPLE_PAYLOAD_LEN);
        assert_eq!(datagram[8], 0b1011_0000);
        assert_eq!(datagram[9], 0b0010_0000);
    }

    #[test]
    fn sample_down_full_round_trip() {
        let sample = SampleDown {
            session_id: 1,
            peer_id: 0x4660,
            status: StatusType::Running,
            value: 50,
            timestamp: 0x04D2,
            velocity: 99.99,
        };
        let decoded = decode_datagram(&sample.encode().unwrap()).unwrap();
        let Message::SampleDown(decoded) = decoded else {
            panic!("wrong message kind: {decoded:?}");
        };
        assert_eq!(decoded.session_id, 1);
        assert_eq!(decoded.peer_id, 0x4660);
        assert_eq!(decoded.status, StatusType::Running);
        assert_eq!(decoded.value, 50);
        assert_eq!(decoded.timestamp, 0x04D2);
        assert!((decoded.velocity - 99.99).abs() < 1e-4);
    }

    #[test]
    fn signed_value_saturates_at_255() {
        for (input, expected) in [(300i16, 255i16), (-300, -255), (255, 255), (-255, -255)] {
            let sample = SampleUp {
                value: input,
                ..SampleUp::default()
            };
            let Message::SampleUp(decoded) = decode_datagram(&sample.encode().unwrap()).unwrap()
            else {
                panic!("wrong kind");
            };
            assert_eq!(decoded.value, expected, "input {input}");
        }
    }

    #[test]
    fn short_header_is_rejected() {
        let err = decode_datagram(&[0x01, 0x00, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            WireError::BufferTooShort {
                expected: HEADER_LEN,
                actual: 3,
            }
        ));
    }

    #[test]
    fn truncated_payload_is_rejected_before_body_parsing() {
        let mut datagram = SampleUp::default().encode().unwrap();
        datagram.truncate(HEADER_LEN + 5);
        let err = decode_datagram(&datagram).unwrap_err();
        assert!(matches!(
            err,
            WireError::PayloadTruncated {
                declared: 12,
                available: 5,
            }
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_datagram(&[0x7F, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(0x7F)));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let request = NegotiationRequest {
            session_id: 7,
            peer_id: 9,
        };
        let mut datagram = request.encode().unwrap();
        datagram.extend_from_slice(&[0xAA; 16]);
        assert_eq!(
            decode_datagram(&datagram).unwrap(),
            Message::NegotiationRequest(request)
        );
    }

    #[test]
    fn reserved_kind_codes_decode_to_default() {
        assert_eq!(CommandType::from_bits(6), CommandType::None);
        assert_eq!(CommandType::from_bits(7), CommandType::None);
        assert_eq!(StatusType::from_bits(6), StatusType::Unknown);
        assert_eq!(StatusType::from_bits(7), StatusType::Unknown);
    }

    fn arb_command() -> impl Strategy<Value = CommandType> {
        prop_oneof![
            Just(CommandType::None),
            Just(CommandType::Start),
            Just(CommandType::Stop),
            Just(CommandType::Reset),
            Just(CommandType::Query),
            Just(CommandType::Update),
        ]
    }

    fn arb_status() -> impl Strategy<Value = StatusType> {
        prop_oneof![
            Just(StatusType::Unknown),
            Just(StatusType::Ready),
            Just(StatusType::Running),
            Just(StatusType::Paused),
            Just(StatusType::Error),
            Just(StatusType::Complete),
        ]
    }

    proptest! {
        #[test]
        fn sample_up_round_trip(
            session_id in any::<u16>(),
            peer_id in any::<u16>(),
            command in arb_command(),
            value in -255i16..=255,
            sequence in any::<u16>(),
            raw_fixed in any::<i32>(),
        ) {
            let sample = SampleUp {
                session_id,
                peer_id,
                command,
                value,
                sequence,
                position: fixed::from_fixed(raw_fixed),
            };
            prop_assert_eq!(
                decode_datagram(&sample.encode().unwrap()).unwrap(),
                Message::SampleUp(sample)
            );
        }

        #[test]
        fn sample_down_round_trip(
            session_id in any::<u16>(),
            peer_id in any::<u16>(),
            status in arb_status(),
            value in -255i16..=255,
            timestamp in any::<u16>(),
            raw_fixed in any::<i32>(),
        ) {
            let sample = SampleDown {
                session_id,
                peer_id,
                status,
                value,
                timestamp,
                velocity: fixed::from_fixed(raw_fixed),
            };
            prop_assert_eq!(
                decode_datagram(&sample.encode().unwrap()).unwrap(),
                Message::SampleDown(sample)
            );
        }

        #[test]
        fn negotiation_round_trip(session_id in any::<u16>(), peer_id in any::<u16>()) {
            let response = NegotiationResponse { session_id, peer_id };
            prop_assert_eq!(
                decode_datagram(&response.encode().unwrap()).unwrap(),
                Message::NegotiationResponse(response)
            );
        }
    }
}
