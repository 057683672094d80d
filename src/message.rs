//! BiDiB Local Message Codec
//!
//! Encodes and decodes the subset of BiDiB messages used by the netBiDiB
//! link layer: protocol signature, local link descriptors and pairing
//! status, logon, logon-ack, logon-rejected and logoff.
//!
//! Frame layout:
//!
//! ```text
//! +--------+------------------+--------+--------+-------------+
//! | Byte 0 | Bytes 1..n       | n+1    | n+2    | n+3..       |
//! +--------+------------------+--------+--------+-------------+
//! | LENGTH | Address stack, 0 | MSGNUM | TYPE   | Data        |
//! +--------+------------------+--------+--------+-------------+
//! ```
//!
//! `LENGTH` counts every byte after itself. Local messages are always
//! addressed to the interface itself (empty address stack) and carry
//! message number 0.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetBidibError, Result};

/// 7-byte BiDiB unique id
pub type UniqueId = [u8; 7];

/// Longest string placed into a descriptor or signature
pub const MAX_STRING_LENGTH: usize = 64;

/// Deepest address stack accepted while decoding
const MAX_ADDRESS_DEPTH: usize = 4;

/// BiDiB message type (1 byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Logon accepted, carries the assigned node address
    LocalLogonAck = 0x70,

    /// Logon refused by the host
    LocalLogonRejected = 0x72,

    /// Protocol signature (downstream)
    LocalProtocolSignature = 0x7E,

    /// Link control (downstream)
    LocalLink = 0x7F,

    /// Node requests logon
    LocalLogon = 0xEF,

    /// Node releases control
    LocalLogoff = 0xF1,

    /// Protocol signature (upstream)
    LocalProtocolSignatureUp = 0xFE,

    /// Link control (upstream)
    LocalLinkUp = 0xFF,
}

impl MessageType {
    /// Convert from u8, returns None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x70 => Some(Self::LocalLogonAck),
            0x72 => Some(Self::LocalLogonRejected),
            0x7E => Some(Self::LocalProtocolSignature),
            0x7F => Some(Self::LocalLink),
            0xEF => Some(Self::LocalLogon),
            0xF1 => Some(Self::LocalLogoff),
            0xFE => Some(Self::LocalProtocolSignatureUp),
            0xFF => Some(Self::LocalLinkUp),
            _ => None,
        }
    }
}

/// Sub-type of a local link message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalLinkType {
    DescriptorProdString,
    DescriptorUserString,
    DescriptorRole,
    DescriptorPVersion,
    NodeUnavailable,
    NodeAvailable,
    PairingRequest,
    StatusUnpaired,
    StatusPaired,
    DescriptorUid,
    Unknown(u8),
}

impl LocalLinkType {
    /// Wire code of the link type
    pub fn code(self) -> u8 {
        match self {
            Self::DescriptorProdString => 0x00,
            Self::DescriptorUserString => 0x01,
            Self::DescriptorRole => 0x0F,
            Self::DescriptorPVersion => 0x80,
            Self::NodeUnavailable => 0x81,
            Self::NodeAvailable => 0x82,
            Self::PairingRequest => 0xFC,
            Self::StatusUnpaired => 0xFD,
            Self::StatusPaired => 0xFE,
            Self::DescriptorUid => 0xFF,
            Self::Unknown(code) => code,
        }
    }

    /// Descriptors whose payload is a length-prefixed string
    pub fn is_string_descriptor(self) -> bool {
        matches!(self, Self::DescriptorProdString | Self::DescriptorUserString)
    }
}

impl From<u8> for LocalLinkType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::DescriptorProdString,
            0x01 => Self::DescriptorUserString,
            0x0F => Self::DescriptorRole,
            0x80 => Self::DescriptorPVersion,
            0x81 => Self::NodeUnavailable,
            0x82 => Self::NodeAvailable,
            0xFC => Self::PairingRequest,
            0xFD => Self::StatusUnpaired,
            0xFE => Self::StatusPaired,
            0xFF => Self::DescriptorUid,
            other => Self::Unknown(other),
        }
    }
}

/// A single BiDiB frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidibFrame {
    /// Address stack without the terminating zero
    pub address: Vec<u8>,

    /// Message sequence number
    pub number: u8,

    /// Raw message type
    pub message_type: u8,

    /// Message data
    pub data: Bytes,
}

impl BidibFrame {
    /// Smallest valid frame: length, terminator, number, type
    pub const MIN_FRAME_SIZE: usize = 4;

    /// Create a local (interface addressed, unnumbered) frame
    pub fn local(message_type: MessageType, data: Vec<u8>) -> Self {
        Self {
            address: Vec::new(),
            number: 0,
            message_type: message_type as u8,
            data: Bytes::from(data),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let length = self.address.len() + 3 + self.data.len();
        let mut buf = BytesMut::with_capacity(length + 1);

        buf.put_u8(u8::try_from(length).unwrap_or(u8::MAX));
        buf.put_slice(&self.address);
        buf.put_u8(0);
        buf.put_u8(self.number);
        buf.put_u8(self.message_type);
        buf.put_slice(&self.data);

        buf
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < Self::MIN_FRAME_SIZE {
            return Err(NetBidibError::MessageTooShort);
        }

        let length = buf.get_u8() as usize;
        if length > buf.remaining() || length < Self::MIN_FRAME_SIZE - 1 {
            return Err(NetBidibError::InvalidLength(length));
        }
        buf.truncate(length);

        let mut address = Vec::new();
        loop {
            if !buf.has_remaining() {
                return Err(NetBidibError::MessageTooShort);
            }
            match buf.get_u8() {
                0 => break,
                byte if address.len() < MAX_ADDRESS_DEPTH => address.push(byte),
                _ => return Err(NetBidibError::InvalidLength(length)),
            }
        }

        if buf.remaining() < 2 {
            return Err(NetBidibError::MessageTooShort);
        }
        let number = buf.get_u8();
        let message_type = buf.get_u8();

        Ok(Self {
            address,
            number,
            message_type,
            data: buf,
        })
    }
}

/// Split a byte stream chunk into self-delimited frames.
///
/// A trailing frame whose length byte points past the end of `data` is
/// dropped.
pub fn split_frames(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let end = offset + data[offset] as usize + 1;
        if end > data.len() {
            log::warn!(
                "Dropping truncated frame: {}",
                data_string(&data[offset..])
            );
            break;
        }
        frames.push(&data[offset..end]);
        offset = end;
    }

    frames
}

/// Reassembles frames from a byte stream read in arbitrary chunks.
///
/// Bytes of an incomplete trailing frame stay buffered until the rest of
/// the frame arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and take every frame completed by it
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(&length) = self.pending.first() {
            let end = length as usize + 1;
            if self.pending.len() < end {
                break;
            }
            frames.push(self.pending.split_to(end).freeze());
        }
        frames
    }

    /// Remove and return the buffered bytes
    pub fn take(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of buffered bytes
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Hex representation used in message logs
pub fn data_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_uid(data: &[u8]) -> Option<UniqueId> {
    data.get(..7)?.try_into().ok()
}

fn string_bytes(value: &str) -> &[u8] {
    let bytes = value.as_bytes();
    &bytes[..bytes.len().min(MAX_STRING_LENGTH)]
}

/// Local link message as received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLinkMessage {
    pub link_type: LocalLinkType,

    /// Payload after the link type; string descriptors without length prefix
    pub data: Vec<u8>,
}

impl LocalLinkMessage {
    /// Payload interpreted as a string
    pub fn string_value(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_end_matches('\0')
            .to_string()
    }
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMessage {
    ProtocolSignature { emitter: String },
    LocalLink(LocalLinkMessage),
    LocalLogon { uid: UniqueId },
    LocalLogoff { uid: Option<UniqueId> },
    LocalLogonAck { node_address: u8, uid: Option<UniqueId> },
    Unknown { message_type: u8, data: Bytes },
}

impl InputMessage {
    /// Decode a single frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let frame = BidibFrame::decode(Bytes::copy_from_slice(frame))?;
        let data = frame.data;

        let message = match MessageType::from_u8(frame.message_type) {
            Some(MessageType::LocalProtocolSignature | MessageType::LocalProtocolSignatureUp) => {
                Self::ProtocolSignature {
                    emitter: String::from_utf8_lossy(&data).to_string(),
                }
            }
            Some(MessageType::LocalLink | MessageType::LocalLinkUp) => {
                let (&code, payload) = data.split_first().ok_or(NetBidibError::MessageTooShort)?;
                let link_type = LocalLinkType::from(code);
                let data = if link_type.is_string_descriptor() {
                    match payload.split_first() {
                        Some((&length, chars)) => chars[..chars.len().min(length as usize)].to_vec(),
                        None => Vec::new(),
                    }
                } else {
                    payload.to_vec()
                };
                Self::LocalLink(LocalLinkMessage { link_type, data })
            }
            Some(MessageType::LocalLogon) => Self::LocalLogon {
                uid: read_uid(&data).ok_or(NetBidibError::MessageTooShort)?,
            },
            Some(MessageType::LocalLogoff) => Self::LocalLogoff {
                uid: read_uid(&data),
            },
            Some(MessageType::LocalLogonAck) => {
                let (&node_address, uid) =
                    data.split_first().ok_or(NetBidibError::MessageTooShort)?;
                Self::LocalLogonAck {
                    node_address,
                    uid: read_uid(uid),
                }
            }
            Some(MessageType::LocalLogonRejected) | None => Self::Unknown {
                message_type: frame.message_type,
                data,
            },
        };

        Ok(message)
    }
}

/// Outbound message produced by the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMessage {
    ProtocolSignature { emitter: String },
    /// String descriptors hold the raw string; the length prefix is added on encode
    LocalLink { link_type: LocalLinkType, data: Vec<u8> },
    LocalLogon { uid: UniqueId },
    LocalLogonAck { node_address: u8, uid: UniqueId },
    LocalLogonRejected { uid: UniqueId },
}

impl OutputMessage {
    pub fn link(link_type: LocalLinkType, data: impl Into<Vec<u8>>) -> Self {
        Self::LocalLink {
            link_type,
            data: data.into(),
        }
    }

    /// Link type of a local link message
    pub fn link_type(&self) -> Option<LocalLinkType> {
        match self {
            Self::LocalLink { link_type, .. } => Some(*link_type),
            _ => None,
        }
    }

    /// Timeout byte carried by a pairing request
    pub fn pairing_timeout(&self) -> Option<u8> {
        match self {
            Self::LocalLink {
                link_type: LocalLinkType::PairingRequest,
                data,
            } => data.get(14).copied(),
            _ => None,
        }
    }

    /// Build the wire frame
    pub fn to_frame(&self) -> BidibFrame {
        match self {
            Self::ProtocolSignature { emitter } => BidibFrame::local(
                MessageType::LocalProtocolSignature,
                string_bytes(emitter).to_vec(),
            ),
            Self::LocalLink { link_type, data } => {
                let mut payload = Vec::with_capacity(data.len() + 2);
                payload.push(link_type.code());
                if link_type.is_string_descriptor() {
                    let chars = &data[..data.len().min(MAX_STRING_LENGTH)];
                    payload.push(chars.len() as u8);
                    payload.extend_from_slice(chars);
                } else {
                    payload.extend_from_slice(data);
                }
                BidibFrame::local(MessageType::LocalLink, payload)
            }
            Self::LocalLogon { uid } => BidibFrame::local(MessageType::LocalLogon, uid.to_vec()),
            Self::LocalLogonAck { node_address, uid } => {
                let mut payload = Vec::with_capacity(8);
                payload.push(*node_address);
                payload.extend_from_slice(uid);
                BidibFrame::local(MessageType::LocalLogonAck, payload)
            }
            Self::LocalLogonRejected { uid } => {
                BidibFrame::local(MessageType::LocalLogonRejected, uid.to_vec())
            }
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> BytesMut {
        self.to_frame().encode()
    }
}

/// Encode a string for a descriptor payload
pub(crate) fn descriptor_string(value: &str) -> Vec<u8> {
    string_bytes(value).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_descriptor_uid() {
        let bytes = [0x0B, 0x00, 0x00, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 1];
        let message = InputMessage::decode(&bytes).unwrap();

        assert_eq!(
            message,
            InputMessage::LocalLink(LocalLinkMessage {
                link_type: LocalLinkType::DescriptorUid,
                data: vec![0, 0, 0, 0, 0, 0, 1],
            })
        );
    }

    #[test]
    fn test_decode_string_descriptor_strips_length() {
        let bytes = [0x08, 0x00, 0x00, 0xFF, 0x00, 0x03, 0x31, 0x41, 0x51];
        let InputMessage::LocalLink(link) = InputMessage::decode(&bytes).unwrap() else {
            panic!("expected local link message");
        };

        assert_eq!(link.link_type, LocalLinkType::DescriptorProdString);
        assert_eq!(link.string_value(), "1AQ");
    }

    #[test]
    fn test_encode_protocol_signature() {
        let message = OutputMessage::ProtocolSignature {
            emitter: "BiDiB".to_string(),
        };
        let encoded = message.encode();

        assert_eq!(
            &encoded[..],
            &[0x08, 0x00, 0x00, 0x7E, b'B', b'i', b'D', b'i', b'B']
        );
    }

    #[test]
    fn test_encode_string_descriptor_adds_length() {
        let message = OutputMessage::link(LocalLinkType::DescriptorUserString, "ABC");
        assert_eq!(
            &message.encode()[..],
            &[0x08, 0x00, 0x00, 0x7F, 0x01, 0x03, b'A', b'B', b'C']
        );
    }

    #[test]
    fn test_decode_logon_ack() {
        let message = OutputMessage::LocalLogonAck {
            node_address: 2,
            uid: [0, 0, 0, 0, 0, 0, 1],
        };
        let decoded = InputMessage::decode(&message.encode()).unwrap();

        assert_eq!(
            decoded,
            InputMessage::LocalLogonAck {
                node_address: 2,
                uid: Some([0, 0, 0, 0, 0, 0, 1]),
            }
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let bytes = [0x03, 0x00, 0x00, 0xB2];
        let message = InputMessage::decode(&bytes).unwrap();
        assert!(matches!(
            message,
            InputMessage::Unknown {
                message_type: 0xB2,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let bytes = [0x09, 0x00, 0x00, 0xFF];
        assert!(matches!(
            BidibFrame::decode(Bytes::copy_from_slice(&bytes)),
            Err(NetBidibError::InvalidLength(9))
        ));
        assert!(matches!(
            InputMessage::decode(&[0x01, 0x00]),
            Err(NetBidibError::MessageTooShort)
        ));
    }

    #[test]
    fn test_decode_logon_requires_uid() {
        let bytes = [0x03, 0x00, 0x00, 0xEF];
        assert!(matches!(
            InputMessage::decode(&bytes),
            Err(NetBidibError::MessageTooShort)
        ));
    }

    #[test]
    fn test_split_back_to_back_frames() {
        let mut data = OutputMessage::LocalLogon {
            uid: [1, 2, 3, 4, 5, 6, 7],
        }
        .encode();
        data.extend_from_slice(&[0x03, 0x00, 0x00, 0xF1]);

        let frames = split_frames(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 11);
        assert_eq!(frames[1], &[0x03, 0x00, 0x00, 0xF1]);
    }

    #[test]
    fn test_split_drops_truncated_tail() {
        let data = [0x03, 0x00, 0x00, 0xF1, 0x0A, 0x00, 0x00];
        let frames = split_frames(&data);
        assert_eq!(frames, vec![&data[..4]]);
    }

    #[test]
    fn test_frame_buffer_joins_split_frame() {
        let signature = OutputMessage::ProtocolSignature {
            emitter: "BiDiB-Peer".to_string(),
        }
        .encode();
        let mut buffer = FrameBuffer::new();

        assert!(buffer.push(&signature[..5]).is_empty());
        assert_eq!(buffer.pending(), 5);

        let mut rest = signature[5..].to_vec();
        rest.extend_from_slice(&[0x03, 0x00]);
        let frames = buffer.push(&rest);
        assert_eq!(frames, vec![signature.freeze()]);
        assert_eq!(buffer.pending(), 2);

        assert_eq!(&buffer.take()[..], &[0x03, 0x00]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_pairing_timeout_accessor() {
        let mut data = vec![0u8; 14];
        data.push(30);
        let message = OutputMessage::link(LocalLinkType::PairingRequest, data);
        assert_eq!(message.pairing_timeout(), Some(30));
        assert_eq!(
            OutputMessage::link(LocalLinkType::StatusPaired, vec![0u8; 14]).pairing_timeout(),
            None
        );
    }

    #[test]
    fn test_data_string() {
        assert_eq!(data_string(&[0x0A, 0x00, 0xFF]), "0A 00 FF");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_recovers_every_frame(payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..40), 1..8)
            ) {
                let mut stream = Vec::new();
                for payload in &payloads {
                    stream.extend_from_slice(
                        &BidibFrame::local(MessageType::LocalLink, payload.clone()).encode(),
                    );
                }

                let frames = split_frames(&stream);
                prop_assert_eq!(frames.len(), payloads.len());
                for (frame, payload) in frames.iter().zip(&payloads) {
                    let decoded = BidibFrame::decode(Bytes::copy_from_slice(frame)).unwrap();
                    prop_assert_eq!(&decoded.data[..], &payload[..]);
                }
            }

            #[test]
            fn frame_buffer_is_independent_of_chunking(
                payloads in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..40), 1..8),
                cut in any::<prop::sample::Index>(),
            ) {
                let mut stream = Vec::new();
                for payload in &payloads {
                    stream.extend_from_slice(
                        &BidibFrame::local(MessageType::LocalLink, payload.clone()).encode(),
                    );
                }
                let cut = cut.index(stream.len());

                let mut buffer = FrameBuffer::new();
                let mut frames = buffer.push(&stream[..cut]);
                frames.extend(buffer.push(&stream[cut..]));

                prop_assert_eq!(frames.len(), payloads.len());
                prop_assert_eq!(buffer.pending(), 0);
                let joined: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();
                prop_assert_eq!(joined, stream);
            }
        }
    }
}
