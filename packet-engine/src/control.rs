//! Control messages carried on channel 0.
//!
//! Channel 0 is reserved for the open exchange, acknowledgements and close
//! notifications. A control packet always has `chan_id == 0` and the
//! [`flags::CONTROL`](crate::packet::flags::CONTROL) bit set. Its header
//! `seq_num` carries the message kind and its payload is exactly
//! [`CONTROL_LEN`] bytes:
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Target Channel Id                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Arg0              |             Arg1              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! | kind | message      | arg0             | arg1                  |
//! |------|--------------|------------------|-----------------------|
//! | 1    | CLIENT_HELLO | window           | mtu                   |
//! | 2    | SERVER_HELLO | window           | mtu                   |
//! | 3    | CLIENT_ACK   | 0                | 0                     |
//! | 4    | ACK          | acknowledged seq | next expected seq     |
//! | 5    | CLOSE        | reason code      | 0                     |
//!
//! Eight bytes keep the smallest usable MTU at 24.

use crate::error::{CloseReason, PacketError};

/// Payload length of every control message.
pub const CONTROL_LEN: usize = 8;

const KIND_CLIENT_HELLO: u16 = 1;
const KIND_SERVER_HELLO: u16 = 2;
const KIND_CLIENT_ACK: u16 = 3;
const KIND_ACK: u16 = 4;
const KIND_CLOSE: u16 = 5;

/// One decoded channel-0 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client proposes a new channel.
    ClientHello { chan_id: u32, window: u16, mtu: u16 },
    /// Server accepts and states its own limits.
    ServerHello { chan_id: u32, window: u16, mtu: u16 },
    /// Client confirms it saw SERVER_HELLO.
    ClientAck { chan_id: u32 },
    /// Data acknowledgement: `seq` arrived; everything before `cumulative`
    /// has arrived.
    Ack { chan_id: u32, seq: u16, cumulative: u16 },
    /// Channel is gone on the sender's side.
    Close { chan_id: u32, reason: CloseReason },
}

impl ControlMessage {
    /// Channel the message is about.
    pub fn chan_id(&self) -> u32 {
        match *self {
            Self::ClientHello { chan_id, .. }
            | Self::ServerHello { chan_id, .. }
            | Self::ClientAck { chan_id }
            | Self::Ack { chan_id, .. }
            | Self::Close { chan_id, .. } => chan_id,
        }
    }

    /// Value for the header `seq_num` field.
    pub fn kind(&self) -> u16 {
        match self {
            Self::ClientHello { .. } => KIND_CLIENT_HELLO,
            Self::ServerHello { .. } => KIND_SERVER_HELLO,
            Self::ClientAck { .. } => KIND_CLIENT_ACK,
            Self::Ack { .. } => KIND_ACK,
            Self::Close { .. } => KIND_CLOSE,
        }
    }

    /// Serialise the payload.
    pub fn encode(&self) -> [u8; CONTROL_LEN] {
        let (arg0, arg1) = match *self {
            Self::ClientHello { window, mtu, .. } | Self::ServerHello { window, mtu, .. } => {
                (window, mtu)
            }
            Self::ClientAck { .. } => (0, 0),
            Self::Ack { seq, cumulative, .. } => (seq, cumulative),
            Self::Close { reason, .. } => (reason.to_wire(), 0),
        };
        let mut buf = [0u8; CONTROL_LEN];
        buf[0..4].copy_from_slice(&self.chan_id().to_le_bytes());
        buf[4..6].copy_from_slice(&arg0.to_le_bytes());
        buf[6..8].copy_from_slice(&arg1.to_le_bytes());
        buf
    }

    /// Parse a control payload given the header `seq_num` (the kind).
    pub fn decode(kind: u16, payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() != CONTROL_LEN {
            return Err(PacketError::BadFormat(payload.len()));
        }
        let chan_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let arg0 = u16::from_le_bytes([payload[4], payload[5]]);
        let arg1 = u16::from_le_bytes([payload[6], payload[7]]);
        if chan_id == 0 {
            return Err(PacketError::BadFormat(payload.len()));
        }
        let msg = match kind {
            KIND_CLIENT_HELLO => Self::ClientHello { chan_id, window: arg0, mtu: arg1 },
            KIND_SERVER_HELLO => Self::ServerHello { chan_id, window: arg0, mtu: arg1 },
            KIND_CLIENT_ACK => Self::ClientAck { chan_id },
            KIND_ACK => Self::Ack { chan_id, seq: arg0, cumulative: arg1 },
            KIND_CLOSE => Self::Close { chan_id, reason: CloseReason::from_wire(arg0) },
            _ => return Err(PacketError::BadFormat(payload.len())),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_layout() {
        let msg = ControlMessage::ClientHello { chan_id: 0x0A0B_0C0D, window: 16, mtu: 1472 };
        let buf = msg.encode();
        assert_eq!(msg.kind(), 1);
        assert_eq!(&buf[0..4], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 16);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 1472);
        assert_eq!(ControlMessage::decode(msg.kind(), &buf), Ok(msg));
    }

    #[test]
    fn ack_and_close_decode() {
        let ack = ControlMessage::Ack { chan_id: 7, seq: 65535, cumulative: 0 };
        assert_eq!(ControlMessage::decode(ack.kind(), &ack.encode()), Ok(ack));

        let close = ControlMessage::Close { chan_id: 7, reason: CloseReason::NoResponseToAllRetries };
        assert_eq!(ControlMessage::decode(close.kind(), &close.encode()), Ok(close));
    }

    #[test]
    fn unknown_kind_is_bad_format() {
        let buf = ControlMessage::ClientAck { chan_id: 1 }.encode();
        assert_eq!(ControlMessage::decode(99, &buf), Err(PacketError::BadFormat(CONTROL_LEN)));
    }

    #[test]
    fn wrong_length_or_zero_channel_is_bad_format() {
        assert!(ControlMessage::decode(KIND_ACK, &[0u8; 7]).is_err());
        assert!(ControlMessage::decode(KIND_ACK, &[0u8; CONTROL_LEN]).is_err());
    }
}
