use super::*;
use shared::error::Result;

pub(crate) const MESSAGE_TYPE_LEN: usize = 1;

/// DCEP message type octet, draft-ietf-rtcweb-data-protocol-09 §8.1.
/// `DataChannelClose`/`DataChannelLowThreshold` aren't wire types the
/// protocol defines; they're reused internally to round-trip stream-reset
/// and buffered-amount-low notifications through the same `Message` enum.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum MessageType {
    DataChannelAck,
    DataChannelOpen,
    DataChannelClose,        // internal usage only
    DataChannelLowThreshold, // internal usage only
}

const DATA_CHANNEL_ACK: u8 = 0x02;
const DATA_CHANNEL_OPEN: u8 = 0x03;
const DATA_CHANNEL_CLOSE: u8 = 0xfe;
const DATA_CHANNEL_LOW_THRESHOLD: u8 = 0xff;

impl MarshalSize for MessageType {
    fn marshal_size(&self) -> usize {
        MESSAGE_TYPE_LEN
    }
}

impl Marshal for MessageType {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let b = match self {
            MessageType::DataChannelAck => DATA_CHANNEL_ACK,
            MessageType::DataChannelOpen => DATA_CHANNEL_OPEN,
            MessageType::DataChannelClose => DATA_CHANNEL_CLOSE,
            MessageType::DataChannelLowThreshold => DATA_CHANNEL_LOW_THRESHOLD,
        };
        buf.put_u8(b);
        Ok(MESSAGE_TYPE_LEN)
    }
}

impl Unmarshal for MessageType {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let b = buf.get_u8();
        match b {
            DATA_CHANNEL_ACK => Ok(MessageType::DataChannelAck),
            DATA_CHANNEL_OPEN => Ok(MessageType::DataChannelOpen),
            DATA_CHANNEL_CLOSE => Ok(MessageType::DataChannelClose),
            DATA_CHANNEL_LOW_THRESHOLD => Ok(MessageType::DataChannelLowThreshold),
            other => Err(Error::InvalidMessageType(other)),
        }
    }
}
