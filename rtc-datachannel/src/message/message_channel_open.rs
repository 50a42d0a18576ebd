use super::*;
use shared::error::Result;

/// Reliability policy requested in a DATA_CHANNEL_OPEN message,
/// draft-ietf-rtcweb-data-protocol-09 §8.2.1. The high bit marks
/// unordered delivery; the low nibble selects the retransmit policy.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ChannelType {
    #[default]
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;

impl ChannelType {
    pub fn value(&self) -> u8 {
        match self {
            ChannelType::Reliable => CHANNEL_TYPE_RELIABLE,
            ChannelType::ReliableUnordered => CHANNEL_TYPE_RELIABLE_UNORDERED,
            ChannelType::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            ChannelType::PartialReliableRexmitUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED
            }
            ChannelType::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            ChannelType::PartialReliableTimedUnordered => {
                CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED
            }
        }
    }

    pub fn from_value(v: u8) -> Result<Self> {
        match v {
            CHANNEL_TYPE_RELIABLE => Ok(ChannelType::Reliable),
            CHANNEL_TYPE_RELIABLE_UNORDERED => Ok(ChannelType::ReliableUnordered),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Ok(ChannelType::PartialReliableRexmit),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED => {
                Ok(ChannelType::PartialReliableRexmitUnordered)
            }
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Ok(ChannelType::PartialReliableTimed),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED => {
                Ok(ChannelType::PartialReliableTimedUnordered)
            }
            other => Err(Error::Other(format!("invalid channel type: {other:#x}"))),
        }
    }
}

/// The data-part of a DATA_CHANNEL_OPEN message without the message type.
///
/// # Memory layout
///
/// ```plain
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///| Channel Type  |            Priority           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                    Reliability Parameter                     |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|         Label Length          |       Protocol Length        |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                             Label                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                            Protocol                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Vec<u8>,
    pub protocol: Vec<u8>,
}

impl MarshalSize for DataChannelOpen {
    fn marshal_size(&self) -> usize {
        1 + 2 + 4 + 2 + 2 + self.label.len() + self.protocol.len()
    }
}

impl Marshal for DataChannelOpen {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        buf.put_u8(self.channel_type.value());
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.put_slice(&self.label);
        buf.put_slice(&self.protocol);
        Ok(self.marshal_size())
    }
}

impl Unmarshal for DataChannelOpen {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < 9 {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: 9,
                actual: buf.remaining(),
            });
        }
        let channel_type = ChannelType::from_value(buf.get_u8())?;
        let priority = buf.get_u16();
        let reliability_parameter = buf.get_u32();
        let label_len = buf.get_u16() as usize;
        let protocol_len = buf.get_u16() as usize;
        if buf.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: buf.remaining(),
            });
        }
        let mut label = vec![0u8; label_len];
        buf.copy_to_slice(&mut label);
        let mut protocol = vec![0u8; protocol_len];
        buf.copy_to_slice(&mut protocol);

        Ok(DataChannelOpen {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }
}
