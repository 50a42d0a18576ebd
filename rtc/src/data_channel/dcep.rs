//! DCEP -- the in-band data channel establishment protocol (spec §4.7/§6).
//!
//! Carried as Control-kind [`crate::message::Message`]s on the channel's own
//! stream. OPEN/ACK reuse `rtc-datachannel`'s existing wire codec for the
//! struct layout; CLOSE is never sent on the wire (a stream reset is the
//! signal, spec §4.7) so it's represented here only as the single byte the
//! SCTP transport synthesizes locally.

use datachannel::message::message_channel_open::{ChannelType, DataChannelOpen};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::{Error, Result};
use crate::reliability::Reliability;
use std::time::Duration;

pub const DCEP_ACK: u8 = 0x02;
pub const DCEP_OPEN: u8 = 0x03;
pub const DCEP_CLOSE: u8 = 0x04;

/// A parsed `OPEN` payload, generalized from [`DataChannelOpen`]'s raw
/// fields into the label/protocol/reliability shape the rest of this crate
/// works with.
#[derive(Debug, Clone)]
pub struct Open {
    pub reliability: Reliability,
    pub priority: u16,
    pub label: String,
    pub protocol: String,
}

fn channel_type_for(reliability: &Reliability) -> ChannelType {
    use ChannelType::*;
    match (reliability.max_retransmits.is_some(), reliability.max_packet_lifetime.is_some(), reliability.unordered) {
        (true, _, false) => PartialReliableRexmit,
        (true, _, true) => PartialReliableRexmitUnordered,
        (_, true, false) => PartialReliableTimed,
        (_, true, true) => PartialReliableTimedUnordered,
        (false, false, false) => Reliable,
        (false, false, true) => ReliableUnordered,
    }
}

fn reliability_for(channel_type: ChannelType, reliability_parameter: u32) -> Reliability {
    use ChannelType::*;
    match channel_type {
        Reliable => Reliability::reliable(),
        ReliableUnordered => Reliability::unordered(),
        PartialReliableRexmit => Reliability::with_max_retransmits(false, reliability_parameter),
        PartialReliableRexmitUnordered => Reliability::with_max_retransmits(true, reliability_parameter),
        PartialReliableTimed => {
            Reliability::with_max_packet_lifetime(false, Duration::from_millis(reliability_parameter as u64))
        }
        PartialReliableTimedUnordered => {
            Reliability::with_max_packet_lifetime(true, Duration::from_millis(reliability_parameter as u64))
        }
    }
}

impl Open {
    pub fn encode(&self) -> Vec<u8> {
        let reliability_parameter = self
            .reliability
            .max_retransmits
            .or(self.reliability.max_packet_lifetime.map(|d| d.as_millis() as u32))
            .unwrap_or(0);
        let open = DataChannelOpen {
            channel_type: channel_type_for(&self.reliability),
            priority: self.priority,
            reliability_parameter,
            label: self.label.clone().into_bytes(),
            protocol: self.protocol.clone().into_bytes(),
        };
        let mut buf = vec![0u8; open.marshal_size()];
        open.marshal_to(&mut buf).expect("buffer sized by marshal_size");
        buf
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        let open = DataChannelOpen::unmarshal(&mut payload)
            .map_err(|e| Error::protocol(format!("malformed DCEP OPEN: {e}")))?;
        Ok(Open {
            reliability: reliability_for(open.channel_type, open.reliability_parameter),
            priority: open.priority,
            label: String::from_utf8_lossy(&open.label).into_owned(),
            protocol: String::from_utf8_lossy(&open.protocol).into_owned(),
        })
    }
}

pub fn encode_ack() -> Vec<u8> {
    vec![DCEP_ACK]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trips_reliable_ordered() {
        let open = Open {
            reliability: Reliability::reliable(),
            priority: 0,
            label: "test".to_string(),
            protocol: String::new(),
        };
        let decoded = Open::decode(&open.encode()).unwrap();
        assert_eq!(decoded.label, "test");
        assert!(decoded.reliability.is_reliable());
        assert!(!decoded.reliability.unordered);
    }

    #[test]
    fn open_round_trips_unordered_max_retransmits() {
        let open = Open {
            reliability: Reliability::with_max_retransmits(true, 2),
            priority: 1,
            label: "unreliable_maxretransmits".to_string(),
            protocol: "proto".to_string(),
        };
        let decoded = Open::decode(&open.encode()).unwrap();
        assert_eq!(decoded.reliability.max_retransmits, Some(2));
        assert!(decoded.reliability.unordered);
        assert_eq!(decoded.protocol, "proto");
    }

    #[test]
    fn open_round_trips_unordered_max_packet_lifetime() {
        let open = Open {
            reliability: Reliability::with_max_packet_lifetime(true, Duration::from_millis(222)),
            priority: 0,
            label: "unreliable_maxpacketlifetime".to_string(),
            protocol: String::new(),
        };
        let decoded = Open::decode(&open.encode()).unwrap();
        assert_eq!(decoded.reliability.max_packet_lifetime, Some(Duration::from_millis(222)));
        assert!(decoded.reliability.unordered);
    }
}
