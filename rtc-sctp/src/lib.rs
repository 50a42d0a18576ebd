#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Embedded SCTP association engine. This crate is the wrapped collaborator
//! behind the data channel transport: it owns stream-sequence bookkeeping,
//! PPID tagging and the reliability policy (ordered delivery, retransmit
//! limit, lifetime), not general-purpose congestion control or multihoming.
//! Sans-IO, in the same style as the sibling `rtc-ice`/`rtc-dtls` engines:
//! callers drive it with `handle_read`/`poll_transmit`.

pub mod chunk;
pub mod shared;

pub use shared::AssociationId;

use bytes::Bytes;

/// Payload Protocol Identifier, RFC 8831 §8 / RFC 4960 registry. Tags every
/// outgoing DATA chunk so the receiver's application layer (DCEP vs. user
/// data, string vs. binary) can dispatch without out-of-band framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadProtocolIdentifier {
    Dcep,
    String,
    Binary,
    StringEmpty,
    BinaryEmpty,
    Unknown(u32),
}

impl PayloadProtocolIdentifier {
    pub fn value(&self) -> u32 {
        match self {
            PayloadProtocolIdentifier::Dcep => 50,
            PayloadProtocolIdentifier::String => 51,
            PayloadProtocolIdentifier::Binary => 53,
            PayloadProtocolIdentifier::StringEmpty => 56,
            PayloadProtocolIdentifier::BinaryEmpty => 57,
            PayloadProtocolIdentifier::Unknown(v) => *v,
        }
    }
}

impl Default for PayloadProtocolIdentifier {
    fn default() -> Self {
        PayloadProtocolIdentifier::Unknown(0)
    }
}

impl From<u32> for PayloadProtocolIdentifier {
    fn from(v: u32) -> Self {
        match v {
            50 => PayloadProtocolIdentifier::Dcep,
            51 => PayloadProtocolIdentifier::String,
            53 => PayloadProtocolIdentifier::Binary,
            56 => PayloadProtocolIdentifier::StringEmpty,
            57 => PayloadProtocolIdentifier::BinaryEmpty,
            v => PayloadProtocolIdentifier::Unknown(v),
        }
    }
}

/// Wire-level reliability policy for a stream, RFC 8831 §6.1's
/// `channel_type` byte split into a type plus the ordered bit. Distinct from
/// the crate-facing `Reliability` the `rtc` core exposes: this is the three
/// values the SCTP layer itself understands and maps the richer type onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityType {
    /// Reliable, possibly unordered, delivery.
    Reliable,
    /// Limited retransmissions: at most N retransmits per message.
    Rexmit,
    /// Limited lifetime: drop the message after a deadline.
    Timed,
}

impl Default for ReliabilityType {
    fn default() -> Self {
        ReliabilityType::Reliable
    }
}

/// A unit of data handed to/from an association: either a fully reassembled
/// user message, or a control/stream-reset notification. Kept as an enum
/// (rather than always-Bytes) because the wrapper layer needs to observe
/// reset and PPID-carried empty messages distinctly from payload data.
#[derive(Debug, Clone)]
pub enum Payload {
    Data {
        stream_id: u16,
        ppid: PayloadProtocolIdentifier,
        data: Bytes,
    },
    StreamReset {
        stream_id: u16,
    },
}
