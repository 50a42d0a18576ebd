//! C1 — the typed byte buffer that flows through every transport and
//! handler chain in this crate (spec §3 "Message").

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::frameinfo::FrameInfo;
use crate::reliability::Reliability;

/// Tag distinguishing how a [`Message`]'s bytes should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    String,
    /// In-band control traffic (DCEP) that never reaches the user callback
    /// as a normal message.
    Control,
}

/// A byte buffer carrying direction/stream/reliability metadata as it moves
/// wire -> transport -> handler chain -> application, or the reverse.
///
/// `kind == String` implies the buffer is valid UTF-8; that invariant is
/// enforced at the API boundary (see [`Message::string`]), not on every
/// internal copy.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub buffer: Bytes,
    pub stream: u16,
    pub dscp: u8,
    pub reliability: Option<Reliability>,
    pub frame_info: Option<FrameInfo>,
}

impl Message {
    pub fn binary(buffer: impl Into<Bytes>, stream: u16) -> Self {
        Message {
            kind: MessageKind::Binary,
            buffer: buffer.into(),
            stream,
            dscp: 0,
            reliability: None,
            frame_info: None,
        }
    }

    /// Validates `s` is carried as-is (it already is, being a `String`) and
    /// tags the message so the receiver knows to treat the bytes as text.
    pub fn string(s: impl Into<String>, stream: u16) -> Self {
        let s = s.into();
        Message {
            kind: MessageKind::String,
            buffer: Bytes::from(s.into_bytes()),
            stream,
            dscp: 0,
            reliability: None,
            frame_info: None,
        }
    }

    pub fn control(buffer: impl Into<Bytes>, stream: u16) -> Self {
        Message {
            kind: MessageKind::Control,
            buffer: buffer.into(),
            stream,
            dscp: 0,
            reliability: None,
            frame_info: None,
        }
    }

    /// Returns the buffer as `&str`, validating UTF-8 at this boundary per
    /// the `kind == String` invariant.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.buffer)
            .map_err(|e| Error::protocol(format!("message is not valid utf-8: {e}")))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn with_dscp(mut self, dscp: u8) -> Self {
        self.dscp = dscp;
        self
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = Some(reliability);
        self
    }

    pub fn with_frame_info(mut self, frame_info: FrameInfo) -> Self {
        self.frame_info = Some(frame_info);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_as_utf8() {
        let m = Message::string("hello", 3);
        assert_eq!(m.kind, MessageKind::String);
        assert_eq!(m.as_str().unwrap(), "hello");
    }

    #[test]
    fn binary_rejects_as_str_on_invalid_utf8() {
        let m = Message::binary(vec![0xff, 0xfe], 1);
        assert!(m.as_str().is_err());
    }

    #[test]
    fn empty_message_is_empty() {
        let m = Message::binary(Vec::new(), 1);
        assert!(m.is_empty());
        assert_eq!(m.len(), 0);
    }
}
