//! Minimal RTP header codec (RFC 3550 §5.1) backing the C11 pipeline.
//!
//! Only the fields the pipeline handlers actually inspect are exposed;
//! CSRC lists and header extensions beyond the one-byte TWCC tag are
//! carried through as opaque bytes rather than fully modeled.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

pub const VERSION: u8 = 2;

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// One-byte header extension value, if a TWCC (or similar) extension
    /// was stamped on this packet.
    pub extension: Option<(u8, u8)>,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn marshal(&self) -> Bytes {
        let has_ext = self.extension.is_some();
        let mut buf = BytesMut::with_capacity(12 + self.payload.len() + 8);
        let b0 = (VERSION << 6) | (u8::from(has_ext) << 4);
        buf.extend_from_slice(&[b0]);
        buf.extend_from_slice(&[(u8::from(self.marker) << 7) | (self.payload_type & 0x7f)]);
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        if let Some((id, value)) = self.extension {
            // One-byte header extension profile (RFC 8285), a single id/len=0/value element.
            buf.extend_from_slice(&0xBEDEu16.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&[(id << 4), value]);
        }
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::protocol("rtp packet shorter than fixed header"));
        }
        let version = data[0] >> 6;
        if version != VERSION {
            return Err(Error::protocol(format!("unsupported rtp version {version}")));
        }
        let has_ext = data[0] & 0x10 != 0;
        let cc = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let mut offset = 12 + cc * 4;
        if data.len() < offset {
            return Err(Error::protocol("rtp packet truncated in csrc list"));
        }
        let mut extension = None;
        if has_ext {
            if data.len() < offset + 4 {
                return Err(Error::protocol("rtp packet truncated in extension header"));
            }
            let ext_len_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let ext_start = offset + 4;
            let ext_total = ext_len_words * 4;
            if data.len() < ext_start + ext_total {
                return Err(Error::protocol("rtp packet truncated in extension data"));
            }
            if ext_total >= 2 {
                let id = data[ext_start] >> 4;
                let value = data[ext_start + 1];
                extension = Some((id, value));
            }
            offset = ext_start + ext_total;
        }
        let payload = Bytes::copy_from_slice(data.get(offset..).unwrap_or(&[]));
        Ok(RtpPacket {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            extension,
            payload,
        })
    }
}
