//! Minimal on-wire chunk framing for the two chunk types the data channel
//! wrapper needs: DATA (carries PPID-tagged user payload) and a stream
//! reset notification analogous to RFC 6525's RE-CONFIG. Congestion
//! control, SACKs, and the full chunk type registry are out of scope: this
//! engine is driven point-to-point over an already-reliable DTLS channel,
//! so retransmission here is about ordering/lifetime policy, not loss
//! recovery.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::PayloadProtocolIdentifier;

const CHUNK_TYPE_DATA: u8 = 0;
const CHUNK_TYPE_RESET: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub payload: Bytes,
}

impl MarshalSize for DataChunk {
    fn marshal_size(&self) -> usize {
        1 + 1 + 2 + 2 + 4 + self.payload.len()
    }
}

impl Marshal for DataChunk {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = &mut buf[..];
        w.put_u8(CHUNK_TYPE_DATA);
        w.put_u8(if self.unordered { 1 } else { 0 });
        w.put_u16(self.stream_id);
        w.put_u16(self.stream_seq);
        w.put_u32(self.ppid);
        w.put_slice(&self.payload);
        Ok(self.marshal_size())
    }
}

impl Unmarshal for DataChunk {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < 10 {
            return Err(Error::ErrBufferShort);
        }
        let chunk_type = buf.get_u8();
        if chunk_type != CHUNK_TYPE_DATA {
            return Err(Error::Other(format!("not a DATA chunk: {chunk_type}")));
        }
        let unordered = buf.get_u8() != 0;
        let stream_id = buf.get_u16();
        let stream_seq = buf.get_u16();
        let ppid = buf.get_u32();
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(DataChunk {
            stream_id,
            stream_seq,
            ppid,
            unordered,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetChunk {
    pub stream_id: u16,
}

impl MarshalSize for ResetChunk {
    fn marshal_size(&self) -> usize {
        3
    }
}

impl Marshal for ResetChunk {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = &mut buf[..];
        w.put_u8(CHUNK_TYPE_RESET);
        w.put_u16(self.stream_id);
        Ok(self.marshal_size())
    }
}

impl Unmarshal for ResetChunk {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        if buf.remaining() < 3 {
            return Err(Error::ErrBufferShort);
        }
        let chunk_type = buf.get_u8();
        if chunk_type != CHUNK_TYPE_RESET {
            return Err(Error::Other(format!("not a RESET chunk: {chunk_type}")));
        }
        Ok(ResetChunk {
            stream_id: buf.get_u16(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Chunk {
    Data(DataChunk),
    Reset(ResetChunk),
}

impl Chunk {
    pub fn unmarshal(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::ErrBufferShort);
        }
        match buf[0] {
            CHUNK_TYPE_DATA => Ok(Chunk::Data(DataChunk::unmarshal(&mut buf)?)),
            CHUNK_TYPE_RESET => Ok(Chunk::Reset(ResetChunk::unmarshal(&mut buf)?)),
            t => Err(Error::Other(format!("unknown chunk type: {t}"))),
        }
    }

    pub fn marshal(&self) -> Result<Bytes> {
        match self {
            Chunk::Data(c) => c.marshal(),
            Chunk::Reset(c) => c.marshal(),
        }
    }
}

pub fn ppid_for_marshal(ppid: PayloadProtocolIdentifier) -> u32 {
    ppid.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_chunk() {
        let c = DataChunk {
            stream_id: 3,
            stream_seq: 7,
            ppid: PayloadProtocolIdentifier::Binary.value(),
            unordered: false,
            payload: Bytes::from_static(b"hello"),
        };
        let bytes = c.marshal().unwrap();
        let mut b = bytes.clone();
        let back = DataChunk::unmarshal(&mut b).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn round_trips_reset_chunk() {
        let c = ResetChunk { stream_id: 9 };
        let bytes = c.marshal().unwrap();
        let mut b = bytes.clone();
        let back = ResetChunk::unmarshal(&mut b).unwrap();
        assert_eq!(c, back);
    }
}
