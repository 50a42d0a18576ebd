use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Reports how many bytes a value would occupy on the wire, without
/// actually encoding it. Implementations must be cheap and exact: callers
/// size a buffer once from this and then call `marshal_to` into it.
pub trait MarshalSize {
    fn marshal_size(&self) -> usize;
}

/// Encodes a value into a wire buffer. Implementors of `Marshal` are also
/// `MarshalSize` so callers can size the destination buffer up front.
pub trait Marshal: MarshalSize {
    /// Writes the encoded form into `buf`, returning the number of bytes
    /// written. `buf` must be at least `marshal_size()` bytes.
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize>;

    /// Convenience wrapper that allocates a correctly sized buffer.
    fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(self.marshal_size());
        let n = self.marshal_to(&mut buf)?;
        buf.truncate(n);
        Ok(buf.freeze())
    }
}

/// Decodes a value from a wire buffer. `B` is left positioned just past the
/// consumed bytes, the same convention `bytes::Buf` cursors already follow.
pub trait Unmarshal {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf;
}

pub(crate) fn require_remaining<B: Buf>(buf: &B, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::ErrBufferShort);
    }
    Ok(())
}
