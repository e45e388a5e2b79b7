//! # Frame Codec
//!
//! Length-prefixed framing for encrypted blobs:
//!
//! ```text
//! [Length: i32 LE (4)] [Ciphertext (Length bytes)]
//! ```
//!
//! The codec knows nothing about encryption or message types; it only cuts the
//! byte stream into frames. Reassembly across arbitrary TCP segment boundaries is
//! handled by `FramedRead`, which keeps feeding bytes until `decode` yields a
//! whole frame.
//!
//! ## Security
//! The declared length is checked against `max_frame_size` before a single byte
//! of the body is reserved, so a hostile peer cannot force large allocations.

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single encrypted frame (20 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 20 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Parse and validate a length prefix.
    pub fn parse_length(&self, header: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
        let declared = i32::from_le_bytes(header);
        let len = usize::try_from(declared).map_err(|_| {
            warn!(declared, "{}", constants::ERR_NEGATIVE_LENGTH);
            ProtocolError::InvalidHeader
        })?;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        Ok(len)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_PREFIX_SIZE];
        header.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let len = self.parse_length(header)?;

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TransportError(
                constants::ERR_CLOSED_MID_FRAME.into(),
            )),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&[u8]>::encode(self, frame.as_ref(), dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &[u8], dst: &mut BytesMut) -> Result<()> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(frame.len()));
        }
        let len =
            i32::try_from(frame.len()).map_err(|_| ProtocolError::OversizedPacket(frame.len()))?;
        dst.reserve(LENGTH_PREFIX_SIZE + frame.len());
        dst.put_i32_le(len);
        dst.put_slice(frame);
        Ok(())
    }
}
