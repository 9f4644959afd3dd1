//! EOF-terminated frame codec.
//!
//! Each pipe open carries exactly one message, so there is no length prefix:
//! `decode` only buffers, and `decode_eof` parses whatever the writer sent
//! before closing. Works over any AsyncRead/AsyncWrite.

use std::marker::PhantomData;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Frame, FrameError};

/// Codec that turns typed messages into frames and back.
///
/// `T` is the message type for the direction in use; it converts to and from
/// [`Frame`].
pub struct MessageCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Decoder for MessageCodec<T>
where
    T: TryFrom<Frame, Error = FrameError>,
{
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, _src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Frames end at EOF only.
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let raw = src.split();
        tracing::trace!(frame_size_bytes = raw.len(), "Decoding frame");
        let frame = Frame::decode(&raw)?;
        T::try_from(frame).map(Some)
    }
}

impl<T> Encoder<T> for MessageCodec<T>
where
    T: Into<Frame>,
{
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame: Frame = item.into();
        let start = dst.len();
        frame.encode(dst)?;
        let frame_len = dst.len() - start;
        tracing::trace!(frame_size_bytes = frame_len, "Encoding frame");
        if frame_len > 1_000_000 {
            tracing::info!(
                frame_size_bytes = frame_len,
                frame_size_kb = frame_len / 1024,
                "Large frame being encoded"
            );
        }
        Ok(())
    }
}
