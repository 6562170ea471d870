//! Length-delimited protobuf framing for byte streams such as log files.
//!
//! Every frame is a varint length prefix (prost's length-delimited format) followed by the encoded
//! message. A configurable maximum frame size bounds the memory a corrupted prefix can claim.

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;

use std::marker::PhantomData;

use prost::Message;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {length} exceeds the maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Clone)]
pub struct ProstFrameCodec<T> {
    /// Maximum permitted number of bytes per message.
    max_message_len_bytes: usize,
    _marker: PhantomData<T>,
}

impl<T: Message + Default> ProstFrameCodec<T> {
    pub fn new(max_message_len_bytes: usize) -> Self {
        Self { max_message_len_bytes, _marker: PhantomData }
    }

    pub fn encode(&self, message: &T) -> Vec<u8> {
        message.encode_length_delimited_to_vec()
    }

    /// Decodes the first frame of `src`.
    ///
    /// Returns `Ok(None)` when `src` holds an incomplete frame, otherwise the message and the
    /// number of bytes it occupied.
    pub fn decode(&self, src: &[u8]) -> Result<Option<(T, usize)>, FrameError> {
        let mut cursor = src;
        let length = match prost::decode_length_delimiter(&mut cursor) {
            Ok(length) => length,
            // A varint cut short by the end of the buffer.
            Err(_) if src.len() < 10 && src.last().map_or(true, |byte| byte & 0x80 != 0) => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if length > self.max_message_len_bytes {
            return Err(FrameError::FrameTooLarge { length, max: self.max_message_len_bytes });
        }
        let prefix_len = src.len() - cursor.len();
        let total_len = prefix_len + length;
        if src.len() < total_len {
            return Ok(None);
        }
        let message = T::decode(&src[prefix_len..total_len])?;
        Ok(Some((message, total_len)))
    }
}
