//! Message framing.
//!
//! A logical message is carried as a sequence of frames, each a 4-byte
//! big-endian length followed by that many payload bytes, terminated by a
//! frame of length zero:
//!
//! ```text
//! +----------+---------+----------+---------+-----+----------+
//! | len (u32)| payload | len (u32)| payload | ... | 00 00 00 00 |
//! +----------+---------+----------+---------+-----+----------+
//! ```
//!
//! The encoder splits a message into frames of at most `frame_size` bytes;
//! the decoder reassembles them and rejects trailing bytes at end of
//! stream.

use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Splits logical messages into length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    frame_size: usize,
}

impl FrameEncoder {
    /// Creates an encoder emitting frames of at most `frame_size` payload
    /// bytes. A zero frame size is rejected.
    pub fn new(frame_size: usize) -> Result<Self, ProtocolError> {
        if frame_size == 0 {
            return Err(ProtocolError::InvalidFrameSize(frame_size));
        }
        Ok(Self { frame_size })
    }

    /// Returns the configured frame size.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encodes one message as a framed byte sequence.
    ///
    /// An empty message encodes to just the zero-length terminator.
    pub fn encode(&self, message: &[u8]) -> BytesMut {
        let frames = message.len().div_ceil(self.frame_size);
        let mut buf =
            BytesMut::with_capacity(message.len() + (frames + 1) * LENGTH_PREFIX_SIZE);
        for chunk in message.chunks(self.frame_size) {
            buf.put_u32(chunk.len() as u32);
            buf.put_slice(chunk);
        }
        buf.put_u32(0);
        buf
    }
}

/// Reassembles framed messages from an incoming byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    parts: Vec<Bytes>,
    pending_len: usize,
    yielded: bool,
    strict: bool,
    max_message_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            parts: Vec::new(),
            pending_len: 0,
            yielded: false,
            strict: false,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Creates a decoder that treats a stream yielding no message at all
    /// as an error at [`finish`](Self::finish).
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Overrides the maximum reassembled message size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Appends raw bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered, including any
    /// partially assembled message.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.pending_len
    }

    /// Attempts to reassemble the next complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode_message(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if self.buffer.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if self.pending_len + len > self.max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: self.pending_len + len,
                    max: self.max_message_size,
                });
            }
            if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
                return Ok(None);
            }

            self.buffer.advance(LENGTH_PREFIX_SIZE);
            if len == 0 {
                let message = self.take_message();
                self.yielded = true;
                return Ok(Some(message));
            }
            let part = self.buffer.split_to(len).freeze();
            self.pending_len += part.len();
            self.parts.push(part);
        }
    }

    /// Validates end-of-stream conditions.
    ///
    /// Trailing bytes or an unterminated partial message are an
    /// [`ProtocolError::UnexpectedEndOfStream`]; so is a strict decoder
    /// whose stream produced no message at all.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if !self.buffer.is_empty() || !self.parts.is_empty() {
            return Err(ProtocolError::UnexpectedEndOfStream);
        }
        if self.strict && !self.yielded {
            return Err(ProtocolError::UnexpectedEndOfStream);
        }
        Ok(())
    }

    fn take_message(&mut self) -> Bytes {
        self.pending_len = 0;
        match self.parts.len() {
            0 => Bytes::new(),
            1 => self.parts.pop().unwrap_or_default(),
            _ => {
                let total: usize = self.parts.iter().map(|p| p.len()).sum();
                let mut buf = BytesMut::with_capacity(total);
                for part in self.parts.drain(..) {
                    buf.extend_from_slice(&part);
                }
                buf.freeze()
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(messages: &[&[u8]], frame_size: usize) {
        let encoder = FrameEncoder::new(frame_size).unwrap();
        let mut decoder = FrameDecoder::new();
        for message in messages {
            decoder.extend(&encoder.encode(message));
        }
        for message in messages {
            let decoded = decoder.decode_message().unwrap().unwrap();
            assert_eq!(&decoded[..], *message);
        }
        assert!(decoder.decode_message().unwrap().is_none());
        decoder.finish().unwrap();
    }

    #[test]
    fn test_encode_single_frame() {
        let encoder = FrameEncoder::new(64).unwrap();
        assert_eq!(
            &encoder.encode(&[0, 1])[..],
            &[0, 0, 0, 2, 0, 1, 0, 0, 0, 0]
        );
        assert_eq!(&encoder.encode(&[2])[..], &[0, 0, 0, 1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_short_frame_size() {
        let encoder = FrameEncoder::new(2).unwrap();
        assert_eq!(
            &encoder.encode(&[0, 1, 2])[..],
            &[0, 0, 0, 2, 0, 1, 0, 0, 0, 1, 2, 0, 0, 0, 0]
        );
        assert_eq!(&encoder.encode(&[2])[..], &[0, 0, 0, 1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_zero_frame_size_rejected() {
        assert!(matches!(
            FrameEncoder::new(0),
            Err(ProtocolError::InvalidFrameSize(0))
        ));
    }

    #[test]
    fn test_roundtrip_assorted_frame_sizes() {
        let messages: &[&[u8]] = &[b"hello", b"", b"a much longer message body"];
        for frame_size in [1, 2, 3, 7, 64, 4096] {
            roundtrip(messages, frame_size);
        }
    }

    #[test]
    fn test_empty_message() {
        let encoder = FrameEncoder::new(16).unwrap();
        let framed = encoder.encode(b"");
        assert_eq!(&framed[..], &[0, 0, 0, 0]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&framed);
        let decoded = decoder.decode_message().unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_partial_input() {
        let encoder = FrameEncoder::new(4).unwrap();
        let framed = encoder.encode(b"abcdefgh");

        let mut decoder = FrameDecoder::new();
        for byte in framed.iter() {
            assert!(decoder.buffered() < framed.len());
            decoder.extend(&[*byte]);
        }
        let decoded = decoder.decode_message().unwrap().unwrap();
        assert_eq!(&decoded[..], b"abcdefgh");
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 2, 9, 9]);
        assert!(decoder.decode_message().unwrap().is_none());
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::UnexpectedEndOfStream)
        ));
    }

    #[test]
    fn test_unterminated_message_rejected() {
        // A complete frame but no zero terminator.
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 1, 7]);
        assert!(decoder.decode_message().unwrap().is_none());
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::UnexpectedEndOfStream)
        ));
    }

    #[test]
    fn test_strict_empty_stream() {
        let mut decoder = FrameDecoder::strict();
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::UnexpectedEndOfStream)
        ));

        let mut decoder = FrameDecoder::new();
        decoder.finish().unwrap();
    }

    #[test]
    fn test_strict_with_message_ok() {
        let encoder = FrameEncoder::new(8).unwrap();
        let mut decoder = FrameDecoder::strict();
        decoder.extend(&encoder.encode(b"x"));
        assert!(decoder.decode_message().unwrap().is_some());
        decoder.finish().unwrap();
    }

    #[test]
    fn test_message_too_large() {
        let mut decoder = FrameDecoder::new().with_max_message_size(4);
        decoder.extend(&[0, 0, 0, 8]);
        assert!(matches!(
            decoder.decode_message(),
            Err(ProtocolError::MessageTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_multiple_messages_in_one_read() {
        let encoder = FrameEncoder::new(3).unwrap();
        let mut bytes = encoder.encode(b"first");
        bytes.extend_from_slice(&encoder.encode(b"second"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(&decoder.decode_message().unwrap().unwrap()[..], b"first");
        assert_eq!(&decoder.decode_message().unwrap().unwrap()[..], b"second");
        assert!(decoder.decode_message().unwrap().is_none());
    }
}
