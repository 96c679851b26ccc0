//! Binary wire codec for command frames.
//!
//! Layout of one frame on the byte stream:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┬──────────────────┐
//! │ body length: u32 │ command name: 7-bit-len    │ payload bytes    │
//! │ (little-endian)  │ prefixed UTF-8             │ (command-defined)│
//! └──────────────────┴───────────────────────────┴──────────────────┘
//! ```
//!
//! Scalars are little-endian and strings use a 7-bit variable-length prefix,
//! matching .NET `BinaryWriter`, so payloads interoperate with existing peers.

use thiserror::Error;

/// Size of the frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound for a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while decoding frames or payload fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Payload ended before a field was complete
    #[error("Unexpected end of payload: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// 7-bit length prefix longer than 5 bytes
    #[error("Malformed length prefix")]
    BadLengthPrefix,

    /// String field is not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Declared frame length exceeds the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Field decoded but its value is not acceptable
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Append-only payload writer.
#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    buf: Vec<u8>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a 7-bit encoded length followed by UTF-8 bytes.
    pub fn write_str(&mut self, value: &str) {
        self.write_7bit_len(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_uuid(&mut self, value: &uuid::Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Writes raw bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a u32-length-prefixed byte blob.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_7bit_len(&mut self, mut value: u32) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }
}

/// Cursor over a received payload.
#[derive(Debug, Clone)]
pub struct CommandReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CommandReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes already consumed.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < needed {
            return Err(WireError::UnexpectedEof {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidValue(format!("bool byte {}", other))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_7bit_len()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> Result<uuid::Uuid, WireError> {
        Ok(uuid::Uuid::from_bytes(self.take_array()?))
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Consumes and returns everything left.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn read_7bit_len(&mut self) -> Result<u32, WireError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::BadLengthPrefix)
    }
}

/// Builds one complete frame: length prefix, command name, payload.
pub fn encode_frame<F>(command: &str, write: F) -> Vec<u8>
where
    F: FnOnce(&mut CommandWriter),
{
    let mut body = CommandWriter::new();
    body.write_str(command);
    write(&mut body);
    let body = body.into_bytes();

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Splits a frame body into its command name and a reader over the payload.
pub fn split_command(body: &[u8]) -> Result<(String, CommandReader<'_>), WireError> {
    let mut reader = CommandReader::new(body);
    let command = reader.read_string()?;
    Ok((command, reader))
}

/// Reassembles frames from an arbitrarily chunked byte stream.
///
/// Bytes are buffered until a whole frame is available; no frame is ever
/// yielded from a partial read.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame body, if one is buffered.
    ///
    /// A length above the limit cannot be resynchronized, so the buffer is
    /// discarded and the error returned.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            self.buf.clear();
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let total = FRAME_HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[FRAME_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(body))
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_string_prefix_matches_binary_writer() {
        let mut writer = CommandWriter::new();
        writer.write_str("abc");
        assert_eq!(writer.into_bytes(), vec![3, b'a', b'b', b'c']);

        // 200 needs two prefix bytes: 0xC8 0x01
        let long = "x".repeat(200);
        let mut writer = CommandWriter::new();
        writer.write_str(&long);
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..2], &[0xC8, 0x01]);

        let mut reader = CommandReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), long);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_frame_not_dispatched_until_complete() {
        let frame = encode_frame("CoordinateFound", |w| w.write_str("0"));

        for split in 0..frame.len() {
            let mut decoder = FrameDecoder::default();
            decoder.push(&frame[..split]);
            assert!(decoder.next_frame().unwrap().is_none(), "split at {}", split);
            decoder.push(&frame[split..]);
            let frames = drain(&mut decoder);
            assert_eq!(frames.len(), 1);
            assert_eq!(decoder.buffered(), 0);

            let (command, mut reader) = split_command(&frames[0]).unwrap();
            assert_eq!(command, "CoordinateFound");
            assert_eq!(reader.read_string().unwrap(), "0");
        }
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = encode_frame("A", |w| w.write_i32(-7));
        bytes.extend(encode_frame("B", |_| {}));
        bytes.extend_from_slice(&encode_frame("C", |w| w.write_bool(true))[..3]);

        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(decoder.buffered(), 3);

        let (command, mut reader) = split_command(&frames[0]).unwrap();
        assert_eq!(command, "A");
        assert_eq!(reader.read_i32().unwrap(), -7);
        let (command, reader) = split_command(&frames[1]).unwrap();
        assert_eq!(command, "B");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_oversized_frame_is_rejected_and_buffer_discarded() {
        let mut decoder = FrameDecoder::new(8);
        decoder.push(&100u32.to_le_bytes());
        decoder.push(&[0u8; 16]);
        assert_eq!(
            decoder.next_frame(),
            Err(WireError::FrameTooLarge { len: 100, max: 8 })
        );
        assert_eq!(decoder.buffered(), 0);

        // Stream recovers for frames that follow
        decoder.push(&encode_frame("ok", |_| {}));
        assert_eq!(drain(&mut decoder).len(), 1);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = CommandReader::new(&[1, 2]);
        assert_eq!(
            reader.read_i32(),
            Err(WireError::UnexpectedEof { needed: 4, remaining: 2 })
        );

        let mut reader = CommandReader::new(&[5, b'a']);
        assert!(matches!(reader.read_string(), Err(WireError::UnexpectedEof { .. })));

        let mut reader = CommandReader::new(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert_eq!(reader.read_string(), Err(WireError::BadLengthPrefix));

        let mut reader = CommandReader::new(&[2]);
        assert!(matches!(reader.read_bool(), Err(WireError::InvalidValue(_))));
    }
}
