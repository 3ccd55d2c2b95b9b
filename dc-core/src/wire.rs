//! Framing: NMDC commands are `|`-terminated; after `$ADCSND` the stream carries raw bytes.

/// Command terminator.
pub const DELIMITER: u8 = b'|';

/// Longest command accepted before the peer is considered broken.
pub const MAX_FRAME_LEN: usize = 128 * 1024;

/// Encode one command: the text plus terminator.
pub fn encode_frame(command: &str, encoding: Encoding) -> Vec<u8> {
    let mut out = encoding.encode(command);
    out.push(DELIMITER);
    out
}

/// Decode one frame from the front of `bytes`. Returns the command bytes (without the
/// terminator) and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    match bytes.iter().position(|&b| b == DELIMITER) {
        Some(pos) if pos > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge),
        Some(pos) => Ok((&bytes[..pos], pos + 1)),
        None if bytes.len() > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge),
        None => Err(FrameDecodeError::NeedMore),
    }
}

/// Error decoding a frame (need more bytes or too large).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

/// Hub text encodings. NMDC hubs commonly use a single-byte Western codepage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// Something pulled out of a [`FrameBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    Command(Vec<u8>),
    Raw(Vec<u8>),
}

/// Receive buffer switching between command mode and a counted raw-data mode.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    raw_remaining: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// After this call the next `len` bytes are handed out as [`Chunk::Raw`].
    pub fn expect_raw(&mut self, len: u64) {
        self.raw_remaining = len;
    }

    pub fn raw_remaining(&self) -> u64 {
        self.raw_remaining
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next command or raw piece, `Ok(None)` if more bytes are needed.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, FrameDecodeError> {
        if self.raw_remaining > 0 {
            if self.buf.is_empty() {
                return Ok(None);
            }
            let take = (self.raw_remaining.min(self.buf.len() as u64)) as usize;
            let piece: Vec<u8> = self.buf.drain(..take).collect();
            self.raw_remaining -= take as u64;
            return Ok(Some(Chunk::Raw(piece)));
        }
        match decode_frame(&self.buf) {
            Ok((frame, consumed)) => {
                let frame = frame.to_vec();
                self.buf.drain(..consumed);
                Ok(Some(Chunk::Command(frame)))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
