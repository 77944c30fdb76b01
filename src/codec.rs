//! Length-prefixed framing for the local channel.
//!
//! Every message, in either direction, is a 4-byte big-endian length
//! followed by that many bytes of raw IP packet.

use crate::error::FrameError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 65_535;

/// Encodes `payload` as a single frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    validate_len(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn validate_len(len: usize) -> Result<(), FrameError> {
    match len {
        0 => Err(FrameError::Empty),
        n if n > MAX_FRAME_LEN => Err(FrameError::TooLarge { len: n }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Payload { len: usize },
}

/// Incremental decoder for one connection's byte stream.
///
/// Bytes may arrive in any chunking; the decoder keeps the partial header or
/// partial payload between calls. The payload buffer never grows past the
/// declared length.
#[derive(Debug)]
pub struct FrameDecoder {
    stage: Stage,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    payload: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
            header: [0; HEADER_LEN],
            header_filled: 0,
            payload: Vec::new(),
        }
    }

    /// Consumes bytes from the front of `input` until one frame completes or
    /// `input` runs dry.
    ///
    /// Returns `Ok(Some(packet))` for a complete frame, leaving any remaining
    /// bytes in `input` for the next call. `Ok(None)` means every byte was
    /// consumed and the frame is still incomplete.
    pub fn decode(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match self.stage {
                Stage::Header => {
                    let take = (HEADER_LEN - self.header_filled).min(input.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&input[..take]);
                    self.header_filled += take;
                    *input = &input[take..];

                    if self.header_filled < HEADER_LEN {
                        return Ok(None);
                    }

                    let len = u32::from_be_bytes(self.header) as usize;
                    validate_len(len)?;
                    self.header_filled = 0;
                    self.payload = Vec::with_capacity(len);
                    self.stage = Stage::Payload { len };
                }
                Stage::Payload { len } => {
                    let take = (len - self.payload.len()).min(input.len());
                    self.payload.extend_from_slice(&input[..take]);
                    *input = &input[take..];

                    if self.payload.len() < len {
                        return Ok(None);
                    }

                    self.stage = Stage::Header;
                    return Ok(Some(std::mem::take(&mut self.payload)));
                }
            }
        }
    }

    /// Number of bytes held for the frame in progress.
    pub fn buffered(&self) -> usize {
        match self.stage {
            Stage::Header => self.header_filled,
            Stage::Payload { .. } => HEADER_LEN + self.payload.len(),
        }
    }
}
