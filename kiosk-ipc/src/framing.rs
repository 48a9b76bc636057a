//! Frame Codec
//!
//! Wire layout of one signal, XDR style (big-endian):
//!
//! ```text
//! offset 0: i32   key
//! offset 4: u32   payload length
//! offset 8: [u8]  payload, zero padded to a multiple of 4
//! ```
//!
//! [`FrameDecoder`] accumulates bytes across reads and yields complete
//! signals, reporting "need more bytes" instead of ever blocking the caller.

use crate::signal::Signal;
use crate::{FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("Payload of {0} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
}

/// Round `n` up to the next multiple of 4
#[inline]
pub fn pad4(n: usize) -> usize {
    (n + 3) / 4 * 4
}

/// Total wire size of a frame carrying `payload_len` bytes
#[inline]
pub fn frame_size(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + pad4(payload_len)
}

/// Encode a signal into a fresh buffer
pub fn encode(signal: &Signal) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::with_capacity(frame_size(signal.payload().len()));
    encode_into(signal, &mut buf)?;
    Ok(buf)
}

/// Append the encoded frame to `buf`.
///
/// A payload over [`MAX_PAYLOAD_LEN`] is refused before anything is written,
/// since the peer's decoder would reject it.
pub fn encode_into(signal: &Signal, buf: &mut Vec<u8>) -> Result<(), FrameError> {
    let payload = signal.payload();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    buf.extend_from_slice(&signal.key().to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    let padding = pad4(payload.len()) - payload.len();
    buf.extend(std::iter::repeat(0u8).take(padding));
    Ok(())
}

/// Decode one frame from the front of `buf`.
///
/// Returns the signal and the number of bytes the frame occupies. A buffer
/// shorter than the frame is always [`FrameError::Incomplete`]. Padding bytes
/// are skipped without inspection.
pub fn decode(buf: &[u8]) -> Result<(Signal, usize), FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Incomplete {
            needed: FRAME_HEADER_LEN,
            available: buf.len(),
        });
    }

    let key = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let size = frame_size(len);
    if buf.len() < size {
        return Err(FrameError::Incomplete {
            needed: size,
            available: buf.len(),
        });
    }

    let payload = buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
    Ok((Signal::new(key, payload), size))
}

/// Streaming decoder holding partial frames between reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Append freshly received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete signal.
    ///
    /// `Ok(None)` means the buffer holds no complete frame yet.
    pub fn next_signal(&mut self) -> Result<Option<Signal>, FrameError> {
        match decode(&self.buffer) {
            Ok((signal, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(signal))
            }
            Err(FrameError::Incomplete { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decode every complete frame currently buffered
    pub fn drain_signals(&mut self) -> Result<Vec<Signal>, FrameError> {
        let mut signals = Vec::new();
        while let Some(signal) = self.next_signal()? {
            signals.push(signal);
        }
        Ok(signals)
    }

    /// Bytes held for a frame that has not completed yet
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
