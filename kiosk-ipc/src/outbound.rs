//! Outbound Frame Queue
//!
//! Holds encoded frames waiting for a writable socket. A partial `send()`
//! leaves the unsent tail at the front, tracked by an offset, so frames are
//! never interleaved on the wire.

use crate::framing::{self, FrameError};
use crate::signal::Signal;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    /// Encoded frames, oldest first
    frames: VecDeque<Vec<u8>>,
    /// Bytes of the front frame already written
    offset: usize,
    /// Unsent bytes across all frames
    pending_bytes: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and enqueue a signal; nothing is queued if it cannot be framed
    pub fn push_signal(&mut self, signal: &Signal) -> Result<(), FrameError> {
        self.push(framing::encode(signal)?);
        Ok(())
    }

    /// Enqueue an already encoded frame
    pub fn push(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        self.pending_bytes += frame.len();
        self.frames.push_back(frame);
    }

    /// Unsent bytes of the front frame
    pub fn front(&self) -> Option<&[u8]> {
        self.frames.front().map(|frame| &frame[self.offset..])
    }

    /// Record that `n` bytes of the front frame were written
    pub fn advance(&mut self, n: usize) {
        let Some(front_len) = self.frames.front().map(Vec::len) else {
            return;
        };
        let n = n.min(front_len - self.offset);
        self.offset += n;
        self.pending_bytes -= n;

        if self.offset == front_len {
            self.frames.pop_front();
            self.offset = 0;
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames not yet fully written, including a partially sent one
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Drop everything, e.g. after the connection closed
    pub fn clear(&mut self) {
        self.frames.clear();
        self.offset = 0;
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;

    #[test]
    fn test_new_queue() {
        let queue = OutboundQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_frames(), 0);
        assert!(queue.front().is_none());
    }

    #[test]
    fn test_partial_send_keeps_offset() {
        let mut queue = OutboundQueue::new();
        queue.push(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        queue.push(vec![9, 10, 11, 12]);
        assert_eq!(queue.pending_bytes(), 12);

        queue.advance(3);
        assert_eq!(queue.front(), Some(&[4u8, 5, 6, 7, 8][..]));
        assert_eq!(queue.pending_frames(), 2);
        assert_eq!(queue.pending_bytes(), 9);

        queue.advance(5);
        assert_eq!(queue.front(), Some(&[9u8, 10, 11, 12][..]));
        assert_eq!(queue.pending_frames(), 1);

        queue.advance(100);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[test]
    fn test_push_signal_encodes_frame() {
        let mut queue = OutboundQueue::new();
        queue
            .push_signal(&Signal::text(SignalKind::Evaluate, "p"))
            .unwrap();
        assert_eq!(queue.pending_bytes(), 12);

        let oversized = Signal::new(1, vec![0u8; crate::MAX_PAYLOAD_LEN + 1]);
        assert!(queue.push_signal(&oversized).is_err());
        assert_eq!(queue.pending_frames(), 1);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::new();
        queue.push(vec![1, 2, 3, 4]);
        queue.advance(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending_bytes(), 0);
    }
}
