#![forbid(unsafe_code)]

//! Capacity-bounded replay buffer for sent frames.
//!
//! The buffer keeps the most recent `cap` frames, oldest first. Two things
//! remove frames: eviction (a push past capacity drops the oldest) and
//! pruning (the client acknowledged a sequence, everything at or below it
//! is no longer needed for replay).
//!
//! # Invariants
//!
//! - Frames are stored in strictly increasing sequence order.
//! - `len() <= cap` at all times.
//!
//! Mutated only by the session engine under its lock.

use std::collections::VecDeque;

use crate::frame::Frame;

/// Ordered, capacity-bounded sequence of previously-sent frames.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    cap: usize,
}

impl FrameBuffer {
    /// Create a buffer retaining at most `cap` frames.
    ///
    /// A zero cap is clamped to 1 so a freshly-emitted frame can always be
    /// delivered to an attached transport before eviction.
    pub fn new(cap: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    /// Append a frame, evicting the oldest if the buffer is full.
    ///
    /// Debug-asserts the sequence ordering invariant.
    pub fn push(&mut self, frame: Frame) {
        if let Some(last) = self.frames.back() {
            debug_assert!(frame.seq > last.seq, "frame sequence must increase");
        }
        if self.frames.len() == self.cap {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Drop every frame with `seq <= ack`.
    ///
    /// Returns how many frames were pruned.
    pub fn prune_through(&mut self, ack: u64) -> usize {
        let before = self.frames.len();
        while self.frames.front().is_some_and(|f| f.seq <= ack) {
            self.frames.pop_front();
        }
        before - self.frames.len()
    }

    /// All buffered frames with `seq >= from`, oldest first.
    pub fn frames_from(&self, from: u64) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.seq >= from)
            .cloned()
            .collect()
    }

    /// Sequence number of the oldest retained frame, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.frames.front().map(|f| f.seq)
    }

    /// Sequence number of the newest retained frame, if any.
    pub fn newest_seq(&self) -> Option<u64> {
        self.frames.back().map(|f| f.seq)
    }

    /// Number of retained frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Configured capacity.
    pub fn cap(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CHAIN_SEED, RenderMetrics};
    use pretty_assertions::assert_eq;

    fn frame(seq: u64) -> Frame {
        Frame::sealed(seq, vec![], vec![], None, RenderMetrics::default(), CHAIN_SEED)
    }

    #[test]
    fn push_evicts_oldest_past_capacity() {
        let mut buf = FrameBuffer::new(2);
        buf.push(frame(1));
        buf.push(frame(2));
        buf.push(frame(3));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest_seq(), Some(2));
        assert_eq!(buf.newest_seq(), Some(3));
    }

    #[test]
    fn prune_through_drops_acknowledged_frames_only() {
        let mut buf = FrameBuffer::new(8);
        for seq in 1..=5 {
            buf.push(frame(seq));
        }
        assert_eq!(buf.prune_through(3), 3);
        assert_eq!(buf.oldest_seq(), Some(4));
        // Re-pruning the same ack is a no-op.
        assert_eq!(buf.prune_through(3), 0);
    }

    #[test]
    fn frames_from_returns_the_replay_suffix() {
        let mut buf = FrameBuffer::new(8);
        for seq in 1..=5 {
            buf.push(frame(seq));
        }
        let replay: Vec<u64> = buf.frames_from(3).iter().map(|f| f.seq).collect();
        assert_eq!(replay, vec![3, 4, 5]);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let mut buf = FrameBuffer::new(0);
        buf.push(frame(1));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.cap(), 1);
    }
}
