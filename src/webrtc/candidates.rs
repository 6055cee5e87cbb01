//! Remote ICE candidate buffer
//!
//! Candidates can race ahead of the offer/answer exchange. Until a remote
//! description is applied they are held here in arrival order, then drained
//! exactly once.

use super::signaling::IceCandidate;
use log::warn;
use std::collections::VecDeque;

/// Bounded FIFO of candidates awaiting a remote description
#[derive(Debug)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    capacity: usize,
    dropped: u64,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a candidate. Returns false when the buffer is full and the
    /// candidate was discarded.
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.pending.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                "ICE candidate buffer full ({} entries), dropping candidate ({} dropped so far)",
                self.capacity, self.dropped
            );
            return false;
        }
        self.pending.push_back(candidate);
        true
    }

    /// Take every queued candidate in arrival order
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Candidates discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
