//! Per-connection outbound FIFO with at most one write in flight.

use std::collections::VecDeque;

/// Outbound frame queue for one socket.
///
/// Frames are written strictly in the order they were pushed.  While a write
/// is in flight, new frames wait; when it completes, the head of the queue
/// becomes the next write.
#[derive(Debug, Default)]
pub struct SendQueue {
    waiting: VecDeque<Vec<u8>>,
    in_flight: bool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `frame`.  Returns the bytes to write now if the socket was
    /// idle, or `None` if a write is already in flight.
    pub fn push(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        self.waiting.push_back(frame);
        if self.in_flight {
            None
        } else {
            self.start_next()
        }
    }

    /// Marks the in-flight write as finished and returns the next write, if
    /// any frames are waiting.
    pub fn complete(&mut self) -> Option<Vec<u8>> {
        self.in_flight = false;
        self.start_next()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of frames queued behind the in-flight write.
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Drops everything, e.g. when the socket closes.
    pub fn clear(&mut self) {
        self.waiting.clear();
        self.in_flight = false;
    }

    fn start_next(&mut self) -> Option<Vec<u8>> {
        let next = self.waiting.pop_front()?;
        self.in_flight = true;
        Some(next)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
