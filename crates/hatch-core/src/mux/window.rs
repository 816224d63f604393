//! Per-channel credit accounting.

use std::collections::VecDeque;

/// Outbound side: credit granted by the peer plus bytes waiting for credit.
#[derive(Debug)]
pub struct SendWindow {
    credit: u64,
    pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    cap: usize,
}

/// Returned by [`SendWindow::enqueue`] when the buffer cap would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapExceeded {
    pub buffered: usize,
    pub cap: usize,
}

impl SendWindow {
    pub fn new(credit: u32, cap: usize) -> Self {
        Self {
            credit: credit as u64,
            pending: VecDeque::new(),
            pending_bytes: 0,
            cap,
        }
    }

    /// Queue bytes for sending. Fails if, after spending all current
    /// credit, more than `cap` bytes would remain buffered.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<(), CapExceeded> {
        if data.is_empty() {
            return Ok(());
        }
        let total = self.pending_bytes as u64 + data.len() as u64;
        let buffered = total.saturating_sub(self.credit) as usize;
        if buffered > self.cap {
            return Err(CapExceeded {
                buffered,
                cap: self.cap,
            });
        }
        self.pending.push_back(data.to_vec());
        self.pending_bytes += data.len();
        Ok(())
    }

    /// Add credit from a `window_adjust`.
    pub fn grant(&mut self, bytes: u32) {
        self.credit = self.credit.saturating_add(bytes as u64);
    }

    /// Pop the next chunk that fits the current credit, at most `max_chunk` bytes.
    pub fn take_sendable(&mut self, max_chunk: usize) -> Option<Vec<u8>> {
        if self.credit == 0 {
            return None;
        }
        let front = self.pending.front_mut()?;
        let limit = max_chunk.min(self.credit as usize).max(1);
        let chunk = if front.len() <= limit {
            self.pending.pop_front()?
        } else {
            let rest = front.split_off(limit);
            std::mem::replace(front, rest)
        };
        self.credit -= chunk.len() as u64;
        self.pending_bytes -= chunk.len();
        Some(chunk)
    }

    pub fn is_drained(&self) -> bool {
        self.pending_bytes == 0
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn credit(&self) -> u64 {
        self.credit
    }

    /// Drop everything still buffered.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}

/// Inbound side: credit we advertised and bytes consumed but not yet returned.
#[derive(Debug)]
pub struct RecvWindow {
    remaining: u64,
    initial: u32,
    unacked: u64,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            remaining: initial as u64,
            initial,
            unacked: 0,
        }
    }

    /// Account for a received `data` frame. Errors when it overruns credit.
    pub fn on_data(&mut self, len: usize) -> Result<(), u64> {
        if len as u64 > self.remaining {
            return Err(self.remaining);
        }
        self.remaining -= len as u64;
        Ok(())
    }

    /// Account for bytes handed to the application. Returns the credit to
    /// send back once at least half the window has been consumed.
    pub fn consume(&mut self, len: usize) -> Option<u32> {
        self.unacked += len as u64;
        if self.unacked * 2 < self.initial as u64 || self.unacked == 0 {
            return None;
        }
        let grant = self.unacked.min(u32::MAX as u64) as u32;
        self.unacked -= grant as u64;
        self.remaining += grant as u64;
        Some(grant)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_beyond_window_up_to_cap() {
        let mut w = SendWindow::new(10, 20);
        w.enqueue(&[0; 25]).unwrap();
        assert_eq!(w.pending_bytes(), 25);
        // 30 pending against 10 credit leaves 20 buffered: still at the cap.
        w.enqueue(&[0; 5]).unwrap();
        let err = w.enqueue(&[0; 1]).unwrap_err();
        assert_eq!(err, CapExceeded { buffered: 21, cap: 20 });
        assert_eq!(w.pending_bytes(), 30);
    }

    #[test]
    fn take_sendable_splits_at_credit_and_chunk() {
        let mut w = SendWindow::new(10, 100);
        w.enqueue(b"abcdefghijklmnop").unwrap();
        assert_eq!(w.take_sendable(4).unwrap(), b"abcd");
        assert_eq!(w.take_sendable(100).unwrap(), b"efghij");
        assert!(w.take_sendable(100).is_none());
        assert_eq!(w.credit(), 0);

        w.grant(100);
        assert_eq!(w.take_sendable(100).unwrap(), b"klmnop");
        assert!(w.is_drained());
    }

    #[test]
    fn recv_window_rejects_overrun() {
        let mut r = RecvWindow::new(8);
        r.on_data(8).unwrap();
        assert_eq!(r.on_data(1), Err(0));
    }

    #[test]
    fn credit_returned_after_half_consumed() {
        let mut r = RecvWindow::new(100);
        r.on_data(60).unwrap();
        assert_eq!(r.consume(30), None);
        assert_eq!(r.consume(20), Some(50));
        assert_eq!(r.remaining(), 90);
        assert_eq!(r.consume(10), None);
    }
}
