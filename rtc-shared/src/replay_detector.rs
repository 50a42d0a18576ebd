//! Sliding-window replay protection, shared by the DTLS record layer and by
//! SRTP/SRTCP unprotect. A detector tracks the highest sequence number seen
//! and a bitmap of the `window_size` indices below it; a packet is accepted
//! at most once.

use std::collections::VecDeque;

/// A replay detector for a monotonically-ish increasing sequence space of
/// `max_seq + 1` values (e.g. 2^16 for SRTP, 2^48 for SCTP TSN-adjacent
/// uses). `check` both tests and records in one call, matching the
/// check-then-accept-on-success protocol DTLS/SRTP record validation uses.
pub trait ReplayDetector: Send + Sync {
    /// Returns true if `seq` has not been seen before and is within the
    /// window; on true, `accept` must be called to record it.
    fn check(&mut self, seq: u64) -> bool;

    /// Marks the most recently `check`-ed sequence number as accepted.
    /// Split from `check` so a caller can validate the rest of the packet
    /// (e.g. an auth tag) before committing the replay state.
    fn accept(&mut self);
}

/// Fixed-size sliding window over a wrapping sequence space, the scheme
/// RFC 3711 §3.3.2 describes for SRTP and that DTLS's anti-replay window
/// uses for record sequence numbers.
pub struct SlidingWindowDetector {
    max_seq: u64,
    window_size: u64,
    latest_seq: Option<u64>,
    // bit i set => latest_seq - i has been seen, for i in [0, window_size)
    seen: VecDeque<bool>,
    last_checked: Option<u64>,
}

impl SlidingWindowDetector {
    /// `window_size` is the number of trailing sequence numbers kept;
    /// `max_seq` is the largest representable sequence number (e.g.
    /// `(1 << 16) - 1` for SRTP's 16-bit sequence number).
    pub fn new(window_size: u64, max_seq: u64) -> Self {
        SlidingWindowDetector {
            max_seq,
            window_size,
            latest_seq: None,
            seen: VecDeque::from(vec![false; window_size as usize]),
            last_checked: None,
        }
    }

    fn distance(&self, a: u64, b: u64) -> i64 {
        let half = (self.max_seq + 1) / 2;
        let diff = a as i64 - b as i64;
        if diff > half as i64 {
            diff - (self.max_seq as i64 + 1)
        } else if diff < -(half as i64) {
            diff + self.max_seq as i64 + 1
        } else {
            diff
        }
    }
}

impl ReplayDetector for SlidingWindowDetector {
    fn check(&mut self, seq: u64) -> bool {
        self.last_checked = None;
        let Some(latest) = self.latest_seq else {
            self.last_checked = Some(seq);
            return true;
        };

        let d = self.distance(seq, latest);
        if d > 0 {
            // seq is ahead of the window: always new.
            self.last_checked = Some(seq);
            return true;
        }
        let behind = (-d) as u64;
        if behind >= self.window_size {
            // too old, outside the tracked window.
            return false;
        }
        let idx = behind as usize;
        if *self.seen.get(idx).unwrap_or(&true) {
            return false;
        }
        self.last_checked = Some(seq);
        true
    }

    fn accept(&mut self) {
        let Some(seq) = self.last_checked.take() else {
            return;
        };
        match self.latest_seq {
            None => {
                self.seen = VecDeque::from(vec![false; self.window_size as usize]);
                self.seen[0] = true;
                self.latest_seq = Some(seq);
            }
            Some(latest) => {
                let d = self.distance(seq, latest);
                if d > 0 {
                    for _ in 0..d {
                        self.seen.push_front(false);
                        self.seen.pop_back();
                    }
                    self.seen[0] = true;
                    self.latest_seq = Some(seq);
                } else {
                    let idx = (-d) as usize;
                    if idx < self.seen.len() {
                        self.seen[idx] = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_in_order_sequence() {
        let mut d = SlidingWindowDetector::new(64, u16::MAX as u64);
        for seq in 0..10u64 {
            assert!(d.check(seq));
            d.accept();
        }
    }

    #[test]
    fn rejects_exact_replay() {
        let mut d = SlidingWindowDetector::new(64, u16::MAX as u64);
        assert!(d.check(5));
        d.accept();
        assert!(d.check(6));
        d.accept();
        assert!(!d.check(5));
    }

    #[test]
    fn rejects_too_old() {
        let mut d = SlidingWindowDetector::new(16, u16::MAX as u64);
        assert!(d.check(100));
        d.accept();
        assert!(!d.check(50));
    }

    #[test]
    fn accepts_reordered_within_window() {
        let mut d = SlidingWindowDetector::new(16, u16::MAX as u64);
        assert!(d.check(10));
        d.accept();
        assert!(d.check(12));
        d.accept();
        assert!(d.check(11));
        d.accept();
        assert!(!d.check(11));
    }
}
