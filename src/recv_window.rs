//! Sliding window over received datagram sequence numbers.
//!
//! Detects duplicates (dropped silently) and gaps (candidates for NACKs).
//! All comparisons are 24-bit modular so the window survives sequence
//! wraparound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::binary::Uint24;

/// A window tracking which datagram sequence numbers have arrived.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    /// Lowest sequence number not yet shifted out.
    pub lowest: Uint24,
    /// One past the highest sequence number seen.
    pub highest: Uint24,
    queue: HashMap<u32, Instant>,
}

impl ReceiveWindow {
    /// Creates a new receive window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sequence number. Returns false if it is a duplicate or too
    /// far ahead of the window to ever be drained.
    pub fn add(&mut self, index: Uint24) -> bool {
        if self.seen(index) {
            return false;
        }
        if index.at_or_after(self.highest)
            && index.next().distance_from(self.highest) > crate::MAX_WINDOW_SIZE
        {
            return false;
        }
        if self.highest.before(index.next()) {
            self.highest = index.next();
        }
        self.queue.insert(index.value(), Instant::now());
        true
    }

    /// Whether the sequence number was received before.
    pub fn seen(&self, index: Uint24) -> bool {
        if index.before(self.lowest) {
            return true;
        }
        self.queue.contains_key(&index.value())
    }

    /// Shifts the window past consecutively received sequence numbers.
    /// Returns the number of indices shifted.
    pub fn shift(&mut self) -> usize {
        let mut n = 0;
        let mut index = self.lowest;

        while index.before(self.highest) {
            if !self.queue.contains_key(&index.value()) {
                break;
            }
            self.queue.remove(&index.value());
            n += 1;
            index = index.next();
        }

        self.lowest = index;
        n
    }

    /// Sequence numbers missing for at least `since`, from the perspective of
    /// later arrivals. Each returned index is marked requested so it is not
    /// reported twice.
    pub fn missing(&mut self, since: Duration) -> Vec<Uint24> {
        let mut indices = Vec::new();
        let mut missing = false;
        let now = Instant::now();

        // Walk from the newest arrival backwards; anything absent below a
        // sufficiently old arrival is considered lost.
        let span = self.highest.distance_from(self.lowest);
        for offset in (0..span).rev() {
            let index = self.lowest + offset;
            if let Some(&time) = self.queue.get(&index.value()) {
                if now.duration_since(time) >= since {
                    missing = true;
                }
                continue;
            }
            if missing {
                indices.push(index);
                // Mark as requested with an aged timestamp.
                self.queue
                    .insert(index.value(), now - Duration::from_secs(3600));
            }
        }

        self.shift();
        indices
    }

    /// Current width of the window.
    pub fn size(&self) -> u32 {
        self.highest.distance_from(self.lowest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_seen() {
        let mut win = ReceiveWindow::new();
        assert!(win.add(Uint24::new(0)));
        assert!(!win.add(Uint24::new(0))); // Duplicate
        assert!(win.add(Uint24::new(1)));
        assert!(win.seen(Uint24::new(0)));
        assert!(win.seen(Uint24::new(1)));
    }

    #[test]
    fn test_shift() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));
        win.add(Uint24::new(1));
        win.add(Uint24::new(2));

        let shifted = win.shift();
        assert_eq!(shifted, 3);
        assert_eq!(win.lowest.value(), 3);
    }

    #[test]
    fn test_shift_with_gap() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));
        win.add(Uint24::new(2)); // Gap at 1

        let shifted = win.shift();
        assert_eq!(shifted, 1);
        assert_eq!(win.lowest.value(), 1);
    }

    #[test]
    fn test_shifted_out_counts_as_seen() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));
        win.shift();

        // A late duplicate of an already released datagram is still rejected.
        assert!(!win.add(Uint24::new(0)));
    }

    #[test]
    fn test_window_survives_wraparound() {
        let mut win = ReceiveWindow::new();
        win.lowest = Uint24::new(0x00FF_FFFE);
        win.highest = Uint24::new(0x00FF_FFFE);

        assert!(win.add(Uint24::new(0x00FF_FFFE)));
        assert!(win.add(Uint24::new(0x00FF_FFFF)));
        assert!(win.add(Uint24::new(0)));
        assert!(win.add(Uint24::new(1)));

        let shifted = win.shift();
        assert_eq!(shifted, 4);
        assert_eq!(win.lowest.value(), 2);
    }

    #[test]
    fn test_far_future_sequence_rejected() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));

        // Beyond the window limit nothing is buffered at all.
        assert!(!win.add(Uint24::new(crate::MAX_WINDOW_SIZE + 100)));
        assert!(!win.seen(Uint24::new(crate::MAX_WINDOW_SIZE + 100)));
        assert_eq!(win.size(), 1);

        // At the edge of the limit the sequence number is still accepted.
        assert!(win.add(Uint24::new(crate::MAX_WINDOW_SIZE - 1)));
        assert_eq!(win.size(), crate::MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_scattered_far_future_does_not_grow_queue() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));
        win.shift();

        for i in 0..10_000u32 {
            win.add(Uint24::new(crate::MAX_WINDOW_SIZE + 1 + i * 7));
        }

        assert!(win.queue.len() as u32 <= crate::MAX_WINDOW_SIZE);
        assert!(win.size() <= crate::MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_missing_reports_gap_once() {
        let mut win = ReceiveWindow::new();
        win.add(Uint24::new(0));
        win.add(Uint24::new(2));
        win.shift();

        let missing = win.missing(Duration::ZERO);
        assert_eq!(missing, vec![Uint24::new(1)]);

        // Already requested, not reported again.
        assert!(win.missing(Duration::ZERO).is_empty());
    }
}
