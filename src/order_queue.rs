//! In-order release of reliable-ordered payloads.

use std::collections::HashMap;

use crate::binary::Uint24;

/// Buffers out-of-order arrivals for one ordering channel and releases
/// contiguous runs once gaps fill. Duplicate order indices are rejected so a
/// payload is released to the application exactly once.
#[derive(Debug, Default)]
pub struct OrderQueue {
    /// Next order index owed to the application.
    pub lowest: Uint24,
    /// One past the highest buffered order index.
    pub highest: Uint24,
    queue: HashMap<u32, Vec<u8>>,
}

impl OrderQueue {
    /// Creates a new order queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a payload at the given order index. Returns false for
    /// duplicates and for indices already released.
    pub fn put(&mut self, index: Uint24, packet: Vec<u8>) -> bool {
        if index.before(self.lowest) {
            return false;
        }
        if self.queue.contains_key(&index.value()) {
            return false;
        }
        if index.at_or_after(self.highest) {
            self.highest = index.next();
        }
        self.queue.insert(index.value(), packet);
        true
    }

    /// Releases the contiguous run starting at the lowest owed index.
    pub fn fetch(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut index = self.lowest;

        while index.before(self.highest) {
            match self.queue.remove(&index.value()) {
                Some(packet) => {
                    packets.push(packet);
                    index = index.next();
                }
                None => break,
            }
        }

        self.lowest = index;
        packets
    }

    /// Distance between the next owed index and the highest buffered one.
    pub fn window_size(&self) -> u32 {
        self.highest.distance_from(self.lowest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_fetch() {
        let mut queue = OrderQueue::new();

        assert!(queue.put(Uint24::new(0), vec![1, 2, 3]));
        assert!(queue.put(Uint24::new(1), vec![4, 5, 6]));

        let packets = queue.fetch();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![1, 2, 3]);
        assert_eq!(packets[1], vec![4, 5, 6]);
    }

    #[test]
    fn test_gap_holds_release_until_filled() {
        let mut queue = OrderQueue::new();

        // Arrival order 3, 1, 2 (zero-based: 2, 0, 1).
        assert!(queue.put(Uint24::new(2), vec![3]));
        assert!(queue.fetch().is_empty());

        assert!(queue.put(Uint24::new(0), vec![1]));
        assert_eq!(queue.fetch(), vec![vec![1]]);

        // Releasing resumes only once the gap at index 1 fills.
        assert!(queue.put(Uint24::new(1), vec![2]));
        assert_eq!(queue.fetch(), vec![vec![2], vec![3]]);
    }

    #[test]
    fn test_duplicate_delivered_once() {
        let mut queue = OrderQueue::new();

        assert!(queue.put(Uint24::new(0), vec![1, 2, 3]));
        assert!(!queue.put(Uint24::new(0), vec![4, 5, 6]));

        assert_eq!(queue.fetch().len(), 1);

        // A repeat arriving after release is also rejected.
        assert!(!queue.put(Uint24::new(0), vec![7]));
        assert!(queue.fetch().is_empty());
    }

    #[test]
    fn test_wraparound_release() {
        let mut queue = OrderQueue::new();
        queue.lowest = Uint24::new(0x00FF_FFFF);
        queue.highest = Uint24::new(0x00FF_FFFF);

        assert!(queue.put(Uint24::new(0), vec![2]));
        assert!(queue.fetch().is_empty());

        assert!(queue.put(Uint24::new(0x00FF_FFFF), vec![1]));
        assert_eq!(queue.fetch(), vec![vec![1], vec![2]]);
        assert_eq!(queue.lowest.value(), 1);
    }
}
