//! Binary utilities for sequence numbers and wire integers.

use bytes::BufMut;

/// A 24-bit unsigned integer, stored as u32 for convenience.
///
/// Sequence numbers, message indices and order indices on the wire are all
/// 24 bits wide and wrap around, so comparisons between them must be modular.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uint24(pub u32);

/// Mask applied to keep values within 24 bits.
const MASK: u32 = 0x00FF_FFFF;

/// Half of the 24-bit space, used as the modular comparison pivot.
const HALF_SPAN: u32 = 0x0080_0000;

impl Uint24 {
    /// Creates a new Uint24 from a u32 value.
    /// The value is masked to 24 bits.
    pub fn new(value: u32) -> Self {
        Uint24(value & MASK)
    }

    /// Increments the value and returns the old value, wrapping at 2^24.
    pub fn inc(&mut self) -> Uint24 {
        let old = *self;
        self.0 = (self.0 + 1) & MASK;
        old
    }

    /// Returns the inner u32 value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Returns the next value, wrapping at 2^24.
    pub fn next(self) -> Uint24 {
        Uint24::new(self.0 + 1)
    }

    /// Modular "less than": true if `self` comes before `other` in the
    /// 24-bit circular sequence space.
    pub fn before(self, other: Uint24) -> bool {
        self != other && other.0.wrapping_sub(self.0) & MASK < HALF_SPAN
    }

    /// Modular "greater or equal" counterpart of [`Uint24::before`].
    pub fn at_or_after(self, other: Uint24) -> bool {
        !self.before(other)
    }

    /// Circular distance from `other` up to `self`.
    pub fn distance_from(self, other: Uint24) -> u32 {
        self.0.wrapping_sub(other.0) & MASK
    }
}

impl From<u32> for Uint24 {
    fn from(value: u32) -> Self {
        Uint24::new(value)
    }
}

impl From<Uint24> for u32 {
    fn from(value: Uint24) -> Self {
        value.0
    }
}

impl std::ops::Add<u32> for Uint24 {
    type Output = Uint24;

    fn add(self, rhs: u32) -> Self::Output {
        Uint24::new(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub for Uint24 {
    type Output = Uint24;

    fn sub(self, rhs: Self) -> Self::Output {
        Uint24::new(self.0.wrapping_sub(rhs.0))
    }
}

/// Loads a uint24 (little-endian) from a byte slice.
pub fn load_uint24(b: &[u8]) -> Uint24 {
    Uint24((b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16))
}

/// Writes a uint24 (little-endian) to the buffer.
pub fn write_uint24<B: BufMut>(buf: &mut B, v: Uint24) {
    buf.put_u8(v.0 as u8);
    buf.put_u8((v.0 >> 8) as u8);
    buf.put_u8((v.0 >> 16) as u8);
}

/// Writes a u16 (big-endian) to the buffer.
pub fn write_uint16<B: BufMut>(buf: &mut B, v: u16) {
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

/// Writes a u32 (big-endian) to the buffer.
pub fn write_uint32<B: BufMut>(buf: &mut B, v: u32) {
    buf.put_u8((v >> 24) as u8);
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint24_inc() {
        let mut v = Uint24::new(0);
        assert_eq!(v.inc().value(), 0);
        assert_eq!(v.value(), 1);
        assert_eq!(v.inc().value(), 1);
        assert_eq!(v.value(), 2);
    }

    #[test]
    fn test_uint24_overflow() {
        let mut v = Uint24::new(0x00FF_FFFF);
        v.inc();
        assert_eq!(v.value(), 0);
    }

    #[test]
    fn test_modular_comparison() {
        assert!(Uint24::new(1).before(Uint24::new(2)));
        assert!(!Uint24::new(2).before(Uint24::new(1)));
        assert!(!Uint24::new(5).before(Uint24::new(5)));

        // Across the wraparound boundary 0x00FFFFFF comes before 0.
        assert!(Uint24::new(0x00FF_FFFF).before(Uint24::new(0)));
        assert!(!Uint24::new(0).before(Uint24::new(0x00FF_FFFF)));
    }

    #[test]
    fn test_distance_wraps() {
        assert_eq!(Uint24::new(3).distance_from(Uint24::new(1)), 2);
        assert_eq!(Uint24::new(1).distance_from(Uint24::new(0x00FF_FFFF)), 2);
    }

    #[test]
    fn test_load_uint24() {
        let bytes = [0x01, 0x02, 0x03];
        let v = load_uint24(&bytes);
        assert_eq!(v.value(), 0x030201);
    }
}
