use std::fmt::{Display, Formatter};

/// A 16-bit wrap-around counter, used for message sequence numbers and for counting transmit
///  attempts.
///
/// NB: There is no `Ord` implementation. With wrap-around, 'less than' only makes sense relative
///  to a window, so comparisons go through [Seq16::distance_from] or [Seq16::is_before].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Seq16(u16);

impl Display for Seq16 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq16 {
    pub const ZERO: Seq16 = Seq16(0);

    pub fn from_raw(value: u16) -> Self {
        Seq16(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> Seq16 {
        Seq16(self.0.wrapping_add(1))
    }

    pub fn plus(&self, n: usize) -> Seq16 {
        Seq16(self.0.wrapping_add(n as u16))
    }

    pub fn minus(&self, n: usize) -> Seq16 {
        Seq16(self.0.wrapping_sub(n as u16))
    }

    /// `(self - other) mod 2^16`, i.e. how many increments it takes to get from `other` to `self`
    pub fn distance_from(&self, other: Seq16) -> u16 {
        self.0.wrapping_sub(other.0)
    }

    /// `true` if `self` comes strictly before `other`, treating the high bit of the distance as
    ///  its sign. This is meaningful only while the two are less than 2^15 apart.
    pub fn is_before(&self, other: Seq16) -> bool {
        let d = other.distance_from(*self);
        d != 0 && d < 0x8000
    }

    /// index into a ring buffer with a power-of-two number of slots
    pub fn slot(&self, capacity: usize) -> usize {
        debug_assert!(capacity.is_power_of_two());
        self.0 as usize & (capacity - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0, 0)]
    #[case(5, 3, 2)]
    #[case(3, 5, 65534)]
    #[case(2, 65535, 3)]
    #[case(0, 65535, 1)]
    fn test_distance_from(#[case] a: u16, #[case] b: u16, #[case] expected: u16) {
        assert_eq!(Seq16::from_raw(a).distance_from(Seq16::from_raw(b)), expected);
    }

    #[rstest]
    #[case(1, 2, true)]
    #[case(2, 1, false)]
    #[case(7, 7, false)]
    #[case(65535, 0, true)]
    #[case(0, 65535, false)]
    #[case(65000, 100, true)]
    #[case(0, 0x7fff, true)]
    #[case(0, 0x8000, false)]
    fn test_is_before(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(Seq16::from_raw(a).is_before(Seq16::from_raw(b)), expected);
    }

    #[test]
    fn test_wrap_around() {
        let s = Seq16::from_raw(u16::MAX);
        assert_eq!(s.next(), Seq16::ZERO);
        assert_eq!(s.plus(129), Seq16::from_raw(128));
        assert_eq!(Seq16::ZERO.minus(128), Seq16::from_raw(65408));
    }

    #[rstest]
    #[case(0, 0)]
    #[case(127, 127)]
    #[case(128, 0)]
    #[case(65535, 127)]
    fn test_slot(#[case] raw: u16, #[case] expected: usize) {
        assert_eq!(Seq16::from_raw(raw).slot(128), expected);
    }
}
