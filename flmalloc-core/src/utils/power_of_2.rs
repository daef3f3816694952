//! An integer guaranteed to be a power of 2.

use core::{num, ops};

/// PowerOf2
///
/// An integral guaranteed to be non-zero and a power of 2.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PowerOf2(num::NonZeroUsize);

impl PowerOf2 {
    /// 1 as a PowerOf2 instance.
    //  Safety:
    //  -   1 is a power of 2.
    pub const ONE: PowerOf2 = unsafe { PowerOf2::new_unchecked(1) };

    /// Creates a new instance of PowerOf2.
    ///
    /// Or nothing if the value is not a power of 2.
    pub fn new(value: usize) -> Option<PowerOf2> {
        if value.count_ones() == 1 {
            //  Safety:
            //  -   Value is a power of 2, as per the if check.
            Some(unsafe { PowerOf2::new_unchecked(value) })
        } else {
            None
        }
    }

    /// Creates a new instance of PowerOf2.
    ///
    /// #   Safety
    ///
    /// Assumes that the value is a power of 2.
    pub const unsafe fn new_unchecked(value: usize) -> PowerOf2 {
        //  Safety:
        //  -   A power of 2 cannot be 0.
        PowerOf2(num::NonZeroUsize::new_unchecked(value))
    }

    /// Returns the smallest power of 2 greater than or equal to `value`.
    ///
    /// #   Panics
    ///
    /// If the result would overflow `usize`.
    pub fn ceil(value: usize) -> PowerOf2 {
        if value <= 1 {
            return PowerOf2::ONE;
        }

        let shift = usize::BITS - (value - 1).leading_zeros();
        assert!(shift < usize::BITS, "No power of 2 >= {}", value);

        //  Safety:
        //  -   `1 << shift` is a power of 2, and the shift does not overflow.
        unsafe { PowerOf2::new_unchecked(1usize << shift) }
    }

    /// Returns the inner value.
    pub const fn value(&self) -> usize { self.0.get() }

    /// Returns the base-2 logarithm of the inner value.
    pub const fn log2(&self) -> u32 { self.value().trailing_zeros() }

    /// Rounds the value up to the nearest higher multiple of `self`.
    pub const fn round_up(&self, n: usize) -> usize {
        let mask = self.mask();

        (n + mask) & !mask
    }

    /// Rounds the value down to the nearest lower multiple of `self`.
    pub const fn round_down(&self, n: usize) -> usize { n & !self.mask() }

    const fn mask(&self) -> usize { self.value() - 1 }
}

impl ops::Div<PowerOf2> for usize {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn div(self, rhs: PowerOf2) -> usize { self >> rhs.log2() }
}

impl ops::Mul<usize> for PowerOf2 {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn mul(self, rhs: usize) -> usize { rhs << self.log2() }
}

impl ops::Rem<PowerOf2> for usize {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn rem(self, rhs: PowerOf2) -> usize { self & rhs.mask() }
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn power_of_2_new() {
    fn new(value: usize) -> Option<usize> {
        PowerOf2::new(value).map(|p| p.value())
    }

    assert_eq!(None, new(0));
    assert_eq!(Some(1), new(1));
    assert_eq!(Some(2), new(2));
    assert_eq!(None, new(3));
    assert_eq!(Some(4), new(4));
    assert_eq!(None, new(6));
    assert_eq!(Some(4096), new(4096));
    assert_eq!(None, new(4097));
}

#[test]
fn power_of_2_ceil() {
    fn ceil(value: usize) -> usize { PowerOf2::ceil(value).value() }

    assert_eq!(1, ceil(0));
    assert_eq!(1, ceil(1));
    assert_eq!(2, ceil(2));
    assert_eq!(4, ceil(3));
    assert_eq!(4, ceil(4));
    assert_eq!(8, ceil(5));
    assert_eq!(256, ceil(129));
    assert_eq!(256, ceil(256));
    assert_eq!(512, ceil(257));
}

#[test]
fn power_of_2_round_up() {
    fn round_up(pow2: usize, n: usize) -> usize {
        PowerOf2::new(pow2).expect("Power of 2").round_up(n)
    }

    assert_eq!(0, round_up(4096, 0));
    assert_eq!(4096, round_up(4096, 1));
    assert_eq!(4096, round_up(4096, 4096));
    assert_eq!(8192, round_up(4096, 4097));
}

#[test]
fn power_of_2_round_down() {
    fn round_down(pow2: usize, n: usize) -> usize {
        PowerOf2::new(pow2).expect("Power of 2").round_down(n)
    }

    assert_eq!(0, round_down(4096, 4095));
    assert_eq!(4096, round_down(4096, 4096));
    assert_eq!(4096, round_down(4096, 8191));
    assert_eq!(8192, round_down(4096, 8192));
}

#[test]
fn power_of_2_ops() {
    let page = PowerOf2::new(4096).expect("Power of 2");

    assert_eq!(3, 12288 / page);
    assert_eq!(12288, page * 3);
    assert_eq!(1, 4097 % page);
    assert_eq!(12, page.log2());
}

}
