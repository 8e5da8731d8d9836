//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Strongly typed virtual address in a target process
///
/// Wrapping `u64` keeps addresses from being mixed up with sizes, counts, or
/// OS ids, all of which are also `u64` in this crate.
///
/// ## Example
///
/// ```rust
/// use tether_core::types::Address;
///
/// let addr = Address::from(0x1234);
/// assert_eq!(addr.align_down(0x1000).value(), 0x1000);
/// assert_eq!(addr.align_up(0x1000).value(), 0x2000);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(u64);

impl Address
{
    /// The null address
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, returning `None` on overflow
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Round down to a multiple of `align`
    ///
    /// `align` must be a power of two.
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self
    {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// Round up to a multiple of `align`, saturating at the top of the address space
    ///
    /// `align` must be a power of two.
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self
    {
        debug_assert!(align.is_power_of_two());
        let mask = align - 1;
        match self.0.checked_add(mask) {
            Some(v) => Address(v & !mask),
            None => Address(u64::MAX & !mask),
        }
    }

    /// Whether this address is a multiple of `align` (a power of two)
    pub const fn is_aligned(self, align: u64) -> bool
    {
        self.0 & (align - 1) == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, rhs: Address) -> Self::Output
    {
        self.0.wrapping_sub(rhs.0)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_alignment()
    {
        let addr = Address::new(0x1fff);
        assert_eq!(addr.align_down(0x1000), Address::new(0x1000));
        assert_eq!(addr.align_up(0x1000), Address::new(0x2000));
        assert!(Address::new(0x3000).is_aligned(0x1000));
        assert!(!addr.is_aligned(0x1000));
    }

    #[test]
    fn test_align_up_saturates()
    {
        let addr = Address::new(u64::MAX - 2);
        assert_eq!(addr.align_up(0x1000), Address::new(u64::MAX & !0xfff));
    }

    #[test]
    fn test_distance()
    {
        assert_eq!(Address::new(0x2010) - Address::new(0x2000), 0x10);
        assert_eq!(format!("{}", Address::new(0xdead)), "0x000000000000dead");
    }
}
