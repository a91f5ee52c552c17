//! A 128-bit-plus address count, since a full `::/0` IPset holds `2^128`
//! addresses — one more than fits in a `u128`.

use std::fmt;
use std::ops::Add;

/// Decimal digits of `2^128`, the one value these fields can't hold.
const TWO_POW_128_DECIMAL: &str = "340282366920938463463374607431768211456";

/// The number of addresses in an IPset. Backed by a `u128` plus a flag for
/// the single value that overflows it: a full IPv6 address space holds
/// exactly `2^128` addresses, one past `u128::MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AddressCount {
    value: u128,
    overflow: bool,
}

impl AddressCount {
    pub const ZERO: AddressCount = AddressCount {
        value: 0,
        overflow: false,
    };

    /// Build a count from a value known to fit in 128 bits.
    pub fn from_u128(value: u128) -> Self {
        AddressCount {
            value,
            overflow: false,
        }
    }

    /// A count representing exactly `2^bits`, which overflows `u128` when
    /// `bits == 128`.
    pub fn pow2(bits: u32) -> Self {
        if bits >= 128 {
            AddressCount {
                value: 0,
                overflow: true,
            }
        } else {
            Self::from_u128(1u128 << bits)
        }
    }

    /// Fallible narrowing to `u128`; `None` only for the `2^128` count.
    pub fn to_u128(self) -> Option<u128> {
        if self.overflow {
            None
        } else {
            Some(self.value)
        }
    }
}

impl Add for AddressCount {
    type Output = AddressCount;

    fn add(self, rhs: AddressCount) -> AddressCount {
        if self.overflow || rhs.overflow {
            // The only way to reach this is one operand already being the
            // full address space; no set can hold more than that.
            return AddressCount {
                value: 0,
                overflow: true,
            };
        }
        match self.value.checked_add(rhs.value) {
            Some(value) => AddressCount {
                value,
                overflow: false,
            },
            None => AddressCount {
                value: 0,
                overflow: true,
            },
        }
    }
}

impl fmt::Display for AddressCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overflow {
            write!(f, "{TWO_POW_128_DECIMAL}")
        } else {
            write!(f, "{}", self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_128_overflows_u128_max() {
        let count = AddressCount::pow2(128);
        assert!(count.to_u128().is_none());
        assert_eq!(count.to_string(), TWO_POW_128_DECIMAL);
    }

    #[test]
    fn addition_carries() {
        let a = AddressCount::from_u128(u64::MAX as u128);
        let b = AddressCount::from_u128(1);
        let sum = a + b;
        assert_eq!(sum.to_u128().unwrap(), u64::MAX as u128 + 1);
    }

    #[test]
    fn two_halves_of_address_space_sum_to_overflow() {
        let half = AddressCount::pow2(127);
        let sum = half + half;
        assert!(sum.to_u128().is_none());
        assert_eq!(sum.to_string(), TWO_POW_128_DECIMAL);
    }
}
