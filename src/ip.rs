//! Uniform IPv4/IPv6 address value with promotion, masking, and CIDR math.

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// The byte range within a `::ffff:a.b.c.d`-mapped IPv6 address that holds
/// the embedded IPv4 address.
const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// An IP address value, stored in host byte order for computation.
///
/// Comparison and ordering between the two variants promote the IPv4 side
/// to IPv6 first (`a.b.c.d` becomes `::ffff:a.b.c.d`), so a `V4` and a `V6`
/// never compare unequal just because of their variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpAddress {
    /// A 32-bit IPv4 address.
    V4(u32),
    /// A 128-bit IPv6 address.
    V6(u128),
}

impl IpAddress {
    /// The key width in octets this address occupies when used as a Bag key
    /// or IPset tree key (4 or 16).
    pub const fn width(self) -> u8 {
        match self {
            IpAddress::V4(_) => 4,
            IpAddress::V6(_) => 16,
        }
    }

    /// `true` if this is the all-zero address in its own width.
    pub fn is_unspecified(self) -> bool {
        match self {
            IpAddress::V4(v) => v == 0,
            IpAddress::V6(v) => v == 0,
        }
    }

    /// `true` if this IPv6 value lies in `::ffff:0:0/96` (a v4-mapped
    /// address). Always `false` for `V4`.
    pub fn is_v4_mapped(self) -> bool {
        match self {
            IpAddress::V4(_) => false,
            IpAddress::V6(v) => (v >> 32) == u32::from_be_bytes([0, 0, 0xff, 0xff]) as u128,
        }
    }

    /// Promote an IPv4 address into the `::ffff:a.b.c.d` range. A no-op on
    /// IPv6 input.
    pub fn to_v6(self) -> IpAddress {
        match self {
            IpAddress::V4(v) => {
                let mut bytes = [0u8; 16];
                bytes[..12].copy_from_slice(&V4_MAPPED_PREFIX);
                bytes[12..].copy_from_slice(&v.to_be_bytes());
                IpAddress::V6(u128::from_be_bytes(bytes))
            }
            v6 => v6,
        }
    }

    /// Attempt to demote an IPv6 address to IPv4. Succeeds only if the
    /// value lies in `::ffff:0:0/96`.
    pub fn to_v4(self) -> Result<IpAddress> {
        match self {
            IpAddress::V4(v) => Ok(IpAddress::V4(v)),
            IpAddress::V6(v) if self.is_v4_mapped() => Ok(IpAddress::V4(v as u32)),
            IpAddress::V6(_) => Err(Error::input("IPv6 address is not in ::ffff:0:0/96")),
        }
    }

    /// The address promoted to a 128-bit unsigned integer, for ordering and
    /// arithmetic that must treat v4 and v6 uniformly.
    pub fn as_u128(self) -> u128 {
        match self.to_v6() {
            IpAddress::V6(v) => v,
            IpAddress::V4(_) => unreachable!("to_v6 always returns V6"),
        }
    }

    /// Apply a CIDR mask, zeroing every bit below `prefix`.
    ///
    /// # Panics
    /// Panics if `prefix` exceeds the address's width in bits (32 for v4,
    /// 128 for v6).
    pub fn mask(self, prefix: u8) -> IpAddress {
        match self {
            IpAddress::V4(v) => {
                assert!(prefix <= 32, "IPv4 prefix out of range");
                IpAddress::V4(mask_int(v, prefix, 32))
            }
            IpAddress::V6(v) => {
                assert!(prefix <= 128, "IPv6 prefix out of range");
                IpAddress::V6(mask_int(v, prefix, 128))
            }
        }
    }

    /// `true` if the address has no set bits below `prefix`, i.e. `(addr,
    /// prefix)` denotes an aligned CIDR block.
    pub fn is_aligned(self, prefix: u8) -> bool {
        self.mask(prefix) == self
    }

    /// Increment the address, wrapping at the address-space boundary.
    pub fn increment(self) -> IpAddress {
        match self {
            IpAddress::V4(v) => IpAddress::V4(v.wrapping_add(1)),
            IpAddress::V6(v) => IpAddress::V6(v.wrapping_add(1)),
        }
    }

    /// Decrement the address, wrapping at the address-space boundary.
    pub fn decrement(self) -> IpAddress {
        match self {
            IpAddress::V4(v) => IpAddress::V4(v.wrapping_sub(1)),
            IpAddress::V6(v) => IpAddress::V6(v.wrapping_sub(1)),
        }
    }

    /// Render in canonical dotted-quad / colon-hex text.
    pub fn to_canonical_string(self) -> String {
        match self {
            IpAddress::V4(v) => Ipv4Addr::from(v).to_string(),
            IpAddress::V6(v) => Ipv6Addr::from(v).to_string(),
        }
    }

    /// Render fully expanded (every v6 group zero-padded to 4 hex digits;
    /// v4 addresses render as the usual dotted quad, they have no expanded
    /// form).
    pub fn to_expanded_string(self) -> String {
        match self {
            IpAddress::V4(v) => Ipv4Addr::from(v).to_string(),
            IpAddress::V6(v) => {
                let segments = Ipv6Addr::from(v).segments();
                segments
                    .iter()
                    .map(|s| format!("{:04x}", s))
                    .collect::<Vec<_>>()
                    .join(":")
            }
        }
    }

    /// Render as an unsigned decimal integer.
    pub fn to_decimal_string(self) -> String {
        match self {
            IpAddress::V4(v) => v.to_string(),
            IpAddress::V6(v) => v.to_string(),
        }
    }

    /// Render as a hexadecimal integer (no `0x` prefix), at the address's
    /// own width.
    pub fn to_hex_string(self) -> String {
        match self {
            IpAddress::V4(v) => format!("{:08x}", v),
            IpAddress::V6(v) => format!("{:032x}", v),
        }
    }

    /// Render as a hexadecimal integer after forcing promotion to IPv6.
    pub fn to_hex_string_v6(self) -> String {
        self.to_v6().to_hex_string()
    }
}

fn mask_int<T>(value: T, prefix: u8, width: u8) -> T
where
    T: Copy
        + std::ops::BitAnd<Output = T>
        + std::ops::Not<Output = T>
        + std::ops::Shr<u32, Output = T>
        + From<u8>,
{
    if prefix >= width {
        return value;
    }
    let all_ones = !T::from(0u8);
    let keep_mask = !(all_ones >> prefix as u32);
    value & keep_mask
}

impl PartialOrd for IpAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IpAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_u128().cmp(&other.as_u128())
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(u128::from(addr))
    }
}

/// An IP address plus a CIDR prefix length, denoting a contiguous, aligned
/// range of addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// The CIDR block's base address.
    pub addr: IpAddress,
    /// The prefix length: 0-32 for v4, 0-128 for v6.
    pub prefix: u8,
}

impl Cidr {
    /// Build a `Cidr`, masking `addr` down to an aligned base.
    pub fn new(addr: IpAddress, prefix: u8) -> Self {
        Cidr {
            addr: addr.mask(prefix),
            prefix,
        }
    }

    /// Build a `Cidr`, rejecting unaligned input instead of correcting it.
    pub fn new_checked(addr: IpAddress, prefix: u8) -> Result<Self> {
        if !addr.is_aligned(prefix) {
            return Err(Error::input(format!(
                "{addr}/{prefix} is not an aligned CIDR block"
            )));
        }
        Ok(Cidr { addr, prefix })
    }

    /// The number of addresses in this block, as `2^(width - prefix)`.
    /// Saturates to `u128::MAX` for a full `::/0` IPv6 block, whose true
    /// address count (`2^128`) doesn't fit in a `u128`; callers that need
    /// the exact count should use [`crate::ipset::AddressCount`] instead.
    pub fn size(&self) -> u128 {
        let width = self.addr.width() as u32 * 8;
        let shift = width - self.prefix as u32;
        if shift >= 128 {
            u128::MAX
        } else {
            1u128 << shift
        }
    }

    /// Iterate every address in this block, from the base to `base +
    /// size() - 1`.
    pub fn iter(&self) -> CidrIter {
        CidrIter {
            next: Some(self.addr),
            remaining: self.size(),
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Iterator over every address in a [`Cidr`] block.
pub struct CidrIter {
    next: Option<IpAddress>,
    remaining: u128,
}

impl Iterator for CidrIter {
    type Item = IpAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.remaining -= 1;
        self.next = if self.remaining == 0 {
            None
        } else {
            Some(current.increment())
        };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn v4_to_v6_and_back() {
        let v4 = IpAddress::V4(0xC000_0201); // 192.0.2.1
        let v6 = v4.to_v6();
        assert!(v6.is_v4_mapped());
        assert_eq!(v6.to_v4().unwrap(), v4);
    }

    #[test]
    fn v6_to_v4_rejects_non_mapped() {
        let v6 = IpAddress::V6(1); // ::1
        assert!(v6.to_v4().is_err());
    }

    #[test]
    fn ordering_promotes_v4_to_v6() {
        let v4 = IpAddress::V4(1);
        let v6 = v4.to_v6();
        assert_eq!(v4.cmp(&v6), Ordering::Equal);
    }

    #[test]
    fn mask_zeroes_low_bits() {
        let addr = IpAddress::V4(0b1111_1111_0000_0000_0000_0000_0000_0000);
        let masked = addr.mask(4);
        assert_eq!(
            masked,
            IpAddress::V4(0b1111_0000_0000_0000_0000_0000_0000_0000)
        );
        assert!(masked.is_aligned(4));
    }

    #[test]
    fn cidr_iter_covers_block() {
        let cidr = Cidr::new(IpAddress::V4(0xC000_0200), 30); // 192.0.2.0/30
        let addrs: Vec<_> = cidr.iter().collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[0], IpAddress::V4(0xC000_0200));
        assert_eq!(addrs[3], IpAddress::V4(0xC000_0203));
    }

    #[test]
    fn new_checked_rejects_unaligned() {
        let addr = IpAddress::V4(0xC000_0201);
        assert!(Cidr::new_checked(addr, 24).is_err());
    }
}
