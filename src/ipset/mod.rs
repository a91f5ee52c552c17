//! A compressed set of IPv4 or IPv6 addresses, supporting CIDR insert/
//! remove/union/intersect/difference/mask and binary serialization.

mod count;
mod io;
mod node;
mod sample;

pub use count::AddressCount;
pub use io::IpSetStreamInfo;
pub use sample::SampleMode;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ip::{Cidr, IpAddress};
use node::{Arena, NodeRef};

/// How a v6-producing operation should treat mixed v4-mapped / pure-v6
/// content, per spec.md §4.2's `walk` and §9's open question on
/// `mask_and_fill`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum V6Policy {
    /// Emit addresses in their set's native width.
    AsIs,
    /// Force every address to its IPv6 form before visiting it.
    ForceV6,
}

/// A compressed set of IP addresses, backed by a binary radix tree with a
/// fixed key width (4 or 16 octets) set at creation.
#[derive(Clone, Debug)]
pub struct IpSet {
    width: u8,
    arena: Arena,
    root: NodeRef,
    auto_convert: bool,
}

impl IpSet {
    /// Create an empty set with the given key width (4 for IPv4, 16 for
    /// IPv6).
    ///
    /// # Panics
    /// Panics if `width` is not 4 or 16.
    pub fn create(width: u8) -> Self {
        assert!(width == 4 || width == 16, "IPset key width must be 4 or 16");
        IpSet {
            width,
            arena: Arena::default(),
            root: NodeRef::Empty,
            auto_convert: true,
        }
    }

    /// Build a set of single addresses (`/32` or `/128` blocks) by folding
    /// an iterator of flow records, keyed on the record's source or
    /// destination address.
    pub fn from_records<R: crate::record::FlowRecord>(
        records: impl IntoIterator<Item = R>,
        key_field: crate::bag::field::RecordKeyField,
        width: u8,
    ) -> Result<IpSet> {
        use crate::bag::field::RecordKeyField;
        let mut set = IpSet::create(width);
        let host_prefix = width * 8;
        for record in records {
            let addr = match key_field {
                RecordKeyField::SrcIp => record.src_ip(),
                RecordKeyField::DstIp => record.dst_ip(),
                _ => {
                    return Err(Error::input(
                        "IPset records must be keyed on an address field",
                    ))
                }
            };
            set.insert(addr, host_prefix)?;
        }
        Ok(set)
    }

    /// The set's current key width, in octets (4 or 16).
    pub fn width(&self) -> u8 {
        self.width
    }

    /// `true` if this set holds IPv6 content (key width 16).
    pub fn is_v6(&self) -> bool {
        self.width == 16
    }

    /// Enable or disable automatic v4→v6 promotion when an operation is
    /// given an address wider than the set's current width.
    pub fn set_auto_convert(&mut self, enabled: bool) {
        self.auto_convert = enabled;
    }

    fn width_bits(&self) -> u8 {
        self.width * 8
    }

    /// No-op: every mutation here already leaves the tree in canonical
    /// form (see the module-level canonicalization note in `node`), so
    /// there's no deferred sweep to run. Exists to mirror the source's
    /// explicit batched-canonicalization marker.
    pub fn clean(&mut self) {}

    /// Normalize `addr` to this set's width, promoting v4→v6 if allowed,
    /// and return its bit pattern.
    fn normalize(&self, addr: IpAddress) -> Result<u128> {
        if addr.width() == self.width {
            return Ok(addr.as_u128() & self.width_mask());
        }
        if !self.auto_convert {
            return Err(Error::KeyRange);
        }
        match (addr, self.width) {
            (IpAddress::V4(_), 16) => Ok(addr.to_v6().as_u128()),
            (IpAddress::V6(_), 4) => Ok(addr.to_v4()?.as_u128()),
            _ => Err(Error::input("address width mismatch")),
        }
    }

    fn width_mask(&self) -> u128 {
        if self.width_bits() >= 128 {
            u128::MAX
        } else {
            (1u128 << self.width_bits()) - 1
        }
    }

    /// Insert a CIDR block into the set; adjacent blocks are merged.
    pub fn insert(&mut self, addr: IpAddress, prefix: u8) -> Result<()> {
        let bits = self.normalize(addr)?;
        if prefix > self.width_bits() {
            return Err(Error::input("prefix length exceeds set width"));
        }
        self.root = self
            .arena
            .insert(self.root, 0, prefix, bits, self.width_bits());
        Ok(())
    }

    /// Remove a CIDR block from the set; interior blocks are split as
    /// needed.
    pub fn remove(&mut self, addr: IpAddress, prefix: u8) -> Result<()> {
        let bits = self.normalize(addr)?;
        if prefix > self.width_bits() {
            return Err(Error::input("prefix length exceeds set width"));
        }
        self.root = self
            .arena
            .remove(self.root, 0, prefix, bits, self.width_bits());
        Ok(())
    }

    /// `true` if `addr` is in the set.
    pub fn contains(&self, addr: IpAddress) -> bool {
        match self.normalize(addr) {
            Ok(bits) => self.arena.contains(self.root, bits, self.width_bits()),
            Err(_) => false,
        }
    }

    /// The exact count of addresses in the set.
    pub fn count(&self) -> AddressCount {
        let mut total = AddressCount::ZERO;
        self.arena.for_each_leaf(self.root, 0, 0, &mut |_, depth| {
            total = total + AddressCount::pow2((self.width_bits() - depth) as u32);
        });
        total
    }

    fn widen_to_match<'a>(&'a self, other: &'a IpSet) -> (u8, bool, bool) {
        let width = self.width.max(other.width);
        (width, width != self.width, width != other.width)
    }

    fn rebuild_at_width(&self, width: u8) -> Result<IpSet> {
        if width == self.width {
            return Ok(self.clone());
        }
        trace!(from = self.width, to = width, "rebuild_at_width");
        let mut rebuilt = IpSet::create(width);
        for cidr in self.leaves() {
            let (promoted, prefix) = if width == 16 {
                (cidr.addr.to_v6(), cidr.prefix + 96)
            } else {
                if cidr.prefix < 96 {
                    return Err(Error::input(
                        "IPv6 content is not entirely within ::ffff:0:0/96",
                    ));
                }
                (cidr.addr.to_v4()?, cidr.prefix - 96)
            };
            rebuilt.insert(promoted, prefix)?;
        }
        Ok(rebuilt)
    }

    /// Replace `self` with `self ∪ other`, promoting to the wider width if
    /// the operands differ.
    pub fn union(&mut self, other: &IpSet) -> Result<()> {
        let (width, _, _) = self.widen_to_match(other);
        let a = self.rebuild_at_width(width)?;
        let b = other.rebuild_at_width(width)?;
        let mut arena = Arena::default();
        let root = arena.union(&a.arena, a.root, &b.arena, b.root);
        self.width = width;
        self.arena = arena;
        self.root = root;
        Ok(())
    }

    /// Replace `self` with `self ∩ other`.
    pub fn intersect(&mut self, other: &IpSet) -> Result<()> {
        let (width, _, _) = self.widen_to_match(other);
        let a = self.rebuild_at_width(width)?;
        let b = other.rebuild_at_width(width)?;
        let mut arena = Arena::default();
        let root = arena.intersect(&a.arena, a.root, &b.arena, b.root);
        self.width = width;
        self.arena = arena;
        self.root = root;
        Ok(())
    }

    /// Replace `self` with `self ∖ other`.
    pub fn difference(&mut self, other: &IpSet) -> Result<()> {
        let (width, _, _) = self.widen_to_match(other);
        let a = self.rebuild_at_width(width)?;
        let b = other.rebuild_at_width(width)?;
        let mut arena = Arena::default();
        let root = arena.difference(&a.arena, a.root, &b.arena, b.root);
        self.width = width;
        self.arena = arena;
        self.root = root;
        Ok(())
    }

    /// Every maximal CIDR leaf in the set, in ascending address order.
    pub fn leaves(&self) -> Vec<Cidr> {
        let mut out = Vec::new();
        let width_bits = self.width_bits();
        self.arena
            .for_each_leaf(self.root, 0, 0, &mut |path, depth| {
                let addr_bits = if depth == 0 {
                    0
                } else {
                    path << (width_bits - depth)
                };
                let addr = if self.width == 4 {
                    IpAddress::V4(addr_bits as u32)
                } else {
                    IpAddress::V6(addr_bits)
                };
                out.push(Cidr {
                    addr,
                    prefix: depth,
                });
            });
        out
    }

    /// Keep one representative address per occupied block of size
    /// `prefix`; blocks with nothing present are dropped entirely.
    pub fn mask(&mut self, prefix: u8) -> Result<()> {
        if prefix == 0 || prefix >= self.width_bits() {
            return Err(Error::input("mask prefix out of range"));
        }
        let occupied = self.occupied_blocks(prefix);
        debug!(prefix, blocks = occupied.len(), "mask: rebuilding tree");
        let width_bits = self.width_bits();
        let mut arena = Arena::default();
        let mut root = NodeRef::Empty;
        for block_bits in occupied {
            // The representative address is the block's base (all-zero
            // suffix), inserted at full specificity.
            root = arena.insert(root, 0, width_bits, block_bits, width_bits);
        }
        self.arena = arena;
        self.root = root;
        Ok(())
    }

    /// Fill every occupied block of size `prefix` completely.
    pub fn mask_and_fill(&mut self, prefix: u8) -> Result<()> {
        if prefix == 0 || prefix >= self.width_bits() {
            return Err(Error::input("mask prefix out of range"));
        }
        let occupied = self.occupied_blocks(prefix);
        debug!(
            prefix,
            blocks = occupied.len(),
            "mask_and_fill: rebuilding tree"
        );
        let mut arena = Arena::default();
        let mut root = NodeRef::Empty;
        for block_bits in occupied {
            root = arena.insert(root, 0, prefix, block_bits, self.width_bits());
        }
        self.arena = arena;
        self.root = root;
        Ok(())
    }

    /// The base address bits of every block of size `prefix` that
    /// contains at least one set address.
    fn occupied_blocks(&self, prefix: u8) -> Vec<u128> {
        let mut out = Vec::new();
        collect_occupied(
            &self.arena,
            self.root,
            0,
            prefix,
            0,
            self.width_bits(),
            &mut out,
        );
        out
    }

    /// Visit each leaf; if `visit_cidr` is false, every individual address
    /// is visited instead of each block as a whole.
    pub fn walk(&self, visit_cidr: bool, v6_policy: V6Policy, mut callback: impl FnMut(Cidr)) {
        for cidr in self.leaves() {
            let cidr = match v6_policy {
                V6Policy::ForceV6 if self.width == 4 => Cidr {
                    addr: cidr.addr.to_v6(),
                    prefix: cidr.prefix + 96,
                },
                _ => cidr,
            };
            if visit_cidr {
                callback(cidr);
            } else {
                for addr in cidr.iter() {
                    callback(Cidr {
                        addr,
                        prefix: addr.width() * 8,
                    });
                }
            }
        }
    }

    /// Convert the set to the given width. v4→v6 always succeeds; v6→v4
    /// succeeds only if every address is v4-mapped.
    pub fn convert(&mut self, width: u8) -> Result<()> {
        assert!(width == 4 || width == 16, "IPset key width must be 4 or 16");
        trace!(from = self.width, to = width, "convert: rebuilding tree");
        *self = self.rebuild_at_width(width)?;
        Ok(())
    }

    /// Draw a sample of the set's addresses per `mode`, deterministic given
    /// `seed`.
    pub fn sample(&self, mode: SampleMode, seed: u64) -> IpSet {
        sample::sample(self, mode, seed)
    }
}

fn collect_occupied(
    arena: &Arena,
    node: NodeRef,
    depth: u8,
    target: u8,
    bits: u128,
    width_bits: u8,
    out: &mut Vec<u128>,
) {
    if matches!(node, NodeRef::Empty) {
        return;
    }
    if depth == target {
        out.push(bits);
        return;
    }
    match node {
        NodeRef::Empty => unreachable!(),
        NodeRef::Full => {
            // The whole remaining subtree is present; every sub-block of
            // size `target` within it counts as occupied. `bits` is
            // left-aligned to `width_bits`, so the free suffix bits sit
            // just above position `width_bits - target`.
            let remaining = target - depth;
            let shift = width_bits - target;
            for suffix in 0u128..(1u128 << remaining) {
                out.push(bits | (suffix << shift));
            }
        }
        NodeRef::Branch(idx) => {
            let n = arena.get(idx);
            let child_shift = width_bits - depth - 1;
            collect_occupied(arena, n.left, depth + 1, target, bits, width_bits, out);
            collect_occupied(
                arena,
                n.right,
                depth + 1,
                target,
                bits | (1u128 << child_shift),
                width_bits,
                out,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddress {
        IpAddress::from(std::net::Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn insert_merges_adjacent_blocks() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 31).unwrap();
        let mut b = IpSet::create(4);
        b.insert(v4(10, 0, 0, 2), 31).unwrap();
        a.union(&b).unwrap();
        let leaves = a.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].prefix, 30);
        assert_eq!(leaves[0].addr, v4(10, 0, 0, 0));
    }

    #[test]
    fn contains_matches_insert() {
        let mut set = IpSet::create(4);
        set.insert(v4(192, 0, 2, 0), 24).unwrap();
        assert!(set.contains(v4(192, 0, 2, 42)));
        assert!(!set.contains(v4(192, 0, 3, 1)));
    }

    #[test]
    fn union_count_inclusion_exclusion() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 24).unwrap();
        let mut b = IpSet::create(4);
        b.insert(v4(10, 0, 0, 128), 25).unwrap();

        let mut union = a.clone();
        union.union(&b).unwrap();
        let mut intersect = a.clone();
        intersect.intersect(&b).unwrap();

        let lhs = union.count() + intersect.count();
        let rhs = a.count() + b.count();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn difference_with_self_is_empty() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 24).unwrap();
        let b = a.clone();
        a.difference(&b).unwrap();
        assert_eq!(a.count(), AddressCount::ZERO);
    }

    #[test]
    fn remove_splits_interior_block() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 24).unwrap();
        a.remove(v4(10, 0, 0, 5), 32).unwrap();
        assert!(!a.contains(v4(10, 0, 0, 5)));
        assert!(a.contains(v4(10, 0, 0, 4)));
        assert!(a.contains(v4(10, 0, 0, 6)));
    }

    #[test]
    fn convert_round_trip() {
        let mut a = IpSet::create(4);
        a.insert(v4(192, 0, 2, 0), 24).unwrap();
        a.convert(16).unwrap();
        assert!(a.is_v6());
        let leaves = a.leaves();
        assert_eq!(leaves[0].prefix, 120);
        a.convert(4).unwrap();
        assert_eq!(a.leaves()[0], Cidr::new(v4(192, 0, 2, 0), 24));
    }

    #[test]
    fn mask_keeps_one_address_per_block() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 24).unwrap();
        a.mask(28).unwrap();
        // 16 /28 blocks inside a /24, one address each.
        assert_eq!(a.count().to_u128().unwrap(), 16);
    }

    #[test]
    fn mask_and_fill_refills_blocks() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 1), 32).unwrap();
        a.mask_and_fill(30).unwrap();
        assert!(a.contains(v4(10, 0, 0, 0)));
        assert!(a.contains(v4(10, 0, 0, 3)));
        assert_eq!(a.count().to_u128().unwrap(), 4);
    }

    #[test]
    fn mask_is_idempotent() {
        let mut a = IpSet::create(4);
        a.insert(v4(10, 0, 0, 0), 24).unwrap();
        a.mask(28).unwrap();
        let once = a.leaves();
        a.mask(28).unwrap();
        assert_eq!(a.leaves(), once);
    }

    #[test]
    fn mask_and_fill_treats_v4_mapped_and_pure_v6_content_uniformly() {
        let mut a = IpSet::create(16);
        // One address from a v4-mapped block, one from pure v6 space.
        a.insert(v4(10, 0, 0, 1).to_v6(), 128).unwrap();
        a.insert(IpAddress::V6(1), 128).unwrap(); // ::1
        a.mask_and_fill(126).unwrap();

        assert!(a.contains(v4(10, 0, 0, 0).to_v6()));
        assert!(a.contains(v4(10, 0, 0, 3).to_v6()));
        assert!(a.contains(IpAddress::V6(0)));
        assert!(a.contains(IpAddress::V6(3)));
        assert_eq!(a.count().to_u128().unwrap(), 8);
    }
}
