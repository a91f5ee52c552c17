//! A typed map from integer or IP keys to saturating 64-bit counters
//! (spec.md §4.3), grounded on
//! `original_source/silk-src/src/libsilk/skbag.h`.
//!
//! The C implementation stores keys in a fixed-depth byte-fanout tree,
//! one level per key octet. Since the widest key is 16 octets, any key
//! value fits in a `u128`; a `BTreeMap<u128, u64>` gives the same
//! ascending-order traversal as that tree without reimplementing it node
//! by node — the same simplification made for the IPset radix tree in
//! `ipset::node`.
pub mod field;

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use field::FieldKind;

use crate::error::{Error, Result};
use crate::ip::IpAddress;

mod io;

/// Value the counter may never exceed (spec.md §3, §4.3).
pub const COUNTER_MAX: u64 = u64::MAX - 1;

/// What a Bag's counter represents, independent of its storage width.
///
/// Counter width is always 8 octets in the current format (spec.md §4.3);
/// this tag only carries the counter's *semantic* meaning, written to the
/// file header's `Bag` entry so readers can tell a flow-count bag from a
/// byte-sum bag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterType {
    /// Number of flow records.
    Records,
    /// Sum of packet counts.
    SumPackets,
    /// Sum of byte counts.
    SumBytes,
    /// Sum of flow durations.
    SumElapsed,
    /// Caller-defined counter semantics.
    Custom(u16),
}

impl CounterType {
    pub(crate) fn to_tag(self) -> u16 {
        match self {
            CounterType::Records => 0,
            CounterType::SumPackets => 1,
            CounterType::SumBytes => 2,
            CounterType::SumElapsed => 3,
            CounterType::Custom(tag) => tag,
        }
    }

    pub(crate) fn from_tag(tag: u16) -> CounterType {
        match tag {
            0 => CounterType::Records,
            1 => CounterType::SumPackets,
            2 => CounterType::SumBytes,
            3 => CounterType::SumElapsed,
            other => CounterType::Custom(other),
        }
    }
}

/// The storage type of a `TypedKey`, used to request a specific
/// representation from `iterator_next_typed` (`Any` asks for the bag's
/// natural type).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTypeTag {
    Any,
    U8,
    U16,
    U32,
    IpAddr,
}

/// A key value tagged with its storage representation (`skBagTypedKey_t`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypedKey {
    U8(u8),
    U16(u16),
    U32(u32),
    IpAddr(IpAddress),
}

impl TypedKey {
    pub fn type_tag(self) -> KeyTypeTag {
        match self {
            TypedKey::U8(_) => KeyTypeTag::U8,
            TypedKey::U16(_) => KeyTypeTag::U16,
            TypedKey::U32(_) => KeyTypeTag::U32,
            TypedKey::IpAddr(_) => KeyTypeTag::IpAddr,
        }
    }

    /// The key octet width this value requires (spec.md §4.3's
    /// auto-promotion rule: 1, 2, 4, or 16, never 8).
    fn required_octets(self) -> u8 {
        match self {
            TypedKey::U8(_) => 1,
            TypedKey::U16(_) => 2,
            TypedKey::U32(_) => 4,
            TypedKey::IpAddr(IpAddress::V4(_)) => 4,
            TypedKey::IpAddr(IpAddress::V6(_)) => 16,
        }
    }
}

/// A counter value tagged with its semantic type (`skBagTypedCounter_t`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedCounter {
    pub counter_type: CounterType,
    pub value: u64,
}

/// A typed key → 64-bit-counter map with auto-promoting key width.
#[derive(Clone, Debug)]
pub struct Bag {
    key_field: FieldKind,
    counter_field: CounterType,
    key_octets: u8,
    auto_convert: bool,
    counters: BTreeMap<u128, u64>,
    /// Bumped every time `key_octets` changes, so outstanding iterators can
    /// detect they've been invalidated (spec.md §4.3, §7 `MODIFIED`).
    generation: u64,
}

fn max_value_for_octets(octets: u8) -> u128 {
    if octets >= 16 {
        u128::MAX
    } else {
        (1u128 << (8 * octets as u32)) - 1
    }
}

/// Reconstruct the natural typed key for a raw value stored at `key_octets`
/// (IPADDR for a 16-octet bag, U32 otherwise — spec.md §4.3).
fn natural_typed_key(raw: u128, key_octets: u8) -> TypedKey {
    if key_octets == 16 {
        TypedKey::IpAddr(IpAddress::V6(raw))
    } else {
        TypedKey::U32(raw as u32)
    }
}

/// Encode a typed key as the raw value stored at `target_octets`. The
/// caller is responsible for ensuring `target_octets` is wide enough for
/// `key` (`TypedKey::required_octets`).
fn encode_key(key: TypedKey, target_octets: u8) -> u128 {
    match key {
        TypedKey::U8(v) => v as u128,
        TypedKey::U16(v) => v as u128,
        TypedKey::U32(v) => v as u128,
        TypedKey::IpAddr(addr) => {
            if target_octets == 16 {
                addr.to_v6().as_u128()
            } else {
                match addr {
                    IpAddress::V4(v) => v as u128,
                    IpAddress::V6(_) => unreachable!("required_octets ensures v6 needs width 16"),
                }
            }
        }
    }
}

impl Bag {
    /// Allocate an empty Bag with the given field types and widths.
    /// `key_octets == 0` uses `key_type`'s default; `counter_octets == 0`
    /// uses the (only) default of 8. A nonzero `counter_octets != 8` is
    /// rejected since counters are always 8 octets in this format.
    pub fn create_typed(
        key_type: FieldKind,
        counter_type: CounterType,
        key_octets: u8,
        counter_octets: u8,
    ) -> Result<Bag> {
        let key_octets = if key_octets == 0 {
            key_type
                .default_key_octets()
                .ok_or_else(|| Error::input("custom key field requires an explicit key_octets"))?
        } else {
            match key_octets {
                1 | 2 | 4 | 16 => key_octets,
                _ => return Err(Error::input("key_octets must be 1, 2, 4, or 16")),
            }
        };
        if counter_octets != 0 && counter_octets != 8 {
            return Err(Error::input("counter_octets must be 0 or 8"));
        }
        Ok(Bag {
            key_field: key_type,
            counter_field: counter_type,
            key_octets,
            auto_convert: true,
            counters: BTreeMap::new(),
            generation: 0,
        })
    }

    /// Build a Bag by folding an iterator of flow records: `key_field`
    /// selects which record field keys the Bag, `counter_type` selects
    /// which field accumulates into the counter (`Records` adds 1 per
    /// record regardless of its own value).
    pub fn from_records<R: crate::record::FlowRecord>(
        records: impl IntoIterator<Item = R>,
        key_field: field::RecordKeyField,
        counter_type: CounterType,
    ) -> Result<Bag> {
        use field::RecordKeyField;
        let mut bag = Bag::create_typed(key_field.field_kind(), counter_type, 0, 0)?;
        for record in records {
            let key = match key_field {
                RecordKeyField::SrcIp => TypedKey::IpAddr(record.src_ip()),
                RecordKeyField::DstIp => TypedKey::IpAddr(record.dst_ip()),
                RecordKeyField::SrcPort => TypedKey::U16(record.src_port()),
                RecordKeyField::DstPort => TypedKey::U16(record.dst_port()),
                RecordKeyField::Protocol => TypedKey::U8(record.protocol()),
            };
            let delta = match counter_type {
                CounterType::Records => 1,
                CounterType::SumPackets => record.packets(),
                CounterType::SumBytes => record.bytes(),
                CounterType::SumElapsed => record.duration_ms() as u64,
                CounterType::Custom(_) => 1,
            };
            bag.counter_add(key, delta)?;
        }
        Ok(bag)
    }

    pub fn key_octets(&self) -> u8 {
        self.key_octets
    }

    pub fn key_type(&self) -> FieldKind {
        self.key_field
    }

    pub fn counter_type(&self) -> CounterType {
        self.counter_field
    }

    pub fn set_auto_convert(&mut self, enabled: bool) {
        self.auto_convert = enabled;
    }

    pub fn auto_convert(&self) -> bool {
        self.auto_convert
    }

    /// Number of keys with a nonzero counter.
    pub fn count_keys(&self) -> u64 {
        self.counters.len() as u64
    }

    /// Widen the bag to hold `new_octets`-wide keys, remapping existing
    /// entries. The only nontrivial remap is 4→16 on an address field: a bag
    /// holding IPv4 keys has those keys reinterpreted as IPv4 addresses and
    /// mapped into `::ffff:a.b.c.d` (spec.md §9's promotion note; mirrors
    /// `skBagAutoConvertEnable`'s doc comment on IPv6 insertion). Non-address
    /// fields (ports, protocols, custom) just keep their numeric value under
    /// the wider width.
    fn widen_to(&mut self, new_octets: u8) {
        if new_octets == self.key_octets {
            return;
        }
        debug!(from = self.key_octets, to = new_octets, "bag widen_to");
        let is_addr_field = matches!(self.key_field, FieldKind::Ipv4 | FieldKind::Ipv6);
        if new_octets == 16 && self.key_octets <= 4 && is_addr_field {
            let old = std::mem::take(&mut self.counters);
            for (k, v) in old {
                let mapped = IpAddress::V4(k as u32).to_v6().as_u128();
                self.counters.insert(mapped, v);
            }
        }
        self.key_octets = new_octets;
        self.generation += 1;
    }

    /// Narrow the bag to `new_octets`, dropping keys that no longer fit. A
    /// 16→≤4 narrowing of an address field keeps only addresses within
    /// `::ffff:0:0/96`, converted down to their 32-bit form; other
    /// narrowings (and non-address fields) drop keys numerically above the
    /// new maximum.
    fn narrow_to(&mut self, new_octets: u8) {
        if new_octets == self.key_octets {
            return;
        }
        debug!(from = self.key_octets, to = new_octets, "bag narrow_to");
        let old = std::mem::take(&mut self.counters);
        let is_addr_field = matches!(self.key_field, FieldKind::Ipv4 | FieldKind::Ipv6);
        let was_v6_addr = self.key_octets == 16 && is_addr_field;
        for (k, v) in old {
            let kept = if was_v6_addr && new_octets <= 4 {
                IpAddress::V6(k).to_v4().ok().map(IpAddress::as_u128)
            } else if k <= max_value_for_octets(new_octets) {
                Some(k)
            } else {
                None
            };
            if let Some(k) = kept {
                self.counters.insert(k, v);
            }
        }
        self.key_octets = new_octets;
        self.generation += 1;
    }

    fn resize_to(&mut self, new_octets: u8) {
        if new_octets > self.key_octets {
            self.widen_to(new_octets);
        } else if new_octets < self.key_octets {
            self.narrow_to(new_octets);
        }
    }

    /// Change the bag's field types and/or widths in place. Shrinking the
    /// key drops keys that no longer fit (spec.md §4.3).
    pub fn modify(
        &mut self,
        key_type: FieldKind,
        counter_type: CounterType,
        key_octets: u8,
        counter_octets: u8,
    ) -> Result<()> {
        if counter_octets != 0 && counter_octets != 8 {
            return Err(Error::input("counter_octets must be 0 or 8"));
        }
        let key_octets = if key_octets == 0 {
            key_type.default_key_octets().unwrap_or(self.key_octets)
        } else {
            match key_octets {
                1 | 2 | 4 | 16 => key_octets,
                _ => return Err(Error::input("key_octets must be 1, 2, 4, or 16")),
            }
        };
        self.key_field = key_type;
        self.counter_field = counter_type;
        self.resize_to(key_octets);
        Ok(())
    }

    /// Deep copy.
    pub fn copy(&self) -> Bag {
        self.clone()
    }

    /// Value currently stored for `key`, or 0 if absent or if `key` is too
    /// wide for this bag's current key width.
    pub fn counter_get(&self, key: TypedKey) -> u64 {
        if key.required_octets() > self.key_octets {
            return 0;
        }
        let raw = encode_key(key, self.key_octets);
        self.counters.get(&raw).copied().unwrap_or(0)
    }

    /// Set `key`'s counter. `value == 0` removes the key; otherwise
    /// inserts or overwrites. May promote the key width.
    pub fn counter_set(&mut self, key: TypedKey, value: u64) -> Result<()> {
        let required = key.required_octets();
        if required > self.key_octets {
            if !self.auto_convert {
                return Err(Error::KeyRange);
            }
            self.widen_to(required);
        }
        let raw = encode_key(key, self.key_octets);
        if value == 0 {
            self.counters.remove(&raw);
        } else {
            self.counters.insert(raw, value);
        }
        Ok(())
    }

    /// Add `delta` to `key`'s counter, inserting it if absent. Returns the
    /// new counter value, or `OP_BOUNDS` leaving the counter unchanged on
    /// overflow past `COUNTER_MAX`.
    pub fn counter_add(&mut self, key: TypedKey, delta: u64) -> Result<u64> {
        let required = key.required_octets();
        if required > self.key_octets {
            if !self.auto_convert {
                return Err(Error::KeyRange);
            }
            self.widen_to(required);
        }
        let raw = encode_key(key, self.key_octets);
        let current = self.counters.get(&raw).copied().unwrap_or(0);
        let new = current
            .checked_add(delta)
            .filter(|&v| v <= COUNTER_MAX)
            .ok_or(Error::OpBounds)?;
        if new == 0 {
            self.counters.remove(&raw);
        } else {
            self.counters.insert(raw, new);
        }
        Ok(new)
    }

    /// Subtract `delta` from `key`'s counter. Succeeds with 0 if `delta ==
    /// 0` and `key` is absent; otherwise `key` must exist (an absent key
    /// with nonzero `delta` is an out-of-bounds subtraction, not a missing
    /// key, per `skBagCounterSubtract`'s doc comment) and the subtraction
    /// must not underflow.
    pub fn counter_subtract(&mut self, key: TypedKey, delta: u64) -> Result<u64> {
        let raw = if key.required_octets() <= self.key_octets {
            Some(encode_key(key, self.key_octets))
        } else {
            None
        };
        let current = raw.and_then(|r| self.counters.get(&r).copied());
        match current {
            None if delta == 0 => Ok(0),
            None => Err(Error::OpBounds),
            Some(c) => {
                let new = c.checked_sub(delta).ok_or(Error::OpBounds)?;
                let raw = raw.unwrap();
                if new == 0 {
                    self.counters.remove(&raw);
                } else {
                    self.counters.insert(raw, new);
                }
                Ok(new)
            }
        }
    }

    /// Add every `(key, counter)` pair of `src` to `self`. When an add
    /// overflows and `bounds_cb` is `Some`, it is invoked with `(key,
    /// dest_counter_before, src_counter)` and must return the counter to
    /// store, or an error to abort the merge. With `bounds_cb == None`, an
    /// overflow aborts with `OP_BOUNDS`.
    pub fn add_bag<F>(&mut self, src: &Bag, mut bounds_cb: Option<F>) -> Result<()>
    where
        F: FnMut(TypedKey, u64, u64) -> Result<u64>,
    {
        for (&raw, &src_counter) in &src.counters {
            let key = natural_typed_key(raw, src.key_octets);
            match self.counter_add(key, src_counter) {
                Ok(_) => {}
                Err(Error::OpBounds) => match &mut bounds_cb {
                    Some(cb) => {
                        let dest_counter = self.counter_get(key);
                        let replacement = cb(key, dest_counter, src_counter)?;
                        self.counter_set(key, replacement)?;
                    }
                    None => return Err(Error::OpBounds),
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Ascending-key iterator.
    pub fn iterator_create(&self) -> BagIterator {
        BagIterator {
            keys: self.counters.keys().copied().collect(),
            pos: 0,
            generation_at_creation: self.generation,
        }
    }

    /// Arbitrary-but-stable-for-this-iterator order (spec.md §9's Open
    /// Question: resolved as "traversal order of the tree at iterator
    /// construction", approximated here by snapshotting through a hash
    /// table so the order differs from the sorted iterator's).
    pub fn iterator_create_unsorted(&self) -> BagIterator {
        let scrambled: HashMap<u128, ()> = self.counters.keys().map(|&k| (k, ())).collect();
        BagIterator {
            keys: scrambled.into_keys().collect(),
            pos: 0,
            generation_at_creation: self.generation,
        }
    }

    /// Advance `iter` and return the next entry, converted to `want`'s
    /// representation (`KeyTypeTag::Any` picks the bag's natural type).
    /// Entries that can't be represented as `want` are skipped (e.g. a
    /// non-mapped IPv6 key when `want == U32`). Returns `Err(Modified)` if
    /// the bag's key width has changed since `iter` was created.
    pub fn iterator_next_typed(
        &self,
        iter: &mut BagIterator,
        want: KeyTypeTag,
    ) -> Result<Option<(TypedKey, TypedCounter)>> {
        if iter.generation_at_creation != self.generation {
            return Err(Error::Modified);
        }
        while iter.pos < iter.keys.len() {
            let raw = iter.keys[iter.pos];
            iter.pos += 1;
            let Some(typed_key) = self.convert_raw_key(raw, want) else {
                continue;
            };
            let value = self.counters.get(&raw).copied().unwrap_or(0);
            return Ok(Some((
                typed_key,
                TypedCounter {
                    counter_type: self.counter_field,
                    value,
                },
            )));
        }
        Ok(None)
    }

    fn convert_raw_key(&self, raw: u128, want: KeyTypeTag) -> Option<TypedKey> {
        match want {
            KeyTypeTag::Any => Some(natural_typed_key(raw, self.key_octets)),
            KeyTypeTag::U8 => Some(TypedKey::U8(raw as u8)),
            KeyTypeTag::U16 => Some(TypedKey::U16(raw as u16)),
            KeyTypeTag::U32 => {
                if self.key_octets == 16 {
                    IpAddress::V6(raw).to_v4().ok().map(|v4| match v4 {
                        IpAddress::V4(v) => TypedKey::U32(v),
                        IpAddress::V6(_) => unreachable!("to_v4 always returns V4"),
                    })
                } else {
                    Some(TypedKey::U32(raw as u32))
                }
            }
            KeyTypeTag::IpAddr => Some(TypedKey::IpAddr(if self.key_octets == 16 {
                IpAddress::V6(raw)
            } else {
                IpAddress::V4(raw as u32)
            })),
        }
    }
}

/// A snapshot-based iterator over a Bag's entries at the time of its
/// creation (spec.md §4.3; see `Bag::iterator_next_typed`).
pub struct BagIterator {
    keys: Vec<u128>,
    pos: usize,
    generation_at_creation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test]
    fn set_then_get_round_trips() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 0, 0).unwrap();
        bag.counter_set(TypedKey::U16(80), 5).unwrap();
        assert_eq!(bag.counter_get(TypedKey::U16(80)), 5);
    }

    #[test]
    fn setting_zero_removes_key() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 0, 0).unwrap();
        bag.counter_set(TypedKey::U16(80), 5).unwrap();
        bag.counter_set(TypedKey::U16(80), 0).unwrap();
        assert_eq!(bag.count_keys(), 0);
    }

    #[test]
    fn add_overflow_reports_op_bounds_and_leaves_counter_unchanged() {
        let mut bag = Bag::create_typed(FieldKind::Ipv4, CounterType::SumBytes, 0, 0).unwrap();
        let key = TypedKey::IpAddr(IpAddress::V4(0x0102_0304));
        bag.counter_set(key, COUNTER_MAX).unwrap();
        let err = bag.counter_add(key, 10).unwrap_err();
        assert!(matches!(err, Error::OpBounds));
        assert_eq!(bag.counter_get(key), COUNTER_MAX);
    }

    #[test]
    fn add_bag_overflow_invokes_callback() {
        let mut dst = Bag::create_typed(FieldKind::Ipv4, CounterType::SumBytes, 0, 0).unwrap();
        let mut src = Bag::create_typed(FieldKind::Ipv4, CounterType::SumBytes, 0, 0).unwrap();
        let key = TypedKey::IpAddr(IpAddress::V4(0x0102_0304));
        dst.counter_set(key, COUNTER_MAX - 10).unwrap();
        src.counter_set(key, 20).unwrap();
        dst.add_bag(
            &src,
            Some(|_k: TypedKey, _dst: u64, _src: u64| Ok(COUNTER_MAX)),
        )
        .unwrap();
        assert_eq!(dst.counter_get(key), COUNTER_MAX);
    }

    #[test]
    fn subtract_zero_from_absent_key_succeeds_with_zero() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 0, 0).unwrap();
        assert_eq!(bag.counter_subtract(TypedKey::U16(443), 0).unwrap(), 0);
    }

    #[test]
    fn promotion_then_sorted_iteration_is_ascending() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 2, 0).unwrap();
        bag.counter_set(TypedKey::U16(80), 1).unwrap();
        bag.counter_set(TypedKey::U16(443), 1).unwrap();
        bag.counter_set(TypedKey::IpAddr(IpAddress::V4(0x0102_0304)), 1)
            .unwrap();
        assert_eq!(bag.key_octets(), 4);

        let mut iter = bag.iterator_create();
        let mut seen = Vec::new();
        while let Some((key, _)) = bag.iterator_next_typed(&mut iter, KeyTypeTag::Any).unwrap() {
            match key {
                TypedKey::U32(v) => seen.push(v as u64),
                other => panic!("unexpected key variant: {other:?}"),
            }
        }
        assert_eq!(seen, vec![80, 443, 0x0102_0304]);
    }

    #[test]
    fn width_change_during_iteration_invalidates_iterator() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 2, 0).unwrap();
        bag.counter_set(TypedKey::U16(80), 1).unwrap();
        let mut iter = bag.iterator_create();
        bag.counter_set(TypedKey::IpAddr(IpAddress::V4(1)), 1)
            .unwrap();
        let err = bag
            .iterator_next_typed(&mut iter, KeyTypeTag::Any)
            .unwrap_err();
        assert!(matches!(err, Error::Modified));
    }

    #[test]
    fn key_range_rejected_when_auto_convert_disabled() {
        let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 2, 0).unwrap();
        bag.set_auto_convert(false);
        let err = bag
            .counter_set(TypedKey::IpAddr(IpAddress::V4(1)), 5)
            .unwrap_err();
        assert!(matches!(err, Error::KeyRange));
    }

    #[test]
    fn modify_shrink_drops_out_of_range_keys() {
        let mut bag = Bag::create_typed(FieldKind::Ipv4, CounterType::Records, 0, 0).unwrap();
        bag.counter_set(TypedKey::IpAddr(IpAddress::V4(300)), 1)
            .unwrap();
        bag.modify(FieldKind::Port, CounterType::Records, 1, 0)
            .unwrap();
        assert_eq!(bag.count_keys(), 0);
    }
}
