//! End-to-end scenarios exercising whole-operation sequences across the
//! public API, rather than one function in isolation.

use std::io::Cursor;

use test_log::test;

use netflow_core::{
    Bag, CircBuf, CounterType, Error, FieldKind, IpAddress, IpSet, KeyTypeTag, SampleMode, TypedKey,
};

#[test]
fn ipset_union_merges_adjacent_blocks_into_one_leaf() {
    let mut a = IpSet::create(4);
    a.insert(IpAddress::V4(0x0A00_0000), 31).unwrap(); // 10.0.0.0/31
    let mut b = IpSet::create(4);
    b.insert(IpAddress::V4(0x0A00_0002), 31).unwrap(); // 10.0.0.2/31

    a.union(&b).unwrap();

    let leaves = a.leaves();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].addr, IpAddress::V4(0x0A00_0000));
    assert_eq!(leaves[0].prefix, 30);
}

#[test]
fn bag_add_overflow_callback_clamps_to_counter_max() {
    const COUNTER_MAX: u64 = u64::MAX - 1;

    let mut dst = Bag::create_typed(FieldKind::Ipv4, CounterType::Records, 4, 0).unwrap();
    dst.counter_set(TypedKey::U32(0x0102_0304), COUNTER_MAX - 10)
        .unwrap();

    let mut src = Bag::create_typed(FieldKind::Ipv4, CounterType::Records, 4, 0).unwrap();
    src.counter_set(TypedKey::U32(0x0102_0304), 20).unwrap();

    dst.add_bag(
        &src,
        Some(|_key: TypedKey, _dest: u64, _src: u64| Ok(COUNTER_MAX)),
    )
    .unwrap();

    assert_eq!(dst.counter_get(TypedKey::U32(0x0102_0304)), COUNTER_MAX);
}

#[test]
fn ipset_ratio_sample_is_reproducible_given_the_same_seed() {
    let mut set = IpSet::create(4);
    set.insert(IpAddress::V4(0x0A00_0000), 24).unwrap(); // 10.0.0.0/24, 256 addresses

    let a = set.sample(SampleMode::Ratio(0.25), 1);
    let b = set.sample(SampleMode::Ratio(0.25), 1);
    assert_eq!(a.leaves(), b.leaves());

    let n = a.count().to_u128().unwrap();
    assert!(n > 0 && n < 256, "expected a partial sample, got {n}");
}

#[test]
fn bag_promotes_key_width_then_iterates_in_ascending_order() {
    let mut bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 2, 0).unwrap();
    bag.counter_add(TypedKey::U16(80), 1).unwrap();
    bag.counter_add(TypedKey::U16(443), 1).unwrap();

    bag.counter_add(TypedKey::IpAddr(IpAddress::V4(0x0102_0304)), 1)
        .unwrap();
    assert_eq!(bag.key_octets(), 4);

    let mut iter = bag.iterator_create();
    let mut seen = Vec::new();
    while let Some((key, counter)) = bag.iterator_next_typed(&mut iter, KeyTypeTag::Any).unwrap() {
        let TypedKey::U32(v) = key else {
            panic!("expected natural U32 keys from a 4-octet bag")
        };
        seen.push(v);
        assert_eq!(counter.value, 1);
    }
    assert_eq!(seen, vec![80, 443, 0x0102_0304]);
    assert_eq!(0x0102_0304u32, 16909060);
}

#[test]
fn circbuf_stop_drains_then_reports_stopped() {
    let buf = CircBuf::create(4096, 0).unwrap();
    for payload in [b"aaa", b"bbb", b"ccc"] {
        let mut block = buf.get_write_block(3, false).unwrap();
        block.as_mut_slice().copy_from_slice(payload);
        buf.commit_write_block(block, 3).unwrap();
    }

    let first = buf.get_read_block(false).unwrap();
    assert_eq!(first.as_slice(), b"aaa");
    buf.release_read_block().unwrap();

    buf.stop();

    let second = buf.get_read_block(false).unwrap();
    assert_eq!(second.as_slice(), b"bbb");
    buf.release_read_block().unwrap();

    let third = buf.get_read_block(false).unwrap();
    assert_eq!(third.as_slice(), b"ccc");
    buf.release_read_block().unwrap();

    assert!(matches!(
        buf.get_read_block(false).unwrap_err(),
        Error::Stopped
    ));
    assert!(matches!(
        buf.get_write_block(3, false).unwrap_err(),
        Error::Stopped
    ));

    buf.destroy();
}

#[test]
fn ipset_round_trips_across_v4_and_v6_widths() {
    let mut set = IpSet::create(4);
    set.insert(IpAddress::V4(0xC000_0200), 24).unwrap(); // 192.0.2.0/24

    let mut buf = Vec::new();
    set.write(&mut buf).unwrap();
    let read_back = IpSet::read(&mut Cursor::new(buf)).unwrap();
    assert_eq!(read_back.leaves(), set.leaves());

    let mut v6 = read_back;
    v6.convert(16).unwrap();
    let mut buf6 = Vec::new();
    v6.write(&mut buf6).unwrap();
    let read_back6 = IpSet::read(&mut Cursor::new(buf6)).unwrap();
    assert!(read_back6.contains(IpAddress::V4(0xC000_0200).to_v6()));

    let mut back_to_v4 = read_back6;
    back_to_v4.convert(4).unwrap();
    assert_eq!(back_to_v4.leaves(), set.leaves());
}
