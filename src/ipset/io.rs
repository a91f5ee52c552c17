//! Binary serialization of an `IPset`, framed by the shared SiLK file
//! header (spec.md §6).
//!
//! On-disk shape: the header's `ipset` entry carries six 32-bit shape
//! constants (`child_per_node`, `leaf_count`, `leaf_size`, `node_count`,
//! `node_size`, `root_index`); the payload is `node_count` interior nodes
//! (each two big-endian `u32` child words) followed by `leaf_count` leaf
//! bytes. Each child word's top two bits tag what it points to: `00` an
//! interior node index, `01` a leaf index, `10` empty.
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::node::{Arena, Node, NodeRef};
use super::{IpSet, V6Policy};
use crate::error::{Error, Result};
use crate::header::{FileHeader, HeaderEntry};
use crate::ip::Cidr;

// SiLK distinguishes an IPv4-only IPset file from one that may carry IPv6
// content by file_format rather than by a field in the ipset header entry
// (spec.md §6 defines the entry's six shape constants but not a width
// field, matching the real format: width is carried by file_format).
const FILE_FORMAT_IPSET_V4: u8 = 0x0A;
const FILE_FORMAT_IPSET_V6: u8 = 0x0B;
const WRITER_VERSION: u32 = 1;

const TAG_NODE: u32 = 0b00 << 30;
const TAG_LEAF: u32 = 0b01 << 30;
const TAG_EMPTY: u32 = 0b10 << 30;
const TAG_MASK: u32 = 0b11 << 30;
const PAYLOAD_MASK: u32 = !TAG_MASK;

struct Compacted {
    nodes: Vec<(u32, u32)>,
    leaf_count: u32,
    root_word: u32,
}

fn compact(arena: &Arena, root: NodeRef) -> Compacted {
    let mut nodes = Vec::new();
    let mut leaf_count = 0u32;
    let root_word = compact_rec(arena, root, &mut nodes, &mut leaf_count);
    Compacted {
        nodes,
        leaf_count,
        root_word,
    }
}

fn compact_rec(
    arena: &Arena,
    node: NodeRef,
    out_nodes: &mut Vec<(u32, u32)>,
    leaf_count: &mut u32,
) -> u32 {
    match node {
        NodeRef::Empty => TAG_EMPTY,
        NodeRef::Full => {
            let idx = *leaf_count;
            *leaf_count += 1;
            TAG_LEAF | idx
        }
        NodeRef::Branch(idx) => {
            let n = arena.get(idx);
            let left = compact_rec(arena, n.left, out_nodes, leaf_count);
            let right = compact_rec(arena, n.right, out_nodes, leaf_count);
            let node_idx = out_nodes.len() as u32;
            out_nodes.push((left, right));
            TAG_NODE | node_idx
        }
    }
}

fn expand(nodes: &[(u32, u32)], root_word: u32) -> (Arena, NodeRef) {
    let mut arena = Arena::default();
    let root = expand_rec(nodes, root_word, &mut arena);
    (arena, root)
}

fn expand_rec(nodes: &[(u32, u32)], word: u32, arena: &mut Arena) -> NodeRef {
    match word & TAG_MASK {
        TAG_EMPTY => NodeRef::Empty,
        TAG_LEAF => NodeRef::Full,
        TAG_NODE => {
            let (left_word, right_word) = nodes[(word & PAYLOAD_MASK) as usize];
            let left = expand_rec(nodes, left_word, arena);
            let right = expand_rec(nodes, right_word, arena);
            arena.push(Node { left, right })
        }
        _ => NodeRef::Empty,
    }
}

impl IpSet {
    /// Serialize the set, header included, to `w`.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let compacted = compact(&self.arena, self.root);
        let file_format = if self.width == 16 {
            FILE_FORMAT_IPSET_V6
        } else {
            FILE_FORMAT_IPSET_V4
        };
        let mut header = FileHeader::new(
            file_format,
            crate::header::MODERN_FILE_VERSION,
            WRITER_VERSION,
        );
        header.push(HeaderEntry::Ipset {
            child_per_node: 2,
            leaf_count: compacted.leaf_count,
            leaf_size: 1,
            node_count: compacted.nodes.len() as u32,
            node_size: 8,
            root_index: compacted.root_word,
        });
        header.write(w)?;
        for (left, right) in &compacted.nodes {
            w.write_u32::<BigEndian>(*left)?;
            w.write_u32::<BigEndian>(*right)?;
        }
        for _ in 0..compacted.leaf_count {
            w.write_u8(1)?;
        }
        Ok(())
    }

    /// Deserialize a set, header included, from `r`.
    pub fn read<R: Read>(r: &mut R) -> Result<IpSet> {
        let header = FileHeader::read(r)?;
        let width = match header.start.file_format {
            FILE_FORMAT_IPSET_V4 => 4,
            FILE_FORMAT_IPSET_V6 => 16,
            _ => return Err(Error::BadFormat),
        };
        let (node_count, leaf_count, root_word) = match header.find_ipset_entry() {
            Some(HeaderEntry::Ipset {
                node_count,
                leaf_count,
                root_index,
                ..
            }) => (*node_count, *leaf_count, *root_index),
            _ => return Err(Error::BadFormat),
        };
        let mut nodes = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let left = r.read_u32::<BigEndian>()?;
            let right = r.read_u32::<BigEndian>()?;
            nodes.push((left, right));
        }
        for _ in 0..leaf_count {
            r.read_u8()?;
        }
        let (arena, root) = expand(&nodes, root_word);
        Ok(IpSet {
            width,
            arena,
            root,
            auto_convert: true,
        })
    }

    /// Read an IPset file and visit each CIDR block via `entry_cb`, in
    /// ascending address order, without ever materializing a full `IpSet`
    /// (no `Arena`, no canonicalization pass, no `Vec<Cidr>` of leaves).
    /// `init_cb` is called once, after the header is parsed, with the set's
    /// width. `entry_cb` receives each leaf, already adjusted for
    /// `v6_policy`.
    pub fn process_stream<R: Read>(
        r: &mut R,
        mut init_cb: impl FnMut(IpSetStreamInfo),
        mut entry_cb: impl FnMut(Cidr),
        v6_policy: V6Policy,
    ) -> Result<()> {
        let header = FileHeader::read(r)?;
        let width = match header.start.file_format {
            FILE_FORMAT_IPSET_V4 => 4u8,
            FILE_FORMAT_IPSET_V6 => 16u8,
            _ => return Err(Error::BadFormat),
        };
        let (node_count, leaf_count, root_word) = match header.find_ipset_entry() {
            Some(HeaderEntry::Ipset {
                node_count,
                leaf_count,
                root_index,
                ..
            }) => (*node_count, *leaf_count, *root_index),
            _ => return Err(Error::BadFormat),
        };
        init_cb(IpSetStreamInfo { width });

        let mut nodes = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            let left = r.read_u32::<BigEndian>()?;
            let right = r.read_u32::<BigEndian>()?;
            nodes.push((left, right));
        }
        for _ in 0..leaf_count {
            r.read_u8()?;
        }

        let shape = StreamShape {
            width,
            width_bits: width * 8,
            v6_policy,
        };
        stream_walk_rec(&nodes, root_word, 0, 0, &shape, &mut entry_cb);
        Ok(())
    }
}

/// The metadata `process_stream`'s `init_cb` is called with, before any
/// entries are visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpSetStreamInfo {
    /// The set's key width in octets (4 or 16).
    pub width: u8,
}

struct StreamShape {
    width: u8,
    width_bits: u8,
    v6_policy: V6Policy,
}

fn stream_walk_rec(
    nodes: &[(u32, u32)],
    word: u32,
    depth: u8,
    bits: u128,
    shape: &StreamShape,
    entry_cb: &mut impl FnMut(Cidr),
) {
    match word & TAG_MASK {
        TAG_EMPTY => {}
        TAG_LEAF => {
            let addr_bits = if depth == 0 {
                0
            } else {
                bits << (shape.width_bits - depth)
            };
            let addr = if shape.width == 4 {
                crate::ip::IpAddress::V4(addr_bits as u32)
            } else {
                crate::ip::IpAddress::V6(addr_bits)
            };
            let cidr = match shape.v6_policy {
                V6Policy::ForceV6 if shape.width == 4 => Cidr {
                    addr: addr.to_v6(),
                    prefix: depth + 96,
                },
                _ => Cidr {
                    addr,
                    prefix: depth,
                },
            };
            entry_cb(cidr);
        }
        TAG_NODE => {
            let (left_word, right_word) = nodes[(word & PAYLOAD_MASK) as usize];
            stream_walk_rec(nodes, left_word, depth + 1, bits << 1, shape, entry_cb);
            stream_walk_rec(
                nodes,
                right_word,
                depth + 1,
                (bits << 1) | 1,
                shape,
                entry_cb,
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpAddress;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn round_trip_v4_set() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0xC000_0200), 24).unwrap();
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();
        let read_back = IpSet::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.leaves(), set.leaves());
        assert_eq!(read_back.width(), 4);
    }

    #[test]
    fn round_trip_v6_set() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0xC000_0200), 24).unwrap();
        set.convert(16).unwrap();
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();
        let read_back = IpSet::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.leaves(), set.leaves());
        assert_eq!(read_back.width(), 16);
    }

    #[test]
    fn round_trip_empty_set() {
        let set = IpSet::create(4);
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();
        let read_back = IpSet::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.count(), set.count());
    }

    #[test]
    fn process_stream_visits_the_same_leaves_as_read() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0x0A00_0000), 24).unwrap(); // 10.0.0.0/24
        set.insert(IpAddress::V4(0xC000_0200), 32).unwrap(); // 192.0.2.0/32
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();

        let mut info = None;
        let mut entries = Vec::new();
        IpSet::process_stream(
            &mut Cursor::new(buf),
            |i| info = Some(i),
            |cidr| entries.push(cidr),
            super::super::V6Policy::AsIs,
        )
        .unwrap();

        assert_eq!(info, Some(IpSetStreamInfo { width: 4 }));
        assert_eq!(entries, set.leaves());
    }

    #[test]
    fn process_stream_force_v6_maps_v4_entries() {
        let mut set = IpSet::create(4);
        set.insert(IpAddress::V4(0x0A00_0000), 24).unwrap();
        let mut buf = Vec::new();
        set.write(&mut buf).unwrap();

        let mut entries = Vec::new();
        IpSet::process_stream(
            &mut Cursor::new(buf),
            |_| {},
            |cidr| entries.push(cidr),
            super::super::V6Policy::ForceV6,
        )
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prefix, 120);
        assert_eq!(entries[0].addr, IpAddress::V4(0x0A00_0000).to_v6());
    }
}
