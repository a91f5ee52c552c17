//! Binary serialization of a Bag, framed by the shared file header
//! (spec.md §6): a `Bag` header entry carrying the field types and
//! widths, followed by `(key, counter)` pairs in ascending key order, each
//! `key_length + counter_length` bytes, big-endian, until end-of-stream.
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::field::FieldKind;
use super::{Bag, CounterType};
use crate::error::{Error, Result};
use crate::header::{FileHeader, HeaderEntry};

const FILE_FORMAT_BAG: u8 = 0x0C;
const WRITER_VERSION: u32 = 1;

impl Bag {
    /// Serialize the bag, header included, to `w`.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut header = FileHeader::new(
            FILE_FORMAT_BAG,
            crate::header::MODERN_FILE_VERSION,
            WRITER_VERSION,
        );
        header.push(HeaderEntry::Bag {
            key_type: self.key_field.to_tag(),
            key_length: self.key_octets as u16,
            counter_type: self.counter_field.to_tag(),
            counter_length: 8,
        });
        header.write(w)?;
        for (&key, &counter) in &self.counters {
            match self.key_octets {
                1 => w.write_u8(key as u8)?,
                2 => w.write_u16::<BigEndian>(key as u16)?,
                4 => w.write_u32::<BigEndian>(key as u32)?,
                16 => w.write_u128::<BigEndian>(key)?,
                other => return Err(Error::input(format!("unsupported key width {other}"))),
            }
            w.write_u64::<BigEndian>(counter)?;
        }
        Ok(())
    }

    /// Deserialize a bag, header included, from `r`.
    pub fn read<R: Read>(r: &mut R) -> Result<Bag> {
        let header = FileHeader::read(r)?;
        if header.start.file_format != FILE_FORMAT_BAG {
            return Err(Error::BadFormat);
        }
        let (key_type, key_length, counter_type, counter_length) = match header.find_bag_entry() {
            Some(HeaderEntry::Bag {
                key_type,
                key_length,
                counter_type,
                counter_length,
            }) => (*key_type, *key_length, *counter_type, *counter_length),
            _ => return Err(Error::BadFormat),
        };
        if counter_length != 8 {
            return Err(Error::BadFormat);
        }
        let key_octets = key_length as u8;
        let mut bag = Bag::create_typed(
            FieldKind::from_tag(key_type),
            CounterType::from_tag(counter_type),
            key_octets,
            8,
        )?;
        loop {
            let key = match key_octets {
                1 => match r.read_u8() {
                    Ok(v) => v as u128,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                },
                2 => match r.read_u16::<BigEndian>() {
                    Ok(v) => v as u128,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                },
                4 => match r.read_u32::<BigEndian>() {
                    Ok(v) => v as u128,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                },
                16 => match r.read_u128::<BigEndian>() {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                },
                other => return Err(Error::input(format!("unsupported key width {other}"))),
            };
            let counter = r.read_u64::<BigEndian>()?;
            bag.counters.insert(key, counter);
        }
        Ok(bag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::TypedKey;
    use crate::ip::IpAddress;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn round_trip_preserves_every_pair() {
        let mut bag = Bag::create_typed(FieldKind::Ipv4, CounterType::SumBytes, 0, 0).unwrap();
        bag.counter_set(TypedKey::IpAddr(IpAddress::V4(1)), 10)
            .unwrap();
        bag.counter_set(TypedKey::IpAddr(IpAddress::V4(2)), 20)
            .unwrap();
        let mut buf = Vec::new();
        bag.write(&mut buf).unwrap();
        let read_back = Bag::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.counters, bag.counters);
        assert_eq!(read_back.key_octets(), bag.key_octets());
        assert_eq!(read_back.counter_type(), bag.counter_type());
    }

    #[test]
    fn round_trip_empty_bag() {
        let bag = Bag::create_typed(FieldKind::Port, CounterType::Records, 0, 0).unwrap();
        let mut buf = Vec::new();
        bag.write(&mut buf).unwrap();
        let read_back = Bag::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.count_keys(), 0);
    }
}
