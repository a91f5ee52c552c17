//! The SiLK-compatible file header: a fixed 16-byte preamble followed by a
//! chain of typed, length-prefixed entries, terminated by an entry with ID
//! 0. All multi-byte header fields are big-endian on disk, independent of
//! the payload byte order recorded in `file_flags`.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// `0xDEADBEEF`, the fixed magic number every SiLK-compatible file starts
/// with.
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Minimum `file_version` for the modern extended header format.
pub const MODERN_FILE_VERSION: u8 = 16;

/// Environment variable that, when set to a non-empty value, forces
/// `writer_version` to 0 instead of this crate's own version tag.
pub const WRITER_VERSION_ENV: &str = "SILK_CLOBBER_WRITER_VERSION";

/// Bit 0 of `file_flags`: set means the payload is big-endian.
const FLAG_BIG_ENDIAN: u8 = 0x01;

/// The byte order of the payload records described by a file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// Payload records are big-endian.
    BigEndian,
    /// Payload records are little-endian.
    LittleEndian,
}

/// The fixed 16-byte preamble of a SiLK file header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderStart {
    /// Endianness of the payload records (not of the header itself).
    pub byte_order: ByteOrder,
    /// Per-file type identifier.
    pub file_format: u8,
    /// File format version; values >= [`MODERN_FILE_VERSION`] use the
    /// extended header with typed entries.
    pub file_version: u8,
    /// Compression method identifier.
    pub compression_method: u8,
    /// Free-form 32-bit tag identifying the writer.
    pub writer_version: u32,
    /// Payload record stride, in bytes. Zero when record length is carried
    /// entirely in a header entry (as with IPset files).
    pub record_size: u16,
    /// Payload record format version.
    pub record_version: u16,
}

impl HeaderStart {
    /// Build a `HeaderStart`, applying the [`WRITER_VERSION_ENV`]
    /// override.
    pub fn new(file_format: u8, file_version: u8, writer_version: u32) -> Self {
        let writer_version = if writer_version_overridden() {
            0
        } else {
            writer_version
        };
        HeaderStart {
            byte_order: ByteOrder::BigEndian,
            file_format,
            file_version,
            compression_method: 0,
            writer_version,
            record_size: 0,
            record_version: 0,
        }
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(MAGIC)?;
        let flags = match self.byte_order {
            ByteOrder::BigEndian => FLAG_BIG_ENDIAN,
            ByteOrder::LittleEndian => 0,
        };
        w.write_u8(flags)?;
        w.write_u8(self.file_format)?;
        w.write_u8(self.file_version)?;
        w.write_u8(self.compression_method)?;
        w.write_u32::<BigEndian>(self.writer_version)?;
        w.write_u16::<BigEndian>(self.record_size)?;
        w.write_u16::<BigEndian>(self.record_version)?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic_buf = [0u8; 4];
        match r.read_exact(&mut magic_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ShortRead)
            }
            Err(e) => return Err(e.into()),
        }
        if u32::from_be_bytes(magic_buf) != MAGIC {
            return Err(Error::BadFormat);
        }
        let mut rest = [0u8; 12];
        r.read_exact(&mut rest).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ShortRead
            } else {
                Error::Io(e)
            }
        })?;
        let file_flags = rest[0];
        let byte_order = if file_flags & FLAG_BIG_ENDIAN != 0 {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        };
        let file_format = rest[1];
        let file_version = rest[2];
        let compression_method = rest[3];
        let writer_version = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let record_size = u16::from_be_bytes([rest[8], rest[9]]);
        let record_version = u16::from_be_bytes([rest[10], rest[11]]);
        Ok(HeaderStart {
            byte_order,
            file_format,
            file_version,
            compression_method,
            writer_version,
            record_size,
            record_version,
        })
    }
}

fn writer_version_overridden() -> bool {
    std::env::var(WRITER_VERSION_ENV)
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// A typed, length-prefixed entry in a file header's entry chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderEntry {
    /// Entry ID 1: the packed-file start time, flow type, and sensor.
    PackedFile {
        /// Start time of the file's data, in milliseconds since the epoch.
        start_time_ms: u64,
        /// Flow-type identifier assigned by the collaborator's site config.
        flowtype: u32,
        /// Sensor identifier assigned by the collaborator's site config.
        sensor: u32,
    },
    /// Entry ID 2: the null-delimited argv of the program that wrote this
    /// file.
    Invocation(Vec<String>),
    /// Entry ID 3: free-form UTF-8 annotation text.
    Annotation(String),
    /// Entry ID 4: the name of the probe that produced this file's data.
    ProbeName(String),
    /// Entry ID 5: a prefix-map's version and name.
    PrefixMap {
        /// Prefix map format version.
        version: u32,
        /// Prefix map name.
        name: String,
    },
    /// Entry ID 6: a Bag's key/counter type and length.
    Bag {
        /// Tag identifying what the key represents.
        key_type: u16,
        /// Key width in octets.
        key_length: u16,
        /// Tag identifying what the counter represents.
        counter_type: u16,
        /// Counter width in octets (always 8 in the current format).
        counter_length: u16,
    },
    /// Entry ID 7: an IPset's radix-tree shape constants.
    Ipset {
        /// Number of child pointers per interior node.
        child_per_node: u32,
        /// Number of leaves in the serialized tree.
        leaf_count: u32,
        /// Size in bytes of one serialized leaf.
        leaf_size: u32,
        /// Number of interior nodes in the serialized tree.
        node_count: u32,
        /// Size in bytes of one serialized interior node.
        node_size: u32,
        /// Index of the root node.
        root_index: u32,
    },
    /// An entry ID this crate does not know how to interpret; its payload
    /// is kept verbatim so it can be round-tripped.
    Unknown {
        /// The raw entry ID.
        id: u32,
        /// The entry's raw payload bytes.
        payload: Vec<u8>,
    },
}

impl HeaderEntry {
    fn id(&self) -> u32 {
        match self {
            HeaderEntry::PackedFile { .. } => 1,
            HeaderEntry::Invocation(_) => 2,
            HeaderEntry::Annotation(_) => 3,
            HeaderEntry::ProbeName(_) => 4,
            HeaderEntry::PrefixMap { .. } => 5,
            HeaderEntry::Bag { .. } => 6,
            HeaderEntry::Ipset { .. } => 7,
            HeaderEntry::Unknown { id, .. } => *id,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            HeaderEntry::PackedFile {
                start_time_ms,
                flowtype,
                sensor,
            } => {
                buf.write_u64::<BigEndian>(*start_time_ms)?;
                buf.write_u32::<BigEndian>(*flowtype)?;
                buf.write_u32::<BigEndian>(*sensor)?;
            }
            HeaderEntry::Invocation(argv) => {
                for arg in argv {
                    buf.extend_from_slice(arg.as_bytes());
                    buf.push(0);
                }
            }
            HeaderEntry::Annotation(text) => buf.extend_from_slice(text.as_bytes()),
            HeaderEntry::ProbeName(name) => {
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
            }
            HeaderEntry::PrefixMap { version, name } => {
                buf.write_u32::<BigEndian>(*version)?;
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
            }
            HeaderEntry::Bag {
                key_type,
                key_length,
                counter_type,
                counter_length,
            } => {
                buf.write_u16::<BigEndian>(*key_type)?;
                buf.write_u16::<BigEndian>(*key_length)?;
                buf.write_u16::<BigEndian>(*counter_type)?;
                buf.write_u16::<BigEndian>(*counter_length)?;
            }
            HeaderEntry::Ipset {
                child_per_node,
                leaf_count,
                leaf_size,
                node_count,
                node_size,
                root_index,
            } => {
                buf.write_u32::<BigEndian>(*child_per_node)?;
                buf.write_u32::<BigEndian>(*leaf_count)?;
                buf.write_u32::<BigEndian>(*leaf_size)?;
                buf.write_u32::<BigEndian>(*node_count)?;
                buf.write_u32::<BigEndian>(*node_size)?;
                buf.write_u32::<BigEndian>(*root_index)?;
            }
            HeaderEntry::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        Ok(buf)
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let payload = self.payload()?;
        w.write_u32::<BigEndian>(self.id())?;
        // total_length includes the 8-byte id+length prefix itself.
        w.write_u32::<BigEndian>((payload.len() + 8) as u32)?;
        w.write_all(&payload)?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let id = match r.read_u32::<BigEndian>() {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ShortRead)
            }
            Err(e) => return Err(e.into()),
        };
        if id == 0 {
            return Ok(None);
        }
        let total_length = r.read_u32::<BigEndian>()?;
        if total_length < 8 {
            return Err(Error::BadFormat);
        }
        let mut payload = vec![0u8; (total_length - 8) as usize];
        r.read_exact(&mut payload).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TooLong
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Some(decode_entry(id, payload)?))
    }
}

fn read_cstr(payload: &[u8], offset: &mut usize) -> String {
    let start = *offset;
    let end = payload[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(payload.len());
    *offset = (end + 1).min(payload.len());
    String::from_utf8_lossy(&payload[start..end]).into_owned()
}

fn decode_entry(id: u32, payload: Vec<u8>) -> Result<HeaderEntry> {
    let mut cursor = payload.as_slice();
    Ok(match id {
        1 if payload.len() == 16 => {
            let start_time_ms = cursor.read_u64::<BigEndian>()?;
            let flowtype = cursor.read_u32::<BigEndian>()?;
            let sensor = cursor.read_u32::<BigEndian>()?;
            HeaderEntry::PackedFile {
                start_time_ms,
                flowtype,
                sensor,
            }
        }
        2 => {
            let mut argv = Vec::new();
            let mut offset = 0;
            while offset < payload.len() {
                argv.push(read_cstr(&payload, &mut offset));
            }
            HeaderEntry::Invocation(argv)
        }
        3 => HeaderEntry::Annotation(String::from_utf8_lossy(&payload).into_owned()),
        4 => {
            let mut offset = 0;
            HeaderEntry::ProbeName(read_cstr(&payload, &mut offset))
        }
        5 if payload.len() >= 4 => {
            let version = cursor.read_u32::<BigEndian>()?;
            let mut offset = 4;
            let name = read_cstr(&payload, &mut offset);
            HeaderEntry::PrefixMap { version, name }
        }
        6 if payload.len() == 8 => {
            let key_type = cursor.read_u16::<BigEndian>()?;
            let key_length = cursor.read_u16::<BigEndian>()?;
            let counter_type = cursor.read_u16::<BigEndian>()?;
            let counter_length = cursor.read_u16::<BigEndian>()?;
            HeaderEntry::Bag {
                key_type,
                key_length,
                counter_type,
                counter_length,
            }
        }
        7 if payload.len() == 24 => {
            let child_per_node = cursor.read_u32::<BigEndian>()?;
            let leaf_count = cursor.read_u32::<BigEndian>()?;
            let leaf_size = cursor.read_u32::<BigEndian>()?;
            let node_count = cursor.read_u32::<BigEndian>()?;
            let node_size = cursor.read_u32::<BigEndian>()?;
            let root_index = cursor.read_u32::<BigEndian>()?;
            HeaderEntry::Ipset {
                child_per_node,
                leaf_count,
                leaf_size,
                node_count,
                node_size,
                root_index,
            }
        }
        _ => HeaderEntry::Unknown { id, payload },
    })
}

/// A full SiLK file header: the fixed preamble plus the entry chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// The fixed 16-byte preamble.
    pub start: HeaderStart,
    /// The chain of typed entries, in on-disk order.
    pub entries: Vec<HeaderEntry>,
}

impl FileHeader {
    /// Build an empty header with the given format/version/writer tag.
    pub fn new(file_format: u8, file_version: u8, writer_version: u32) -> Self {
        FileHeader {
            start: HeaderStart::new(file_format, file_version, writer_version),
            entries: Vec::new(),
        }
    }

    /// Append an entry to the chain.
    pub fn push(&mut self, entry: HeaderEntry) {
        self.entries.push(entry);
    }

    /// Find the first entry of a given kind (matched by ID), if present.
    pub fn find_bag_entry(&self) -> Option<&HeaderEntry> {
        self.entries
            .iter()
            .find(|e| matches!(e, HeaderEntry::Bag { .. }))
    }

    /// Find the first IPset shape entry, if present.
    pub fn find_ipset_entry(&self) -> Option<&HeaderEntry> {
        self.entries
            .iter()
            .find(|e| matches!(e, HeaderEntry::Ipset { .. }))
    }

    /// Serialize the header to `w`.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        self.start.write(w)?;
        for entry in &self.entries {
            entry.write(w)?;
        }
        // Terminating entry: ID 0, no length/payload fields follow it, but
        // callers of `HeaderEntry::read` only look for the ID.
        w.write_u32::<BigEndian>(0)?;
        Ok(())
    }

    /// Deserialize a header from `r`.
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let start = HeaderStart::read(r)?;
        if start.file_version < MODERN_FILE_VERSION {
            return Err(Error::BadVersion(start.file_version));
        }
        let mut entries = Vec::new();
        while let Some(entry) = HeaderEntry::read(r)? {
            entries.push(entry);
        }
        Ok(FileHeader { start, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn round_trip_empty_header() {
        let header = FileHeader::new(7, MODERN_FILE_VERSION, 0x0102_0304);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let read_back = FileHeader::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn round_trip_with_entries() {
        let mut header = FileHeader::new(6, MODERN_FILE_VERSION, 1);
        header.push(HeaderEntry::Invocation(vec![
            "rwbagcat".into(),
            "--help".into(),
        ]));
        header.push(HeaderEntry::Annotation("test run".into()));
        header.push(HeaderEntry::Bag {
            key_type: 4,
            key_length: 4,
            counter_type: 8,
            counter_length: 8,
        });
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let read_back = FileHeader::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; 16];
        let err = FileHeader::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::BadFormat));
    }

    #[test]
    fn unknown_entries_are_skipped_but_preserved() {
        let mut header = FileHeader::new(7, MODERN_FILE_VERSION, 0);
        header.push(HeaderEntry::Unknown {
            id: 99,
            payload: vec![1, 2, 3, 4],
        });
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let read_back = FileHeader::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read_back.entries, header.entries);
    }

    #[test]
    fn short_read_before_magic_is_distinct_error() {
        let buf = vec![0u8; 2];
        let err = FileHeader::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::ShortRead));
    }

    #[test]
    fn writer_version_env_override() {
        std::env::set_var(WRITER_VERSION_ENV, "1");
        let header = FileHeader::new(1, MODERN_FILE_VERSION, 0xABCD);
        assert_eq!(header.start.writer_version, 0);
        std::env::remove_var(WRITER_VERSION_ENV);
    }
}
