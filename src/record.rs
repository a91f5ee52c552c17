//! The two abstract contracts external collaborators use to interact with
//! this crate's core: a flow-record iterator, and a seekable byte stream.

use std::io::{Read, Seek, Write};

use crate::ip::IpAddress;

/// A single flow record, as produced by an external flow-record reader.
///
/// This crate never decodes IPFIX/NetFlow itself; a collaborator hands us
/// records through this trait so a `Bag` or `IPset` can be built from them.
pub trait FlowRecord {
    /// Source IP address.
    fn src_ip(&self) -> IpAddress;
    /// Destination IP address.
    fn dst_ip(&self) -> IpAddress;
    /// Source port.
    fn src_port(&self) -> u16;
    /// Destination port.
    fn dst_port(&self) -> u16;
    /// IP protocol number.
    fn protocol(&self) -> u8;
    /// Packet count.
    fn packets(&self) -> u64;
    /// Byte count.
    fn bytes(&self) -> u64;
    /// Flow start time, in milliseconds since the epoch.
    fn start_time_ms(&self) -> u64;
    /// Flow duration, in milliseconds.
    fn duration_ms(&self) -> u32;
}

/// A seekable byte stream for header/payload I/O.
///
/// Any `Read + Write + Seek` type (a `File`, a `Cursor<Vec<u8>>`, ...)
/// already implements this.
pub trait Stream: Read + Write + Seek {}

impl<T: Read + Write + Seek> Stream for T {}
