#![doc = include_str!("../readme.md")]

mod bag;
mod circbuf;
mod error;
mod header;
mod ip;
mod ipset;
mod record;

pub use bag::{
    field::{FieldKind, RecordKeyField},
    Bag, CounterType, KeyTypeTag, TypedCounter, TypedKey,
};
pub use circbuf::{CircBuf, CircBufConfig};
pub use error::{Error, Result};
pub use header::{ByteOrder, FileHeader, HeaderEntry, MODERN_FILE_VERSION};
pub use ip::{Cidr, CidrIter, IpAddress};
pub use ipset::{AddressCount, IpSet, IpSetStreamInfo, SampleMode, V6Policy};
pub use record::{FlowRecord, Stream};
