//! The error taxonomy shared by every component in this crate.

use std::fmt;

/// Result type returned by fallible operations across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds shared across the IPset, Bag, circular buffer, and file
/// header components.
///
/// The same variant names are used for analogous failures in every
/// component, mirroring the single `skBagErr_t`-style taxonomy that SiLK
/// reuses across its data structures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Allocation failure; the operation that triggered it was rolled back.
    #[error("allocation failure")]
    Alloc,

    /// Argument violates a precondition (out-of-range numeric parameter,
    /// unrecognized type, mismatched width, ...).
    #[error("invalid input: {0}")]
    Input(String),

    /// Key exceeds the current width and auto-promotion is disabled.
    #[error("key out of range for current width")]
    KeyRange,

    /// Counter over/underflow (Bag), or a request that would exceed the
    /// buffer's allocation when waiting is disabled (circular buffer).
    #[error("operation out of bounds")]
    OpBounds,

    /// Iterator exhausted, or lookup in an empty structure.
    #[error("key not found")]
    KeyNotFound,

    /// A Bag's key width changed while an iterator over it was live.
    #[error("bag modified during iteration")]
    Modified,

    /// Underlying stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A short read occurred before a complete file header could be parsed.
    #[error("short read: truncated file header")]
    ShortRead,

    /// A read of a length-prefixed payload fell short of its declared
    /// length; distinct from [`Error::ShortRead`] so callers can tell
    /// "wrong file type" from "truncated file".
    #[error("short read: truncated payload")]
    TooLong,

    /// Deserialization encountered an unrecognized magic number.
    #[error("bad format: magic number mismatch")]
    BadFormat,

    /// Deserialization encountered an unsupported file or entry version.
    #[error("bad version: {0}")]
    BadVersion(u8),

    /// Unknown compression method identifier in a file header.
    #[error("bad compression method: {0}")]
    BadCompression(u8),

    /// Mutation attempted on a frozen/locked object.
    #[error("object is frozen")]
    Frozen,

    /// A non-blocking acquire would have slept.
    #[error("would block")]
    WouldBlock,

    /// The circular buffer was stopped.
    #[error("circular buffer stopped")]
    Stopped,

    /// Circular-buffer contract violation: no block is currently held.
    #[error("no block currently held")]
    HasNoBlock,

    /// Circular-buffer contract violation: a write block is already
    /// outstanding.
    #[error("a write block is already outstanding")]
    UncommittedBlock,

    /// Circular-buffer contract violation: the requested size exceeds the
    /// chunk's maximum block size.
    #[error("requested block size exceeds the chunk maximum")]
    BlockTooLarge,

    /// Duplicate insertion where the structure disallows it.
    #[error("duplicate entry")]
    Duplicate,
}

impl Error {
    /// Build an [`Error::Input`] from a formattable message, mirroring the
    /// teacher's terse one-line `Display` atoms (e.g. `Ipv4Atom::Version`).
    pub fn input(msg: impl fmt::Display) -> Self {
        Error::Input(msg.to_string())
    }
}
