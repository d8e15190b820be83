//! Flag constants for environments, DBIs, puts, and cursor ops.
//!
//! Kept as plain bit constants rather than a `bitflags!` type, matching the
//! way the page/node flag bytes are handled throughout this crate.

/// Flags accepted by [`crate::env::Environment::open`].
pub mod env {
    /// The path names the data file directly; no lock-file sibling directory.
    pub const NOSUBDIR: u32 = 0x4000;
    /// Don't fsync the meta page after a commit (still writes it).
    pub const NOMETASYNC: u32 = 0x4_0000;
    /// Don't flush system buffers after a commit at all; fastest, least durable.
    pub const NOSYNC: u32 = 0x1_0000;
    /// Map the whole file writable and mutate dirty pages in place.
    pub const WRITEMAP: u32 = 0x8_0000;
    /// Open without permission to start write transactions.
    pub const READONLY: u32 = 0x2_0000;
    /// Create the database file if it doesn't exist.
    pub const CREATE: u32 = 0x4_0000_0000;
}

/// Flags accepted by `open_dbi`.
pub mod dbi {
    /// Create the named DBI if it doesn't already exist.
    pub const CREATE: u32 = 0x4_0000;
    /// Keys may have multiple sorted values (duplicates).
    pub const DUPSORT: u32 = 0x04;
    /// All duplicate values for DUPSORT keys share one fixed size.
    pub const DUPFIXED: u32 = 0x10;
    /// Keys are native-endian unsigned integers, compared numerically.
    pub const INTEGERKEY: u32 = 0x08;
}

/// Flags accepted by `put`/cursor `put`.
pub mod put {
    /// Replace on exact key match; insert otherwise. The default (value 0),
    /// listed for documentation purposes only.
    pub const UPSERT: u32 = 0x00;
    /// Fail with `KeyExist` if the key is already present.
    pub const NOOVERWRITE: u32 = 0x10;
    /// Fail with `KeyExist` if the exact (key, value) pair is already present (DUPSORT).
    pub const NODUPDATA: u32 = 0x20;
    /// Require the new key to be strictly greater than the current maximum key.
    pub const APPEND: u32 = 0x0002_0000;
    /// Like `APPEND`, but for the (key, value) ordering within a DUPSORT key.
    pub const APPENDDUP: u32 = 0x0004_0000;
    /// Reserve space for the value and return a writable slice for the caller to fill.
    pub const RESERVE: u32 = 0x1_0000;
    /// Store several fixed-size duplicate values from one contiguous buffer (DUPFIXED).
    pub const MULTIPLE: u32 = 0x80;
}

/// Page-level flags (stored in the page header).
pub mod page {
    pub const BRANCH: u16 = 0x01;
    pub const LEAF: u16 = 0x02;
    pub const LEAF2: u16 = 0x04;
    pub const OVERFLOW: u16 = 0x08;
    pub const META: u16 = 0x10;
    pub const SUBPAGE: u16 = 0x40;
    pub const DIRTY: u16 = 0x8000;
}

/// Node-level flags (stored in the node header inside a leaf page).
pub mod node {
    /// The value is stored in a chain of OVERFLOW pages, not inline.
    pub const BIGDATA: u16 = 0x01;
    /// The value is a `SUBDATA` record: the root of a promoted DUPSORT sub-tree.
    pub const SUBDATA: u16 = 0x02;
    /// The value is a `SUBPAGE`: an inline mini-leaf of duplicates.
    pub const DUPDATA: u16 = 0x04;
}
