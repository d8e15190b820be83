use thiserror::Error;

/// The public error taxonomy.
///
/// Internal-only signals (page-full during an insert attempt, for instance)
/// are caught and resolved by the B+tree engine and never reach this type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Opening the backing file failed.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Failed to acquire the advisory single-writer file lock.
    #[error("failed to lock the backing file for exclusive writer access")]
    Lock(#[source] std::io::Error),
    /// A sync/flush to the backing file failed.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Resizing (growing) the backing file failed.
    #[error("can't resize the backing file: have {size:#x} bytes, wanted {requested:#x}")]
    ResizeFailed {
        size: usize,
        requested: usize,
        #[source]
        source: std::io::Error,
    },
    /// Establishing or growing the memory map failed.
    #[error("can't map backing storage: requested {requested:#x} bytes")]
    MapFailed {
        requested: usize,
        #[source]
        source: std::io::Error,
    },
    /// The requested key was not present.
    #[error("key not found")]
    NotFound,
    /// `NOOVERWRITE`/`NODUPDATA` put failed because the key (or pair) already exists.
    #[error("key already exists")]
    KeyExist,
    /// `APPEND`/`APPENDDUP` put failed because the new key/pair was not greater than the last.
    #[error("key/data out of order for append")]
    KeyMismatch,
    /// A DUPSORT-only cursor operation was used on a plain (non-DUPSORT) DBI.
    #[error("operation is incompatible with this DBI's duplicate-handling mode")]
    Incompatible,
    /// The environment's mapped size cannot grow further under its configured geometry.
    #[error("database map is full: geometry max is {max} pages")]
    MapFull { max: u64 },
    /// A single transaction accumulated more dirty pages than it is allowed to track.
    #[error("transaction has too many dirty pages ({count})")]
    TxnFull { count: usize },
    /// The reader table has no free slots left.
    #[error("reader table is full ({capacity} slots)")]
    ReadersFull { capacity: usize },
    /// A key or value violated a size constraint.
    #[error("key or value size invalid: {0}")]
    BadValSize(&'static str),
    /// An unknown or stale DBI handle was used.
    #[error("invalid or unknown DBI handle")]
    BadDbi,
    /// On-disk structures failed validation (bad magic, checksum, or offsets).
    #[error("database corruption detected: {0}")]
    Corrupted(&'static str),
    /// The environment has transitioned to a closed, unrecoverable state after corruption.
    #[error("environment is panicked and must be reopened")]
    Panic,
    /// A miscellaneous, rarely hit error with a static description.
    #[error("{0}")]
    Other(&'static str),
}

impl Error {
    /// `true` for errors that leave the environment otherwise usable (the
    /// current transaction should simply be aborted).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Corrupted(_) | Error::Panic)
    }
}

/// Internal-only error signalling that an insert didn't fit on the target
/// page. Always caught within the B+tree engine (compaction/split retried);
/// never surfaces through the public `Error` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageFull {
    pub needed: usize,
}

impl std::fmt::Display for PageFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page full, needed {} more bytes", self.needed)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
