//! The semantic error set exposed to callers of the core (distilled-spec §6), plus the
//! `#[from] anyhow::Error` catch-all the lower I/O layers already raise errors through.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UbiError {
    /// No free PEB could be allocated and the bad-block reserve is exhausted.
    #[error("no free physical eraseblocks available")]
    NoSpace,

    /// A read or write could not be completed even after `UBI_IO_RETRIES` retries.
    #[error(transparent)]
    Io(#[from] anyhow::Error),

    /// A static volume's data failed CRC verification, either at attach time or on read.
    #[error("static volume is corrupted")]
    Corrupt,

    /// The device's read-only latch has engaged; all write paths are rejected.
    #[error("device is in read-only mode")]
    ReadOnly,

    /// A caller-supplied argument was out of range or otherwise invalid.
    #[error("bad argument: {0}")]
    BadArg(String),

    /// Informational: a read targeted an unmapped LEB (the caller asked to be told).
    #[error("logical eraseblock is not mapped")]
    NotMapped,
}

pub type UbiResult<T> = Result<T, UbiError>;
