//! Shared error taxonomy and small command-surface types used across the
//! flashing agent workspace.

use core::fmt;
use std::io;

/// Every way the partition-reconciliation and content-transfer engine can
/// fail.
///
/// Each variant carries a human-readable detail so callers can surface it to
/// an operator without needing to pattern-match on the kind.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A table violates one of the invariants checked by `validate`.
    #[error("invalid partition table layout: {0}")]
    InvalidLayout(String),

    /// Two occupied slots in the same table share a `unique_guid`.
    #[error("duplicate unique GUID: {0}")]
    DuplicateUniqueGuid(String),

    /// Two tables being merged or compared don't share a sector size.
    #[error("incompatible sector size: {0}")]
    IncompatibleSectorSize(String),

    /// Two persistent-partition descriptors share a `unique_guid`.
    #[error("duplicate persistent partition descriptor: {0}")]
    DuplicatePersistent(String),

    /// A persistent-partition descriptor declares a zero byte size.
    #[error("persistent partition descriptor has zero size: {0}")]
    ZeroSize(String),

    /// A persistent-partition descriptor declares the reserved all-zero
    /// type GUID.
    #[error("persistent partition descriptor uses the reserved type GUID: {0}")]
    ReservedTypeGuid(String),

    /// An existing disk slot claims a persistent id but doesn't fully match
    /// its descriptor.
    #[error("existing partition doesn't match its persistent descriptor: {0}")]
    PersistentMismatch(String),

    /// A persistent id is also present in the image table.
    #[error("persistent partition conflicts with the image: {0}")]
    PersistentConflictsImage(String),

    /// A GUID's text representation isn't 36 characters of hex and dashes.
    #[error("malformed GUID: {0}")]
    MalformedGuid(String),

    /// The disk geometry (sector size, total size) can't host a protective
    /// MBR or GPT.
    #[error("invalid disk geometry: {0}")]
    InvalidDiskGeometry(String),

    /// No empty slot remains in the partition array.
    #[error("no empty partition slot available")]
    NoSlotSpace,

    /// No free LBA window of the requested size exists on the disk.
    #[error("no free disk space for a {0}-sector allocation")]
    NoDiskSpace(u64),

    /// `add` was called with an already-empty partition.
    #[error("refusing to add an empty partition")]
    EmptyPartition,

    /// Two copy tasks would write overlapping ranges of the source stream.
    #[error("copy tasks overlap on the source stream: {0}")]
    SourceOverlap(String),

    /// Two copy tasks would write overlapping ranges of the destination.
    #[error("copy tasks overlap on the destination: {0}")]
    DestinationOverlap(String),

    /// The source stream ended before a task's bytes were fully read.
    #[error("source stream ended early: {0}")]
    SourceShort(String),

    /// The destination refused to accept all the bytes of a task.
    #[error("destination write was short: {0}")]
    DestinationShort(String),

    /// The destination reported the requested range as unavailable.
    #[error("destination offset is out of range: {0}")]
    DestinationOutOfRange(String),

    /// An image partition slated for copy has `first_lba > last_lba`.
    #[error("malformed image partition: {0}")]
    BadImagePartition(String),

    /// A caller passed an invalid argument to an engine entry point.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error occurred while reading the source stream or writing the
    /// destination.
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// What to do with the host once flashing completes successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum PowerAction {
    /// Leave the host running.
    #[default]
    None,
    /// Reboot the host once the new image is in place.
    Reboot,
    /// Power the host off once the new image is in place.
    PowerOff,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Reboot => "reboot",
            Self::PowerOff => "power-off",
        })
    }
}
