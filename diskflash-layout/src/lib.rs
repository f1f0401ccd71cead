//! Layout primitives: GUID encoding, the partition-slot and partition-table
//! data model, and the pure predicates (`is_empty`, `partition_byte_size`,
//! `matches_id`, `matches_full`) every other engine component builds on.

mod guid;
mod slot;
mod table;

pub use guid::Guid;
pub use slot::{PartitionSlot, PersistentDescriptor, NAME_LEN_UTF16};
pub use table::{PartitionTable, PARTITION_ARRAY_LEN};
