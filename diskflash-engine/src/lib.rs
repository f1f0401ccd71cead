//! Partition-table reconciliation and content-transfer engine.
//!
//! Four collaborators, applied in order by a caller driving a flash
//! operation: [`find_space`] locates free LBA windows, [`validate`] checks
//! and mutates partition tables, [`merge`] reconciles a disk's table with
//! an image's table and a persistent-partition list, and [`copy`] derives
//! and executes the resulting byte-level transfer plan.

/// Copy planner and executor (component E): derives a byte-level transfer
/// plan from a merged disk table and an image table, splits it for
/// parallel execution, and drives the actual transfer.
pub mod copy;

/// Free-space finder (component B): locates LBA windows of a given size
/// from either end of a disk.
pub mod find_space;

/// Merge planner (component D): reconciles a disk table with an image
/// table and a persistent-partition list into the final disk table.
pub mod merge;

/// Partition-table validator and mutator (component C): checks table
/// invariants and performs the slot-level edits every higher-level
/// operation is built from.
pub mod validate;

pub use copy::{execute, plan, split, CopyTask, ProgressSink};
pub use find_space::{find_space, DiskSide};
pub use merge::merge;
pub use validate::{
    add, add_find_space, assert_compatible, assert_existing_match, assert_persistent_valid,
    remove_all_except, remove_by_id, validate,
};
