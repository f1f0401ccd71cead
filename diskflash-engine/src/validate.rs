use layout::{Guid, PartitionSlot, PartitionTable, PersistentDescriptor};
use types::EngineError;

use crate::find_space::{find_space, DiskSide};

/// Checks invariants 1-3 of the partition-table data model: every occupied
/// slot's LBA range lies inside the usable range and is internally
/// ordered, occupied slots don't overlap, and `unique_guid` values are
/// pairwise distinct.
///
/// # Errors
///
/// [`EngineError::InvalidLayout`] or [`EngineError::DuplicateUniqueGuid`].
pub fn validate(table: &PartitionTable) -> Result<(), EngineError> {
    let mut occupied: Vec<&PartitionSlot> = table.occupied().collect();

    for slot in &occupied {
        if !(table.first_usable_lba <= slot.first_lba
            && slot.first_lba <= slot.last_lba
            && slot.last_lba <= table.last_usable_lba)
        {
            return Err(EngineError::InvalidLayout(format!(
                "partition {} LBA range {}..={} is outside the usable range {}..={}",
                slot.unique_guid, slot.first_lba, slot.last_lba, table.first_usable_lba,
                table.last_usable_lba
            )));
        }
    }

    occupied.sort_by_key(|s| s.first_lba);
    for pair in occupied.windows(2) {
        let [a, b] = pair else { unreachable!() };
        if a.last_lba >= b.first_lba {
            return Err(EngineError::InvalidLayout(format!(
                "partitions {} and {} overlap",
                a.unique_guid, b.unique_guid
            )));
        }
    }

    let mut ids: Vec<Guid> = occupied.iter().map(|s| s.unique_guid).collect();
    ids.sort_by_key(|g| g.to_bytes());
    for pair in ids.windows(2) {
        if pair[0] == pair[1] {
            return Err(EngineError::DuplicateUniqueGuid(pair[0].to_text()));
        }
    }

    Ok(())
}

/// Checks that `disk` and `image` share a sector size.
///
/// # Errors
///
/// [`EngineError::IncompatibleSectorSize`].
pub fn assert_compatible(disk: &PartitionTable, image: &PartitionTable) -> Result<(), EngineError> {
    if disk.sector_size != image.sector_size {
        return Err(EngineError::IncompatibleSectorSize(format!(
            "disk sector size {} != image sector size {}",
            disk.sector_size, image.sector_size
        )));
    }

    Ok(())
}

/// Checks that a list of persistent-partition descriptors is internally
/// consistent: no duplicate ids, no zero sizes, no reserved type GUIDs.
///
/// # Errors
///
/// [`EngineError::DuplicatePersistent`], [`EngineError::ZeroSize`], or
/// [`EngineError::ReservedTypeGuid`].
pub fn assert_persistent_valid(list: &[PersistentDescriptor]) -> Result<(), EngineError> {
    for descriptor in list {
        if descriptor.size_bytes == 0 {
            return Err(EngineError::ZeroSize(descriptor.unique_guid.to_text()));
        }

        if descriptor.type_guid.is_zero() {
            return Err(EngineError::ReservedTypeGuid(
                descriptor.unique_guid.to_text(),
            ));
        }
    }

    let mut ids: Vec<Guid> = list.iter().map(|d| d.unique_guid).collect();
    ids.sort_by_key(|g| g.to_bytes());
    for pair in ids.windows(2) {
        if pair[0] == pair[1] {
            return Err(EngineError::DuplicatePersistent(pair[0].to_text()));
        }
    }

    Ok(())
}

/// Checks that every slot in `table` claiming a persistent id fully
/// matches its descriptor (type and byte size).
///
/// # Errors
///
/// [`EngineError::PersistentMismatch`].
pub fn assert_existing_match(
    table: &PartitionTable,
    list: &[PersistentDescriptor],
) -> Result<(), EngineError> {
    for descriptor in list {
        for slot in table.occupied() {
            if slot.unique_guid == descriptor.unique_guid && !slot.matches_full(descriptor, table.sector_size) {
                return Err(EngineError::PersistentMismatch(format!(
                    "partition {} exists but doesn't match its persistent descriptor",
                    descriptor.unique_guid
                )));
            }
        }
    }

    Ok(())
}

/// Places `p` in the first empty slot of `table`.
///
/// Does not alter the table's header-declared array length.
///
/// # Errors
///
/// [`EngineError::EmptyPartition`] if `p` is empty, or
/// [`EngineError::NoSlotSpace`] if no slot is empty.
pub fn add(table: &mut PartitionTable, p: PartitionSlot) -> Result<(), EngineError> {
    if p.is_empty() {
        return Err(EngineError::EmptyPartition);
    }

    let slot = table
        .partitions
        .iter_mut()
        .find(|s| s.is_empty())
        .ok_or(EngineError::NoSlotSpace)?;

    *slot = p;
    Ok(())
}

/// Chooses `p.first_lba`/`p.last_lba` to fit `blocks` sectors via
/// [`find_space`], then [`add`]s it.
///
/// # Errors
///
/// [`EngineError::NoDiskSpace`] if no window of `blocks` sectors fits, or
/// any error from [`add`].
pub fn add_find_space(
    table: &mut PartitionTable,
    mut p: PartitionSlot,
    blocks: u64,
    side: DiskSide,
) -> Result<(), EngineError> {
    let (first, last) = find_space(table, blocks, side).ok_or(EngineError::NoDiskSpace(blocks))?;

    p.first_lba = first;
    p.last_lba = last;

    add(table, p)
}

/// Clears the first occupied slot whose id matches `guid`.
///
/// Returns whether a removal occurred. The slot's position in the array is
/// preserved.
pub fn remove_by_id(table: &mut PartitionTable, guid: Guid) -> bool {
    for slot in &mut table.partitions {
        if !slot.is_empty() && slot.unique_guid == guid {
            slot.clear();
            return true;
        }
    }

    false
}

/// Clears every occupied slot whose id is not in `keep_guids`.
pub fn remove_all_except(table: &mut PartitionTable, keep_guids: &[Guid]) {
    for slot in &mut table.partitions {
        if !slot.is_empty() && !keep_guids.contains(&slot.unique_guid) {
            slot.clear();
        }
    }
}
