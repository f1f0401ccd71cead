use layout::{Guid, PartitionSlot, PartitionTable, PersistentDescriptor};
use types::EngineError;

use crate::find_space::DiskSide;
use crate::validate::{
    add_find_space, assert_compatible, assert_existing_match, assert_persistent_valid,
    remove_all_except, validate,
};

/// Produces the final disk GPT from the existing disk GPT, the image GPT,
/// and the list of persistent partitions, mutating `disk_gpt` in place.
///
/// Persistent partitions are preserved (or created if missing) at the
/// *end* of the disk; image partitions are copied in at the *start*. This
/// keeps image layouts that assume low canonical offsets working
/// unmodified.
///
/// # Errors
///
/// Fails with the first violated pre-check, in order:
/// [`EngineError::IncompatibleSectorSize`],
/// [`EngineError::InvalidLayout`]/[`EngineError::DuplicateUniqueGuid`] (on
/// either table), [`EngineError::DuplicatePersistent`] /
/// [`EngineError::ZeroSize`] / [`EngineError::ReservedTypeGuid`],
/// [`EngineError::PersistentConflictsImage`], or
/// [`EngineError::PersistentMismatch`]. Once merging begins, propagates
/// [`EngineError::NoDiskSpace`] from the allocation steps.
///
/// On any failure, `disk_gpt` may have been partially mutated; the engine
/// makes no rollback guarantee, so callers must discard it.
pub fn merge(
    disk_gpt: &mut PartitionTable,
    image_gpt: &PartitionTable,
    persistent: &[PersistentDescriptor],
) -> Result<(), EngineError> {
    assert_compatible(disk_gpt, image_gpt)?;
    validate(disk_gpt)?;
    validate(image_gpt)?;
    assert_persistent_valid(persistent)?;

    for descriptor in persistent {
        if image_gpt
            .occupied()
            .any(|slot| slot.unique_guid == descriptor.unique_guid)
        {
            return Err(EngineError::PersistentConflictsImage(
                descriptor.unique_guid.to_text(),
            ));
        }
    }

    assert_existing_match(disk_gpt, persistent)?;

    let keep_guids: Vec<Guid> = persistent.iter().map(|d| d.unique_guid).collect();
    remove_all_except(disk_gpt, &keep_guids);

    for descriptor in persistent {
        let already_present = disk_gpt
            .occupied()
            .any(|slot| slot.unique_guid == descriptor.unique_guid);

        if already_present {
            continue;
        }

        let blocks = part::div_round_up(descriptor.size_bytes, disk_gpt.sector_size);
        let p = PartitionSlot {
            type_guid: descriptor.type_guid,
            unique_guid: descriptor.unique_guid,
            ..PartitionSlot::EMPTY
        };

        add_find_space(disk_gpt, p, blocks, DiskSide::End)?;
    }

    for image_slot in image_gpt.occupied() {
        let blocks = image_slot.last_lba - image_slot.first_lba + 1;
        let p = PartitionSlot {
            type_guid: image_slot.type_guid,
            unique_guid: image_slot.unique_guid,
            name: image_slot.name,
            flags: image_slot.flags,
            ..PartitionSlot::EMPTY
        };

        add_find_space(disk_gpt, p, blocks, DiskSide::Start)?;
    }

    validate(disk_gpt)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::merge;
    use layout::{Guid, PartitionSlot, PartitionTable, PersistentDescriptor};

    fn guid(n: u8) -> Guid {
        Guid::from_bytes([n; 16])
    }

    fn occupied(type_guid: Guid, unique_guid: Guid, first: u64, last: u64) -> PartitionSlot {
        PartitionSlot {
            type_guid,
            unique_guid,
            first_lba: first,
            last_lba: last,
            ..PartitionSlot::EMPTY
        }
    }

    #[test]
    fn empty_to_empty_merge() {
        let mut disk = PartitionTable::empty(512, 34, 150);
        let image = PartitionTable::empty(512, 34, 150);

        merge(&mut disk, &image, &[]).unwrap();

        assert_eq!(disk.occupied().count(), 0);
    }

    #[test]
    fn pure_image_flash() {
        let mut disk = PartitionTable::empty(1024, 8, 150);
        let mut image = PartitionTable::empty(1024, 8, 150);
        image.partitions[0] = occupied(guid(1), guid(10), 10, 20);

        merge(&mut disk, &image, &[]).unwrap();

        // The image's own LBA placement is not preserved: the planner
        // re-finds space for it at the disk's start, keeping only its size
        // (11 blocks here).
        let placed = disk.partitions.iter().find(|s| s.unique_guid == guid(10)).unwrap();
        assert_eq!((placed.first_lba, placed.last_lba), (8, 18));
    }

    #[test]
    fn preserves_matching_persistent_partition() {
        let mut disk = PartitionTable::empty(512, 0, 150);
        disk.partitions[0] = occupied(guid(1), guid(2), 35, 36);
        let image = PartitionTable::empty(512, 0, 150);

        let persistent = [PersistentDescriptor {
            unique_guid: guid(2),
            type_guid: guid(1),
            size_bytes: 1024,
        }];

        merge(&mut disk, &image, &persistent).unwrap();

        let slot = disk.partitions.iter().find(|s| s.unique_guid == guid(2)).unwrap();
        assert_eq!((slot.first_lba, slot.last_lba), (35, 36));
    }

    #[test]
    fn evicts_non_persistent_partitions() {
        let mut disk = PartitionTable::empty(512, 0, 150);
        disk.partitions[0] = occupied(guid(1), guid(10), 30, 40);
        disk.partitions[1] = occupied(guid(1), guid(11), 50, 65);
        let image = PartitionTable::empty(512, 0, 150);

        merge(&mut disk, &image, &[]).unwrap();

        assert_eq!(disk.occupied().count(), 0);
    }

    #[test]
    fn rejects_persistent_conflicting_with_image() {
        let mut disk = PartitionTable::empty(512, 0, 150);
        let mut image = PartitionTable::empty(512, 0, 150);
        image.partitions[0] = occupied(guid(1), guid(9), 10, 20);

        let persistent = [PersistentDescriptor {
            unique_guid: guid(9),
            type_guid: guid(1),
            size_bytes: 1024,
        }];

        assert!(matches!(
            merge(&mut disk, &image, &persistent),
            Err(types::EngineError::PersistentConflictsImage(_))
        ));
    }

    #[test]
    fn allocates_missing_persistent_at_end() {
        let mut disk = PartitionTable::empty(512, 0, 150);
        let image = PartitionTable::empty(512, 0, 150);

        let persistent = [PersistentDescriptor {
            unique_guid: guid(9),
            type_guid: guid(1),
            size_bytes: 5 * 512,
        }];

        merge(&mut disk, &image, &persistent).unwrap();

        let slot = disk.partitions.iter().find(|s| s.unique_guid == guid(9)).unwrap();
        assert_eq!((slot.first_lba, slot.last_lba), (146, 150));
    }
}
