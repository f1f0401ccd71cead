use crate::slot::PartitionSlot;

/// Number of entries in a standard GPT partition array.
pub const PARTITION_ARRAY_LEN: usize = 128;

/// A GPT partition table: header geometry plus a fixed-length array of
/// slots, of which only some may be occupied.
///
/// The array's *length* never changes; only the occupied/empty status of
/// individual slots does. Do not model partitions as an append-only list.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    /// Sector size in bytes.
    pub sector_size: u64,
    /// First LBA usable by a partition, inclusive.
    pub first_usable_lba: u64,
    /// Last LBA usable by a partition, inclusive.
    pub last_usable_lba: u64,
    /// The fixed-length partition slot array.
    pub partitions: [PartitionSlot; PARTITION_ARRAY_LEN],
}

impl PartitionTable {
    /// Builds an empty table (every slot cleared) for the given geometry.
    #[must_use]
    pub fn empty(sector_size: u64, first_usable_lba: u64, last_usable_lba: u64) -> Self {
        Self {
            sector_size,
            first_usable_lba,
            last_usable_lba,
            partitions: [PartitionSlot::EMPTY; PARTITION_ARRAY_LEN],
        }
    }

    /// Iterator over the occupied slots, in array order.
    pub fn occupied(&self) -> impl Iterator<Item = &PartitionSlot> {
        self.partitions.iter().filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::PartitionTable;

    #[test]
    fn empty_table_has_no_occupied_slots() {
        let table = PartitionTable::empty(512, 34, 100);
        assert_eq!(table.occupied().count(), 0);
    }
}
