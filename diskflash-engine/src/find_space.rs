use layout::PartitionTable;

/// Which end of the disk to search first when placing a partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskSide {
    /// Search from the lowest usable LBA upward, placing at the leading
    /// edge of the first fitting free range.
    Start,
    /// Search from the highest usable LBA downward, placing at the
    /// trailing edge of the first fitting free range.
    End,
}

#[derive(Clone, Copy, Debug)]
struct Range {
    first: u64,
    last: u64,
    free: bool,
}

impl Range {
    fn len(self) -> u64 {
        self.last - self.first + 1
    }
}

/// Builds the ordered list of maximal free/occupied ranges covering
/// `[table.first_usable_lba, table.last_usable_lba]`.
fn disk_ranges(table: &PartitionTable) -> Vec<Range> {
    let mut occupied: Vec<(u64, u64)> = table
        .occupied()
        .map(|p| (p.first_lba, p.last_lba))
        .collect();
    occupied.sort_unstable();

    let mut ranges = Vec::new();
    let mut cursor = table.first_usable_lba;

    for (first, last) in occupied {
        if first > cursor {
            ranges.push(Range {
                first: cursor,
                last: first - 1,
                free: true,
            });
        }

        ranges.push(Range {
            first,
            last,
            free: false,
        });

        cursor = last + 1;
    }

    if cursor <= table.last_usable_lba {
        ranges.push(Range {
            first: cursor,
            last: table.last_usable_lba,
            free: true,
        });
    }

    ranges
}

/// Finds a free LBA window of exactly `blocks` sectors, searching from
/// `side`.
///
/// Returns `(first_lba, last_lba)`, both inclusive, or `None` if no window
/// of that size exists. `blocks == 0` always returns `None`.
#[must_use]
pub fn find_space(table: &PartitionTable, blocks: u64, side: DiskSide) -> Option<(u64, u64)> {
    if blocks == 0 {
        return None;
    }

    let ranges = disk_ranges(table);

    match side {
        DiskSide::Start => ranges
            .iter()
            .find(|r| r.free && r.len() >= blocks)
            .map(|r| (r.first, r.first + blocks - 1)),
        DiskSide::End => ranges
            .iter()
            .rev()
            .find(|r| r.free && r.len() >= blocks)
            .map(|r| (r.last - blocks + 1, r.last)),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{find_space, DiskSide};
    use layout::PartitionTable;

    fn occupy(table: &mut PartitionTable, idx: usize, first: u64, last: u64) {
        table.partitions[idx].type_guid = layout::Guid::from_bytes([1; 16]);
        table.partitions[idx].unique_guid = layout::Guid::from_bytes([idx as u8 + 2; 16]);
        table.partitions[idx].first_lba = first;
        table.partitions[idx].last_lba = last;
    }

    #[test]
    fn zero_blocks_never_found() {
        let table = PartitionTable::empty(512, 34, 100);
        assert_eq!(find_space(&table, 0, DiskSide::Start), None);
    }

    #[test]
    fn full_range_on_empty_table() {
        let table = PartitionTable::empty(512, 34, 100);
        let blocks = 100 - 34 + 1;
        assert_eq!(find_space(&table, blocks, DiskSide::Start), Some((34, 100)));
        assert_eq!(find_space(&table, blocks, DiskSide::End), Some((34, 100)));
    }

    #[test]
    fn start_side_picks_leading_edge() {
        let mut table = PartitionTable::empty(512, 0, 99);
        occupy(&mut table, 0, 20, 29);
        assert_eq!(find_space(&table, 5, DiskSide::Start), Some((0, 4)));
    }

    #[test]
    fn end_side_picks_trailing_edge() {
        let mut table = PartitionTable::empty(512, 0, 99);
        occupy(&mut table, 0, 20, 29);
        assert_eq!(find_space(&table, 5, DiskSide::End), Some((95, 99)));
    }

    #[test]
    fn no_window_big_enough() {
        let mut table = PartitionTable::empty(512, 0, 9);
        occupy(&mut table, 0, 0, 9);
        assert_eq!(find_space(&table, 1, DiskSide::Start), None);
    }

    #[test]
    fn window_between_two_occupied_ranges() {
        let mut table = PartitionTable::empty(512, 0, 99);
        occupy(&mut table, 0, 0, 9);
        occupy(&mut table, 1, 50, 59);
        assert_eq!(find_space(&table, 10, DiskSide::Start), Some((10, 19)));
        assert_eq!(find_space(&table, 10, DiskSide::End), Some((90, 99)));
    }
}
