use std::io::{Read, Seek, SeekFrom, Write};

use layout::PartitionTable;
use types::EngineError;

/// A read-only transfer buffer size; arbitrary, just amortizes syscalls.
const CHUNK_SIZE: usize = 64 * 1024;

/// A contiguous byte copy from one absolute source offset to one absolute
/// destination offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CopyTask {
    /// Absolute byte offset into the source stream.
    pub src_offset: u64,
    /// Absolute byte offset into the destination.
    pub dst_offset: u64,
    /// Number of bytes to copy. Always at least 1 for a task derived by
    /// [`plan`]; [`split`] may emit a zero-size tail task.
    pub size_bytes: u64,
}

/// Accepts successive progress deltas from the copy executor.
///
/// Closed exactly once, whether [`execute`] succeeds or fails.
pub trait ProgressSink {
    /// Reports that `delta` more bytes have been copied.
    fn push(&mut self, delta: u64);

    /// Signals that no more deltas will be pushed.
    fn close(&mut self);
}

/// Derives copy tasks from a final disk GPT and the image GPT it was
/// merged from.
///
/// For every occupied image slot whose `unique_guid` also appears in an
/// occupied disk slot, emits a task copying the image partition's bytes
/// to the disk partition's placement. Only the image's declared size
/// drives the copy length; the disk slot's range is used only for
/// placement. Empty slots and id mismatches yield no task.
///
/// # Errors
///
/// [`EngineError::BadImagePartition`] if a copied image slot has
/// `first_lba > last_lba`.
pub fn plan(
    final_disk_gpt: &PartitionTable,
    image_gpt: &PartitionTable,
) -> Result<Vec<CopyTask>, EngineError> {
    let mut tasks = Vec::new();

    for image_slot in image_gpt.occupied() {
        let Some(disk_slot) = final_disk_gpt
            .occupied()
            .find(|d| d.unique_guid == image_slot.unique_guid)
        else {
            continue;
        };

        if image_slot.first_lba > image_slot.last_lba {
            return Err(EngineError::BadImagePartition(format!(
                "partition {} has first_lba {} > last_lba {}",
                image_slot.unique_guid, image_slot.first_lba, image_slot.last_lba
            )));
        }

        let size_bytes =
            (image_slot.last_lba - image_slot.first_lba + 1) * image_gpt.sector_size;

        tasks.push(CopyTask {
            src_offset: image_slot.first_lba * image_gpt.sector_size,
            dst_offset: disk_slot.first_lba * final_disk_gpt.sector_size,
            size_bytes,
        });
    }

    Ok(tasks)
}

/// Splits `tasks` into roughly `n` tasks of roughly equal size, preserving
/// the exact byte-level `(src+i, dst+i)` mapping of the input.
///
/// If `n <= tasks.len()`, returns a shallow copy unchanged. A degenerate
/// zero-size tail is emitted for every input task so the output count is
/// deterministic.
///
/// # Errors
///
/// [`EngineError::InvalidArgument`] if `n < 1`.
pub fn split(tasks: &[CopyTask], n: usize) -> Result<Vec<CopyTask>, EngineError> {
    if n < 1 {
        return Err(EngineError::InvalidArgument(
            "split count must be at least 1".to_owned(),
        ));
    }

    if n <= tasks.len() {
        return Ok(tasks.to_vec());
    }

    let total: u64 = tasks.iter().map(|t| t.size_bytes).sum();
    let part = {
        let computed = total / u64::try_from(n).unwrap_or(u64::MAX);
        if computed == 0 {
            1
        } else {
            computed
        }
    };

    let mut out = Vec::new();
    for task in tasks {
        let mut offset = 0_u64;
        let mut remaining = task.size_bytes;

        while remaining > part {
            out.push(CopyTask {
                src_offset: task.src_offset + offset,
                dst_offset: task.dst_offset + offset,
                size_bytes: part,
            });
            offset += part;
            remaining -= part;
        }

        out.push(CopyTask {
            src_offset: task.src_offset + offset,
            dst_offset: task.dst_offset + offset,
            size_bytes: remaining,
        });
    }

    Ok(out)
}

fn check_no_overlap<F>(tasks: &[CopyTask], offset_of: F, on_overlap: impl Fn(String) -> EngineError) -> Result<(), EngineError>
where
    F: Fn(&CopyTask) -> u64,
{
    let mut sorted: Vec<&CopyTask> = tasks.iter().collect();
    sorted.sort_by_key(|t| offset_of(t));

    for pair in sorted.windows(2) {
        let a = pair[0];
        let b = pair[1];
        if offset_of(a) + a.size_bytes > offset_of(b) {
            return Err(on_overlap(format!(
                "task at offset {} overlaps task at offset {}",
                offset_of(a),
                offset_of(b)
            )));
        }
    }

    Ok(())
}

/// Executes a byte-copy schedule from a non-seekable sequential `src` to a
/// seekable `dst`, reporting per-task progress to `progress`.
///
/// Tasks are sorted and validated for overlap (on both the source and
/// destination axes) before any byte is written. Execution then proceeds
/// in ascending `src_offset` order: bytes are discarded from `src` until
/// its task's offset is reached, `dst` is seeked to the task's
/// destination, and exactly `size_bytes` are copied. `progress` observes
/// deltas in this same execution order, not the caller's input order, and
/// is closed exactly once whether execution succeeds or fails.
///
/// # Errors
///
/// [`EngineError::SourceOverlap`] or [`EngineError::DestinationOverlap`]
/// if the precondition checks fail; [`EngineError::SourceShort`] if `src`
/// ends before a task's bytes are fully read; [`EngineError::DestinationShort`]
/// or [`EngineError::DestinationOutOfRange`] if `dst` refuses a write or
/// seek.
pub fn execute<R, W, P>(
    dst: &mut W,
    src: &mut R,
    tasks: &[CopyTask],
    progress: &mut P,
) -> Result<(), EngineError>
where
    R: Read,
    W: Write + Seek,
    P: ProgressSink,
{
    let result = execute_inner(dst, src, tasks, progress);
    progress.close();
    result
}

fn execute_inner<R, W, P>(
    dst: &mut W,
    src: &mut R,
    tasks: &[CopyTask],
    progress: &mut P,
) -> Result<(), EngineError>
where
    R: Read,
    W: Write + Seek,
    P: ProgressSink,
{
    check_no_overlap(tasks, |t| t.dst_offset, EngineError::DestinationOverlap)?;
    check_no_overlap(tasks, |t| t.src_offset, EngineError::SourceOverlap)?;

    let mut ordered: Vec<&CopyTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.src_offset);

    let mut buf = [0_u8; CHUNK_SIZE];
    let mut cursor = 0_u64;

    for task in ordered {
        let mut to_skip = task.src_offset - cursor;
        while to_skip > 0 {
            let chunk = usize::try_from(to_skip.min(buf.len() as u64)).unwrap_or(buf.len());
            let n = src.read(&mut buf[..chunk])?;
            if n == 0 {
                return Err(EngineError::SourceShort(format!(
                    "stream ended while seeking to offset {}",
                    task.src_offset
                )));
            }
            to_skip -= n as u64;
            cursor += n as u64;
        }

        dst.seek(SeekFrom::Start(task.dst_offset))
            .map_err(|e| EngineError::DestinationOutOfRange(e.to_string()))?;

        let mut remaining = task.size_bytes;
        while remaining > 0 {
            let chunk = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());
            let n = src.read(&mut buf[..chunk])?;
            if n == 0 {
                return Err(EngineError::SourceShort(format!(
                    "stream ended {remaining} bytes short of task at offset {}",
                    task.src_offset
                )));
            }

            dst.write_all(&buf[..n])
                .map_err(|e| EngineError::DestinationShort(e.to_string()))?;

            remaining -= n as u64;
            cursor += n as u64;
        }

        progress.push(task.size_bytes);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use test_log::test;

    use super::{execute, plan, split, CopyTask, ProgressSink};
    use layout::{Guid, PartitionSlot, PartitionTable};

    struct RecordingSink {
        pushes: Vec<u64>,
        closed: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                pushes: Vec::new(),
                closed: false,
            }
        }
    }

    impl ProgressSink for RecordingSink {
        fn push(&mut self, delta: u64) {
            self.pushes.push(delta);
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

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
    fn plan_pairs_by_id_and_uses_image_size() {
        let mut disk = PartitionTable::empty(1024, 8, 150);
        disk.partitions[0] = occupied(guid(1), guid(9), 10, 20);
        let mut image = PartitionTable::empty(1024, 8, 150);
        image.partitions[0] = occupied(guid(1), guid(9), 10, 20);

        let tasks = plan(&disk, &image).unwrap();
        assert_eq!(
            tasks,
            vec![CopyTask {
                src_offset: 10240,
                dst_offset: 10240,
                size_bytes: 11264,
            }]
        );
    }

    #[test]
    fn plan_skips_unmatched_ids() {
        let disk = PartitionTable::empty(1024, 8, 150);
        let mut image = PartitionTable::empty(1024, 8, 150);
        image.partitions[0] = occupied(guid(1), guid(9), 10, 20);

        assert!(plan(&disk, &image).unwrap().is_empty());
    }

    #[test]
    fn plan_ignores_bad_lba_on_uncopied_partition() {
        let disk = PartitionTable::empty(1024, 8, 150);
        let mut image = PartitionTable::empty(1024, 8, 150);
        image.partitions[0] = occupied(guid(1), guid(9), 20, 10);

        assert!(plan(&disk, &image).unwrap().is_empty());
    }

    #[test]
    fn plan_fails_on_bad_lba_for_copied_partition() {
        let mut disk = PartitionTable::empty(1024, 8, 150);
        disk.partitions[0] = occupied(guid(1), guid(9), 10, 20);
        let mut image = PartitionTable::empty(1024, 8, 150);
        image.partitions[0] = occupied(guid(1), guid(9), 20, 10);

        assert!(matches!(
            plan(&disk, &image),
            Err(types::EngineError::BadImagePartition(_))
        ));
    }

    #[test]
    fn split_no_op_when_n_covers_input() {
        let tasks = vec![CopyTask {
            src_offset: 0,
            dst_offset: 0,
            size_bytes: 10,
        }];
        assert_eq!(split(&tasks, 1).unwrap(), tasks);
    }

    #[test]
    fn split_rejects_zero_n() {
        assert!(split(&[], 0).is_err());
    }

    #[test]
    fn split_preserves_byte_mapping() {
        let tasks = vec![CopyTask {
            src_offset: 45,
            dst_offset: 22,
            size_bytes: 91,
        }];
        let out = split(&tasks, 10).unwrap();

        assert!(out.len() >= 8 && out.len() <= 11);

        let mut expected: Vec<(u64, u64)> = (0..91).map(|i| (45 + i, 22 + i)).collect();
        let mut actual: Vec<(u64, u64)> = Vec::new();
        for t in &out {
            for i in 0..t.size_bytes {
                actual.push((t.src_offset + i, t.dst_offset + i));
            }
        }
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(expected, actual);
    }

    #[test]
    fn execute_rejects_source_overlap() {
        let src_bytes = [0x03, 0x88, 0x45, 0xAA, 0x88, 0x99, 0xFE, 0x72];
        let dst_bytes = [0x45, 0x77, 0x89, 0x82, 0x56, 0x32, 0xAA, 0xBC];

        let tasks = vec![
            CopyTask {
                src_offset: 0,
                dst_offset: 0,
                size_bytes: 3,
            },
            CopyTask {
                src_offset: 2,
                dst_offset: 5,
                size_bytes: 1,
            },
        ];

        let mut src = Cursor::new(src_bytes.to_vec());
        let mut dst = Cursor::new(dst_bytes.to_vec());
        let mut sink = RecordingSink::new();

        let result = execute(&mut dst, &mut src, &tasks, &mut sink);
        assert!(matches!(result, Err(types::EngineError::SourceOverlap(_))));
        assert_eq!(dst.into_inner(), dst_bytes);
        assert!(sink.closed);
    }

    #[test]
    fn execute_reverse_permutation() {
        let src_bytes = [0x03, 0x88, 0x45, 0xAA, 0x88, 0x99, 0xFE, 0x72];

        let tasks: Vec<CopyTask> = (0..8)
            .map(|i| CopyTask {
                src_offset: i,
                dst_offset: 7 - i,
                size_bytes: 1,
            })
            .collect();

        let mut src = Cursor::new(src_bytes.to_vec());
        let mut dst = Cursor::new(vec![0_u8; 8]);
        let mut sink = RecordingSink::new();

        execute(&mut dst, &mut src, &tasks, &mut sink).unwrap();

        assert_eq!(
            dst.into_inner(),
            vec![0x72, 0xFE, 0x99, 0x88, 0xAA, 0x45, 0x88, 0x03]
        );
        assert_eq!(sink.pushes.iter().sum::<u64>(), 8);
        assert!(sink.closed);
    }

    #[test]
    fn execute_closes_sink_on_failure() {
        let tasks = vec![CopyTask {
            src_offset: 0,
            dst_offset: 0,
            size_bytes: 100,
        }];

        let mut src = Cursor::new(vec![0_u8; 4]);
        let mut dst = Cursor::new(vec![0_u8; 100]);
        let mut sink = RecordingSink::new();

        let result = execute(&mut dst, &mut src, &tasks, &mut sink);
        assert!(matches!(result, Err(types::EngineError::SourceShort(_))));
        assert!(sink.closed);
    }
}
