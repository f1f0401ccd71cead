//! Protective/legacy MBR partition table encoding and decoding.
//!
//! A disk using GPT carries a single-entry "protective" MBR at LBA 0 so
//! legacy tools that only understand MBR see one opaque partition
//! spanning the disk (type `0xEE`) instead of free space they might
//! otherwise try to repartition. This crate also supports writing and
//! reading plain legacy MBR tables with up to four entries, since nothing
//! about the on-disk format requires the protective-MBR use case.

use std::fs::File;
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};

use log::debug;
use num_traits::ToPrimitive as _;
use part::num_cast;

const LBA_SIZE: usize = 512;

const MBR_PART_ENTRY_OFFSET_BYTES: usize = 446;
const MBR_PART_ENTRY_SIZE_BYTES: usize = 16;
const MBR_MAX_ENTRIES: usize = 4;
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// GPT's protective partition type: a single entry spanning (up to)
/// `0xFFFF_FFFF` LBAs, so legacy tools see the disk as fully allocated.
pub const PROTECTIVE_PARTITION_TYPE: u8 = 0xee;

const DEFAULT_HEADS_PER_CYLINDER: u8 = 16;
const DEFAULT_SECTORS_PER_TRACK: u8 = 63;

/// A single legacy MBR partition table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MbrEntry {
    /// The one-byte MBR partition type code.
    pub partition_type: u8,
    /// First LBA, inclusive.
    pub first_lba: u64,
    /// Last LBA, inclusive.
    pub last_lba: u64,
    /// Whether the legacy BIOS-bootable flag is set.
    pub bootable: bool,
}

impl MbrEntry {
    /// Builds the protective entry GPT expects at MBR slot 0: type
    /// `0xEE`, spanning the disk (clamped to `u32::MAX` LBAs, since the
    /// legacy fields can't hold more).
    #[must_use]
    pub fn protective(total_lba: u64) -> Self {
        Self {
            partition_type: PROTECTIVE_PARTITION_TYPE,
            first_lba: 1,
            last_lba: (total_lba - 1).min(u64::from(u32::MAX)),
            bootable: false,
        }
    }
}

fn lba_to_chs_bytes(lba: u64) -> [u8; 3] {
    let hpc = u64::from(DEFAULT_HEADS_PER_CYLINDER);
    let spt = u64::from(DEFAULT_SECTORS_PER_TRACK);

    let c = lba / (hpc * spt);
    let h = (lba / spt) % hpc;
    let s = (lba % spt) + 1;

    if c > (1 << 10) - 1 {
        // Cylinder doesn't fit: every LBA-aware tool ignores CHS and
        // reads the LBA fields instead, so the convention is to saturate.
        [0xff, 0xff, 0xff]
    } else {
        let c_lo = num_cast!(u8, c & 0xff);
        let c_hi = num_cast!(u8, (c >> 8) & 0x3);
        [num_cast!(u8, h), (c_hi << 6) | num_cast!(u8, s & 0x3f), c_lo]
    }
}

/// Writes a legacy/protective MBR to `file` at LBA 0.
///
/// # Errors
///
/// Returns an error if `entries` has more than 4 entries, or on any I/O
/// failure.
///
/// # Panics
///
/// Panics on integer overflow converting an entry's LBA span to the
/// 32-bit legacy field (values should be checked by the caller).
pub fn write(mut file: &File, entries: &[MbrEntry]) -> io::Result<()> {
    if entries.len() > MBR_MAX_ENTRIES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("MBR supports at most {MBR_MAX_ENTRIES} entries, got {}", entries.len()),
        ));
    }

    let mut mbr = [0u8; LBA_SIZE];

    let disk_id = rand::random::<u32>();
    debug!("Using Disk Identifier 0x{disk_id:x}");
    mbr[440..444].copy_from_slice(&disk_id.to_le_bytes());

    for (idx, entry) in entries.iter().enumerate() {
        let mut raw = [0u8; MBR_PART_ENTRY_SIZE_BYTES];
        raw[0] = if entry.bootable { 0x80 } else { 0x00 };
        raw[1..4].copy_from_slice(&lba_to_chs_bytes(entry.first_lba));
        raw[4] = entry.partition_type;
        raw[5..8].copy_from_slice(&lba_to_chs_bytes(entry.last_lba));
        raw[8..12].copy_from_slice(
            &num_cast!(u32, entry.first_lba).to_le_bytes(),
        );

        let size_lba = (entry.last_lba - entry.first_lba + 1)
            .to_u32()
            .unwrap_or(u32::MAX);
        raw[12..16].copy_from_slice(&size_lba.to_le_bytes());

        let offset = MBR_PART_ENTRY_OFFSET_BYTES + MBR_PART_ENTRY_SIZE_BYTES * idx;
        mbr[offset..offset + MBR_PART_ENTRY_SIZE_BYTES].copy_from_slice(&raw);
    }

    mbr[510..512].copy_from_slice(&MBR_BOOT_SIGNATURE);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&mbr)?;
    file.flush()?;
    file.sync_data()?;

    Ok(())
}

/// Reads the MBR partition entries at LBA 0 of `file`.
///
/// CHS fields are ignored on read, as is conventional: every consumer
/// that matters reads the 32-bit LBA/size fields.
///
/// # Errors
///
/// [`io::ErrorKind::InvalidData`] if the boot signature (`0x55 0xAA`) is
/// missing, or any I/O failure.
pub fn read(mut file: &File) -> io::Result<Vec<MbrEntry>> {
    file.seek(SeekFrom::Start(0))?;

    let mut mbr = [0u8; LBA_SIZE];
    file.read_exact(&mut mbr)?;

    if mbr[510..512] != MBR_BOOT_SIGNATURE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing MBR boot signature",
        ));
    }

    let mut entries = Vec::new();
    for idx in 0..MBR_MAX_ENTRIES {
        let offset = MBR_PART_ENTRY_OFFSET_BYTES + MBR_PART_ENTRY_SIZE_BYTES * idx;
        let raw = &mbr[offset..offset + MBR_PART_ENTRY_SIZE_BYTES];

        let partition_type = raw[4];
        if partition_type == 0 {
            continue;
        }

        let first_lba = u64::from(u32::from_le_bytes(raw[8..12].try_into().unwrap()));
        let size_lba = u64::from(u32::from_le_bytes(raw[12..16].try_into().unwrap()));

        entries.push(MbrEntry {
            partition_type,
            first_lba,
            last_lba: first_lba + size_lba - 1,
            bootable: raw[0] & 0x80 != 0,
        });
    }

    Ok(entries)
}
