//! GUID Partition Table decode/encode.
//!
//! Serializes and deserializes a [`layout::PartitionTable`] to and from
//! the on-disk GPT binary format: a protective MBR, primary header and
//! partition array, and their backup copies at the end of the disk.
//! Placement of individual partitions is decided upstream, by the
//! reconciliation engine; this crate only speaks bytes.

use std::fs::File;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

use layout::{Guid, PartitionSlot, PartitionTable, NAME_LEN_UTF16, PARTITION_ARRAY_LEN};
use log::debug;
use part::num_cast;
use types::EngineError;

const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645;
const GPT_VERSION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE_LBA: u64 = 1;
const GPT_HEADER_BYTES: usize = 92;
const GPT_PARTITION_ENTRY_SIZE: usize = 128;
const GPT_PARTITION_ARRAY_BYTES: usize = PARTITION_ARRAY_LEN * GPT_PARTITION_ENTRY_SIZE;

/// Number of LBAs the partition array occupies for a given `sector_size`,
/// rounding up so the array never shares its last LBA with anything else.
fn partition_array_lba(sector_size: u64) -> u64 {
    part::div_round_up(GPT_PARTITION_ARRAY_BYTES as u64, sector_size)
}

/// Standard EFI System Partition GUID.
pub const EFI_SYSTEM_PART_GUID: Guid =
    Guid::from_bytes([
        0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9,
        0x3b,
    ]);

fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn guid_field(bytes: &[u8]) -> Guid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Guid::from_bytes(raw)
}

struct Geometry {
    primary_header_lba: u64,
    primary_table_lba: u64,
    backup_table_lba: u64,
    backup_header_lba: u64,
}

fn geometry(total_lba: u64, sector_size: u64) -> Result<Geometry, EngineError> {
    let array_lba = partition_array_lba(sector_size);

    let primary_header_lba = 1;
    let primary_table_lba = primary_header_lba + GPT_HEADER_SIZE_LBA;
    let first_usable_lba = primary_table_lba + array_lba;

    let too_small = || {
        EngineError::InvalidDiskGeometry(format!(
            "disk of {total_lba} LBAs of {sector_size} bytes is too small to hold a GPT"
        ))
    };

    let backup_header_lba = total_lba.checked_sub(GPT_HEADER_SIZE_LBA).ok_or_else(too_small)?;
    let backup_table_lba = backup_header_lba
        .checked_sub(array_lba)
        .ok_or_else(too_small)?;
    let last_usable_lba = backup_table_lba.checked_sub(1).ok_or_else(too_small)?;

    if first_usable_lba > last_usable_lba {
        return Err(too_small());
    }

    Ok(Geometry {
        primary_header_lba,
        primary_table_lba,
        backup_table_lba,
        backup_header_lba,
    })
}

fn encode_entries(table: &PartitionTable) -> Vec<u8> {
    let mut parts = vec![0u8; GPT_PARTITION_ARRAY_BYTES];

    for (slot, chunk) in table
        .partitions
        .iter()
        .zip(parts.chunks_exact_mut(GPT_PARTITION_ENTRY_SIZE))
    {
        if slot.is_empty() {
            continue;
        }

        chunk[0..16].copy_from_slice(&slot.type_guid.to_bytes());
        chunk[16..32].copy_from_slice(&slot.unique_guid.to_bytes());
        chunk[32..40].copy_from_slice(&slot.first_lba.to_le_bytes());
        chunk[40..48].copy_from_slice(&slot.last_lba.to_le_bytes());
        chunk[48..56].copy_from_slice(&slot.flags.to_le_bytes());

        let mut pos = 56;
        for unit in slot.name {
            chunk[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
            pos += 2;
        }
    }

    parts
}

fn decode_entries(bytes: &[u8]) -> [PartitionSlot; PARTITION_ARRAY_LEN] {
    let mut partitions = [PartitionSlot::EMPTY; PARTITION_ARRAY_LEN];

    for (slot, chunk) in partitions
        .iter_mut()
        .zip(bytes.chunks_exact(GPT_PARTITION_ENTRY_SIZE))
    {
        let type_guid = guid_field(&chunk[0..16]);
        if type_guid.is_zero() {
            continue;
        }

        let mut name = [0u16; NAME_LEN_UTF16];
        for (i, unit) in name.iter_mut().enumerate() {
            let pos = 56 + i * 2;
            *unit = u16::from_le_bytes([chunk[pos], chunk[pos + 1]]);
        }

        *slot = PartitionSlot {
            type_guid,
            unique_guid: guid_field(&chunk[16..32]),
            first_lba: u64::from_le_bytes(chunk[32..40].try_into().unwrap()),
            last_lba: u64::from_le_bytes(chunk[40..48].try_into().unwrap()),
            name,
            flags: u64::from_le_bytes(chunk[48..56].try_into().unwrap()),
        };
    }

    partitions
}

fn encode_header(
    disk_guid: Guid,
    this_header_lba: u64,
    other_header_lba: u64,
    table_lba: u64,
    first_usable: u64,
    last_usable: u64,
    entries_crc: u32,
) -> [u8; GPT_HEADER_BYTES] {
    let mut header = [0u8; GPT_HEADER_BYTES];

    header[0..8].copy_from_slice(&GPT_SIGNATURE.to_le_bytes());
    header[8..12].copy_from_slice(&GPT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&num_cast!(u32, GPT_HEADER_BYTES).to_le_bytes());
    header[24..32].copy_from_slice(&this_header_lba.to_le_bytes());
    header[32..40].copy_from_slice(&other_header_lba.to_le_bytes());
    header[40..48].copy_from_slice(&first_usable.to_le_bytes());
    header[48..56].copy_from_slice(&last_usable.to_le_bytes());
    header[56..72].copy_from_slice(&disk_guid.to_bytes());
    header[72..80].copy_from_slice(&table_lba.to_le_bytes());
    header[80..84].copy_from_slice(&num_cast!(u32, PARTITION_ARRAY_LEN).to_le_bytes());
    header[84..88].copy_from_slice(&num_cast!(u32, GPT_PARTITION_ENTRY_SIZE).to_le_bytes());
    header[88..92].copy_from_slice(&entries_crc.to_le_bytes());

    let header_crc = checksum(&header);
    header[16..20].copy_from_slice(&header_crc.to_le_bytes());

    header
}

/// Writes `table` as a GPT to `file`, covering the whole of `file`'s
/// current length, with both the primary and backup copies plus a
/// protective MBR.
///
/// # Errors
///
/// [`EngineError::InvalidDiskGeometry`] if `file` is too small for a GPT
/// of this partition count, or any I/O failure.
pub fn write(file: &File, table: &PartitionTable, disk_guid: Guid) -> Result<(), EngineError> {
    let mut file = file;
    let sector_size = table.sector_size;
    let total_lba = file.metadata()?.len() / sector_size;
    let geo = geometry(total_lba, sector_size)?;

    debug!("Writing GPT: first usable LBA {}, backup header at LBA {}", table.first_usable_lba, geo.backup_header_lba);

    mbr::write(file, &[mbr::MbrEntry::protective(total_lba)])?;

    let entries = encode_entries(table);
    let entries_crc = checksum(&entries);

    let primary_header = encode_header(
        disk_guid,
        geo.primary_header_lba,
        geo.backup_header_lba,
        geo.primary_table_lba,
        table.first_usable_lba,
        table.last_usable_lba,
        entries_crc,
    );
    let backup_header = encode_header(
        disk_guid,
        geo.backup_header_lba,
        geo.primary_header_lba,
        geo.backup_table_lba,
        table.first_usable_lba,
        table.last_usable_lba,
        entries_crc,
    );

    file.seek(SeekFrom::Start(geo.primary_header_lba * sector_size))?;
    file.write_all(&primary_header)?;

    file.seek(SeekFrom::Start(geo.primary_table_lba * sector_size))?;
    file.write_all(&entries)?;

    file.seek(SeekFrom::Start(geo.backup_table_lba * sector_size))?;
    file.write_all(&entries)?;

    file.seek(SeekFrom::Start(geo.backup_header_lba * sector_size))?;
    file.write_all(&backup_header)?;

    file.flush()?;
    file.sync_data()?;

    Ok(())
}

/// Reads the GPT disk GUID and partition table from `file`.
///
/// Reads the primary header and array; if the primary header's checksum
/// is invalid, falls back to the backup copy at the end of the disk.
///
/// # Errors
///
/// [`EngineError::InvalidLayout`] if neither copy validates, or any I/O
/// failure.
pub fn read(file: &File, sector_size: u64) -> Result<(Guid, PartitionTable), EngineError> {
    let total_lba = file.metadata()?.len() / sector_size;
    let geo = geometry(total_lba, sector_size)?;

    if let Some(result) = read_copy(file, geo.primary_header_lba, geo.primary_table_lba, sector_size)? {
        return Ok(result);
    }

    debug!("Primary GPT header invalid, falling back to backup");

    read_copy(file, geo.backup_header_lba, geo.backup_table_lba, sector_size)?.ok_or_else(|| {
        EngineError::InvalidLayout("neither primary nor backup GPT header is valid".to_owned())
    })
}

fn read_copy(
    file: &File,
    header_lba: u64,
    table_lba: u64,
    sector_size: u64,
) -> Result<Option<(Guid, PartitionTable)>, EngineError> {
    let mut file = file;
    file.seek(SeekFrom::Start(header_lba * sector_size))?;
    let mut header = [0u8; GPT_HEADER_BYTES];
    file.read_exact(&mut header)?;

    let signature = u64::from_le_bytes(header[0..8].try_into().unwrap());
    if signature != GPT_SIGNATURE {
        return Ok(None);
    }

    let stored_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let mut check_copy = header;
    check_copy[16..20].copy_from_slice(&[0, 0, 0, 0]);
    if checksum(&check_copy) != stored_crc {
        return Ok(None);
    }

    let first_usable = u64::from_le_bytes(header[40..48].try_into().unwrap());
    let last_usable = u64::from_le_bytes(header[48..56].try_into().unwrap());
    let disk_guid = guid_field(&header[56..72]);
    let entries_crc = u32::from_le_bytes(header[88..92].try_into().unwrap());

    file.seek(SeekFrom::Start(table_lba * sector_size))?;
    let mut entries = vec![0u8; GPT_PARTITION_ARRAY_BYTES];
    file.read_exact(&mut entries)?;

    if checksum(&entries) != entries_crc {
        return Ok(None);
    }

    Ok(Some((
        disk_guid,
        PartitionTable {
            sector_size,
            first_usable_lba: first_usable,
            last_usable_lba: last_usable,
            partitions: decode_entries(&entries),
        },
    )))
}
