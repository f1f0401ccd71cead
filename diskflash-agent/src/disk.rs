//! Target-disk discovery and GPT bootstrap.
//!
//! Disks are addressed by serial number rather than by device node, since
//! device nodes are not stable across reboots. The serial is read out of
//! sysfs rather than through a block-enumeration library, since that's all
//! a udev-backed one would do under the hood anyway.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use layout::{Guid, PartitionTable};
use log::{debug, info};

const SYSFS_BLOCK: &str = "/sys/class/block";
const MIN_USABLE_LBA_COUNT: u64 = 4096;
const DEFAULT_FIRST_USABLE_LBA: u64 = 34;

/// A block device located by serial number.
#[derive(Debug)]
pub(crate) struct TargetDisk {
    pub device_node: PathBuf,
    pub sector_size: u64,
    pub total_lba: u64,
}

fn read_trimmed(path: &std::path::Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_owned())
}

fn device_serial(block_dir: &std::path::Path) -> Option<String> {
    read_trimmed(&block_dir.join("device/serial")).ok()
}

/// Finds the sole block device whose serial number equals `serial`.
///
/// # Errors
///
/// Fails if no device matches, if more than one device matches, or on any
/// I/O failure enumerating `/sys/class/block`.
pub(crate) fn find_by_serial(serial: &str) -> anyhow::Result<TargetDisk> {
    if serial.is_empty() {
        bail!("empty disk serial number");
    }

    let mut found: Option<PathBuf> = None;

    for entry in fs::read_dir(SYSFS_BLOCK).context("enumerating block devices")? {
        let entry = entry?;
        let block_dir = entry.path();

        let Some(dev_serial) = device_serial(&block_dir) else {
            continue;
        };

        if dev_serial != serial {
            continue;
        }

        if found.is_some() {
            bail!("duplicate serial number {serial} among block devices");
        }

        found = Some(block_dir);
    }

    let block_dir = found.with_context(|| format!("no disk with serial {serial} found"))?;
    let name = block_dir
        .file_name()
        .context("block device path has no name")?;
    let device_node = PathBuf::from("/dev").join(name);

    let sector_size: u64 = read_trimmed(&block_dir.join("queue/logical_block_size"))
        .context("reading logical_block_size")?
        .parse()
        .context("parsing logical_block_size")?;
    let size_512_sectors: u64 = read_trimmed(&block_dir.join("size"))
        .context("reading device size")?
        .parse()
        .context("parsing device size")?;
    let total_lba = size_512_sectors * 512 / sector_size;

    debug!("Found disk {serial} at {}", device_node.display());

    Ok(TargetDisk {
        device_node,
        sector_size,
        total_lba,
    })
}

/// Opens the target disk's device node for reading and writing.
pub(crate) fn open(target: &TargetDisk) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&target.device_node)
}

fn empty_table(target: &TargetDisk) -> anyhow::Result<PartitionTable> {
    if target.total_lba < MIN_USABLE_LBA_COUNT {
        bail!(
            "disk too small to host a GPT ({} sectors of {} bytes)",
            target.total_lba,
            target.sector_size
        );
    }
    if target.sector_size < 128 {
        bail!("unexpectedly small sector size ({} bytes)", target.sector_size);
    }

    let last_usable = target.total_lba - DEFAULT_FIRST_USABLE_LBA - 1;
    Ok(PartitionTable::empty(
        target.sector_size,
        DEFAULT_FIRST_USABLE_LBA,
        last_usable,
    ))
}

/// Reads the disk's existing GPT, or creates a fresh empty one if the disk
/// carries no valid GPT signature.
///
/// Any other read failure (a corrupt-but-signed table) is propagated
/// rather than silently overwritten, mirroring the "only an unsigned disk
/// gets a fresh table" policy of the on-disk bootstrap path this is
/// grounded on.
pub(crate) fn get_or_create_gpt(
    file: &File,
    target: &TargetDisk,
) -> anyhow::Result<(Guid, PartitionTable, bool)> {
    match gpt::read(file, target.sector_size) {
        Ok((disk_guid, table)) => Ok((disk_guid, table, false)),
        Err(types::EngineError::InvalidLayout(_)) => {
            info!("Disk has no valid GPT signature; creating a fresh table");
            let table = empty_table(target)?;
            Ok((Guid::from_bytes(rand::random()), table, true))
        }
        Err(e) => Err(e.into()),
    }
}
