//! Network-orchestrated disk-flashing agent: fetches a disk image,
//! reconciles its partition table against the target disk's, commits the
//! merged table, copies the image's partitions across, and optionally
//! installs an EFI boot entry and powers the host down or reboots it.
#![allow(clippy::multiple_crate_versions)]

use std::fs::File;
use std::io::{Seek as _, SeekFrom};
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::Parser;
use engine::ProgressSink;
use layout::{Guid, PersistentDescriptor};
use log::{debug, info};
use types::PowerAction;

mod disk;
mod efivars;

/// A `unique-guid:type-guid:size-bytes` persistent-partition descriptor,
/// as accepted on the command line.
#[derive(Clone, Debug)]
struct PersistentArg(PersistentDescriptor);

impl std::str::FromStr for PersistentArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(unique_guid), Some(type_guid), Some(size_bytes)) =
            (parts.next(), parts.next(), parts.next())
        else {
            bail!("persistent partition must be `unique-guid:type-guid:size-bytes`, got `{s}`");
        };

        let size_bytes: u64 = size_bytes
            .parse()
            .with_context(|| format!("invalid size `{size_bytes}`"))?;

        Ok(Self(PersistentDescriptor::parse(
            unique_guid,
            type_guid,
            size_bytes,
        )?))
    }
}

#[derive(Parser)]
#[command(version, about = "Network-orchestrated disk-flashing agent")]
struct Cli {
    /// Serial number of the disk to flash.
    #[arg(long)]
    disk_serial: String,

    /// URL of the disk image to fetch and write.
    #[arg(long)]
    image_url: String,

    /// Sector size the image was built for, in bytes.
    #[arg(long, default_value_t = 512)]
    image_sector_size: u64,

    /// EFI boot path to register, e.g. `\EFI\systemd\systemd-bootx64.efi`.
    #[arg(long)]
    boot_path: Option<String>,

    /// Partitions to preserve across the flash, as `unique-guid:type-guid:size-bytes`.
    #[arg(long = "persistent", value_name = "UNIQUE:TYPE:SIZE")]
    persistent_partitions: Vec<PersistentArg>,

    /// What to do with the host once flashing completes.
    #[arg(long, value_enum, default_value_t)]
    power_action: PowerAction,
}

/// Finds the occupied disk slot whose `unique_guid` matches an image slot
/// carrying `boot_path`'s partition, so the EFI boot entry points at the
/// partition the image actually landed in.
fn boot_partition<'a>(
    final_disk_gpt: &'a layout::PartitionTable,
    image_gpt: &layout::PartitionTable,
) -> Option<(&'a layout::PartitionSlot, usize)> {
    image_gpt
        .occupied()
        .find(|slot| slot.type_guid == gpt::EFI_SYSTEM_PART_GUID)
        .and_then(|image_slot| {
            final_disk_gpt
                .partitions
                .iter()
                .enumerate()
                .find(|(_, slot)| slot.unique_guid == image_slot.unique_guid)
                .map(|(idx, slot)| (slot, idx))
        })
}

struct LoggingProgress {
    copied: u64,
    total: u64,
}

impl ProgressSink for LoggingProgress {
    fn push(&mut self, delta: u64) {
        self.copied += delta;
        info!("Copied {} / {} bytes", self.copied, self.total);
    }

    fn close(&mut self) {
        debug!("Copy executor finished");
    }
}

fn fetch_image(url: &str) -> anyhow::Result<(temp_dir::TempDir, File)> {
    info!("Fetching image from {url}");

    let dir = temp_dir::TempDir::new().context("creating temp dir for image download")?;
    let path: PathBuf = dir.path().join("image");

    let mut response = reqwest::blocking::get(url)
        .with_context(|| format!("fetching {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} returned an error status"))?;

    let mut file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .context("creating local image file")?;

    response
        .copy_to(&mut file)
        .context("writing fetched image to disk")?;
    file.sync_data()?;
    file.seek(SeekFrom::Start(0))?;

    Ok((dir, file))
}

fn install_boot_entry(
    boot_path: &str,
    disk_guid: Guid,
    final_disk_gpt: &layout::PartitionTable,
    image_gpt: &layout::PartitionTable,
) -> anyhow::Result<()> {
    if !efivars::is_efi_booted() {
        info!("Not booted via EFI; skipping boot entry installation");
        return Ok(());
    }

    let (slot, idx) =
        boot_partition(final_disk_gpt, image_gpt).context("image carries no EFI system partition")?;

    let partition_size = (slot.last_lba - slot.first_lba + 1) * final_disk_gpt.sector_size;
    let entry = efivars::BootEntry {
        description: String::new(),
        disk_guid,
        path: boot_path.to_owned(),
        partition_number: u32::try_from(idx + 1).unwrap_or(u32::MAX),
        partition_start: slot.first_lba,
        partition_size,
    };

    let existing_order = efivars::read_boot_order().context("reading BootOrder")?;
    let existing_entries = efivars::read_boot_entries().context("enumerating Boot#### variables")?;
    let update = efivars::plan_update(&existing_order, &existing_entries, entry)
        .context("planning EFI boot entry update")?;

    efivars::write_boot_entry(update.boot_entry_id, &update.boot_entry)
        .context("writing EFI boot entry")?;
    efivars::write_boot_order(&update.order)
        .context("writing BootOrder")?;

    info!("Installed EFI boot entry {:04X}", update.boot_entry_id);
    Ok(())
}

fn apply_power_action(action: PowerAction) -> anyhow::Result<()> {
    use nix::sys::reboot::{reboot, RebootMode};

    match action {
        PowerAction::None => Ok(()),
        PowerAction::Reboot => {
            info!("Rebooting");
            reboot(RebootMode::RB_AUTOBOOT).context("rebooting")?;
            Ok(())
        }
        PowerAction::PowerOff => {
            info!("Powering off");
            reboot(RebootMode::RB_POWER_OFF).context("powering off")?;
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let target = disk::find_by_serial(&cli.disk_serial)?;
    info!(
        "Target disk: {} ({} sectors of {} bytes)",
        target.device_node.display(),
        target.total_lba,
        target.sector_size
    );

    let disk_file = disk::open(&target).context("opening target disk")?;
    let (disk_guid, mut disk_gpt, created) = disk::get_or_create_gpt(&disk_file, &target)?;
    if created {
        info!("Initialized a fresh GPT with disk GUID {disk_guid}");
    }

    let (_image_dir, image_file) = fetch_image(&cli.image_url)?;
    let (_image_guid, image_gpt) = gpt::read(&image_file, cli.image_sector_size)
        .context("reading image's partition table")?;

    let persistent: Vec<PersistentDescriptor> = cli
        .persistent_partitions
        .iter()
        .map(|p| p.0)
        .collect();

    engine::merge(&mut disk_gpt, &image_gpt, &persistent).context("merging partition tables")?;

    gpt::write(&disk_file, &disk_gpt, disk_guid).context("writing partition table to disk")?;

    let tasks = engine::plan(&disk_gpt, &image_gpt).context("planning copy tasks")?;
    let total: u64 = tasks.iter().map(|t| t.size_bytes).sum();
    info!("Copying {} bytes across {} tasks", total, tasks.len());

    let mut image_reader = &image_file;
    let mut disk_writer = &disk_file;
    let mut progress = LoggingProgress { copied: 0, total };
    engine::execute(&mut disk_writer, &mut image_reader, &tasks, &mut progress)
        .context("copying image contents to disk")?;

    if let Some(boot_path) = &cli.boot_path {
        install_boot_entry(boot_path, disk_guid, &disk_gpt, &image_gpt)?;
    }

    apply_power_action(cli.power_action)?;

    Ok(())
}
