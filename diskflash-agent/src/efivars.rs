//! EFI boot-variable codec, planner, and I/O.
//!
//! An out-of-core collaborator (spec \S6): the engine hands this module a
//! GPT partition it just wrote and an ESP-relative loader path, and this
//! module arranges for firmware to boot from it next, by creating or
//! updating a `Boot####` UEFI load option and moving it to the front of
//! `BootOrder`.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context as _};
use layout::Guid;

const EFIVARS_PATH: &str = "/sys/firmware/efi/efivars";
const EFI_GLOBAL_SUFFIX: &str = "-8be4df61-93ca-11d2-aa0d-00e098032b8c";
const BOOT_ENTRY_DESCRIPTION: &str = "Diskflash (boot from disk)";

const LOAD_OPTION_ACTIVE: u32 = 0x0000_0001;
/// Leading 4 attribute bytes every efivars-filesystem variable write needs;
/// firmware ignores it for `BootOrder`/`Boot####` but refuses the write
/// without it.
const VAR_ATTRS: [u8; 4] = [0x07, 0x00, 0x00, 0x00];

const HARD_DRIVE_MEDIA_TYPE: u8 = 0x04;
const HARD_DRIVE_MEDIA_SUBTYPE: u8 = 0x01;
const HARD_DRIVE_MEDIA_LEN: u16 = 42;
const FILE_PATH_MEDIA_TYPE: u8 = 0x04;
const FILE_PATH_MEDIA_SUBTYPE: u8 = 0x04;
const END_ENTIRE_DEVICE_PATH: [u8; 4] = [0x7f, 0xff, 0x04, 0x00];
const GPT_SIGNATURE_TYPE: u8 = 0x02;
const GPT_PARTITION_FORMAT: u8 = 0x02;

/// A UEFI `Boot####` load option identifying a partition and an EFI
/// executable on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BootEntry {
    pub description: String,
    pub disk_guid: Guid,
    pub path: String,
    pub partition_number: u32,
    pub partition_start: u64,
    pub partition_size: u64,
}

fn utf16_nul(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

impl BootEntry {
    /// Encodes this entry in the UEFI load-option binary format.
    ///
    /// # Errors
    ///
    /// Fails if any required field is unset (`description`, `disk_guid`,
    /// `path`, `partition_number`, `partition_start`, `partition_size`), or
    /// if the encoded device path would overflow the 16-bit length field.
    pub(crate) fn marshal(&self) -> anyhow::Result<Vec<u8>> {
        if self.description.is_empty() {
            bail!("BootEntry.description must not be empty");
        }
        if self.disk_guid.is_zero() {
            bail!("BootEntry.disk_guid must not be zero");
        }
        if self.path.is_empty() {
            bail!("BootEntry.path must not be empty");
        }
        if self.partition_number == 0 {
            bail!("BootEntry.partition_number must not be zero");
        }
        if self.partition_start == 0 {
            bail!("BootEntry.partition_start must not be zero");
        }
        if self.partition_size == 0 {
            bail!("BootEntry.partition_size must not be zero");
        }

        let path_utf16 = utf16_nul(&self.path);
        let file_path_len = 4 + path_utf16.len();
        let path_list_len = usize::from(HARD_DRIVE_MEDIA_LEN) + file_path_len + 4;

        let mut out = Vec::new();
        out.extend_from_slice(&LOAD_OPTION_ACTIVE.to_le_bytes());
        out.extend_from_slice(
            &u16::try_from(path_list_len)
                .context("device path too large for a u16 length field")?
                .to_le_bytes(),
        );
        out.extend_from_slice(&utf16_nul(&self.description));

        out.push(HARD_DRIVE_MEDIA_TYPE);
        out.push(HARD_DRIVE_MEDIA_SUBTYPE);
        out.extend_from_slice(&HARD_DRIVE_MEDIA_LEN.to_le_bytes());
        out.extend_from_slice(&self.partition_number.to_le_bytes());
        out.extend_from_slice(&self.partition_start.to_le_bytes());
        out.extend_from_slice(&self.partition_size.to_le_bytes());
        out.extend_from_slice(&self.disk_guid.to_bytes());
        out.push(GPT_PARTITION_FORMAT);
        out.push(GPT_SIGNATURE_TYPE);

        out.push(FILE_PATH_MEDIA_TYPE);
        out.push(FILE_PATH_MEDIA_SUBTYPE);
        out.extend_from_slice(
            &u16::try_from(file_path_len)
                .context("file path too large for a u16 length field")?
                .to_le_bytes(),
        );
        out.extend_from_slice(&path_utf16);

        out.extend_from_slice(&END_ENTIRE_DEVICE_PATH);

        Ok(out)
    }
}

/// A UEFI `BootOrder` variable: an ordered list of `Boot####` IDs.
pub(crate) type BootOrder = Vec<u16>;

fn marshal_boot_order(order: &BootOrder) -> Vec<u8> {
    let mut out = VAR_ATTRS.to_vec();
    for id in order {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

fn unmarshal_boot_order(data: &[u8]) -> anyhow::Result<BootOrder> {
    if data.len() < 4 {
        bail!("BootOrder variable shorter than the 4-byte attribute prefix");
    }
    let ids = &data[4..];
    if !ids.len().is_multiple_of(2) {
        bail!("BootOrder variable has an odd number of id bytes");
    }

    Ok(ids
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn boot_entry_path(id: u16) -> String {
    format!("Boot{id:04X}{EFI_GLOBAL_SUFFIX}")
}

/// Parses a `Boot####` variable's filename, returning its id if the name
/// matches `Boot` + 4 hex digits + the EFI global variable GUID suffix.
fn parse_boot_entry_filename(name: &str) -> Option<u16> {
    let hex = name.strip_prefix("Boot")?.strip_suffix(EFI_GLOBAL_SUFFIX)?;
    if hex.len() != 4 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

fn read_entry_description(id: u16) -> Option<String> {
    let path = Path::new(EFIVARS_PATH).join(boot_entry_path(id));
    let data = fs::read(&path).ok()?;
    if data.len() < 6 {
        return None;
    }
    let desc_units: Vec<u16> = data[6..]
        .chunks_exact(2)
        .map_while(|c| {
            let unit = u16::from_le_bytes([c[0], c[1]]);
            (unit != 0).then_some(unit)
        })
        .collect();
    Some(String::from_utf16_lossy(&desc_units))
}

/// Enumerates every `Boot####` variable currently present under
/// `/sys/firmware/efi/efivars`, independent of whether it's listed in
/// `BootOrder`. Each entry is paired with its description, read once here
/// rather than re-read later by id.
///
/// # Errors
///
/// Fails if the efivars directory can't be listed.
pub(crate) fn read_boot_entries() -> anyhow::Result<Vec<(u16, Option<String>)>> {
    let mut entries = Vec::new();
    for dir_entry in
        fs::read_dir(EFIVARS_PATH).with_context(|| format!("reading {EFIVARS_PATH}"))?
    {
        let dir_entry = dir_entry.with_context(|| format!("reading {EFIVARS_PATH}"))?;
        let Some(name) = dir_entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Some(id) = parse_boot_entry_filename(&name) else {
            continue;
        };
        let description = read_entry_description(id);
        entries.push((id, description));
    }
    Ok(entries)
}

/// Whether the host is booted in EFI mode and the efivars filesystem is
/// readable.
#[must_use]
pub(crate) fn is_efi_booted() -> bool {
    fs::read_dir(EFIVARS_PATH).is_ok()
}

/// Reads the current `BootOrder` variable.
pub(crate) fn read_boot_order() -> anyhow::Result<BootOrder> {
    let path = Path::new(EFIVARS_PATH).join(format!("BootOrder{EFI_GLOBAL_SUFFIX}"));
    let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    unmarshal_boot_order(&data)
}

/// Overwrites the `BootOrder` variable.
pub(crate) fn write_boot_order(order: &BootOrder) -> anyhow::Result<()> {
    let path = Path::new(EFIVARS_PATH).join(format!("BootOrder{EFI_GLOBAL_SUFFIX}"));
    fs::write(&path, marshal_boot_order(order)).with_context(|| format!("writing {}", path.display()))
}

/// Creates or overwrites the `Boot####` variable for `id`.
pub(crate) fn write_boot_entry(id: u16, entry: &BootEntry) -> anyhow::Result<()> {
    let path = Path::new(EFIVARS_PATH).join(boot_entry_path(id));
    let mut data = VAR_ATTRS.to_vec();
    data.extend_from_slice(&entry.marshal()?);
    fs::write(&path, data).with_context(|| format!("writing {}", path.display()))
}

/// The result of [`plan_update`]: variables to create/overwrite, and the
/// boot order to install afterwards.
#[derive(Debug)]
pub(crate) struct Update {
    pub boot_entry_id: u16,
    pub boot_entry: BootEntry,
    pub order: BootOrder,
}

/// Finds a free `Boot####` id, preferring one already used by a prior
/// diskflash boot entry (identified by description) so repeated flashes
/// update the same slot instead of accumulating new ones.
///
/// `existing_entries` is the result of [`read_boot_entries`]: every
/// `Boot####` variable actually present on the firmware, regardless of
/// whether it's listed in `BootOrder`.
fn pick_boot_entry_id(
    existing_entries: &[(u16, Option<String>)],
    description: &str,
) -> anyhow::Result<u16> {
    let used: std::collections::HashSet<u16> = existing_entries.iter().map(|(id, _)| *id).collect();

    let mut reused = None;
    for (id, desc) in existing_entries {
        if desc.as_deref() == Some(description) {
            if reused.is_some() {
                bail!("found multiple existing {description} boot entries");
            }
            reused = Some(*id);
        }
    }

    if let Some(id) = reused {
        return Ok(id);
    }

    (0..=u16::MAX)
        .find(|id| !used.contains(id))
        .context("no free Boot#### id")
}

/// Plans the `BootOrder`/`Boot####` mutations needed to boot `new_entry`
/// first, reusing an existing diskflash entry's id if one is found.
///
/// `new_entry.description` must be empty; this function fills it in.
///
/// # Errors
///
/// Fails if `new_entry.description` is non-empty, if more than one
/// existing entry carries the diskflash description, or if no `Boot####`
/// id is free.
pub(crate) fn plan_update(
    existing_order: &BootOrder,
    existing_entries: &[(u16, Option<String>)],
    mut new_entry: BootEntry,
) -> anyhow::Result<Update> {
    if !new_entry.description.is_empty() {
        bail!(
            "new_entry.description must be empty, got {:?}",
            new_entry.description
        );
    }
    BOOT_ENTRY_DESCRIPTION.clone_into(&mut new_entry.description);

    let id = pick_boot_entry_id(existing_entries, BOOT_ENTRY_DESCRIPTION)?;

    let mut order = vec![id];
    order.extend(existing_order.iter().copied().filter(|&v| v != id));

    Ok(Update {
        boot_entry_id: id,
        boot_entry: new_entry,
        order,
    })
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{
        marshal_boot_order, parse_boot_entry_filename, pick_boot_entry_id, unmarshal_boot_order,
        BootEntry, BootOrder, END_ENTIRE_DEVICE_PATH,
    };
    use layout::Guid;

    fn disk_guid() -> Guid {
        Guid::parse("B187DD79-B85F-4402-88E8-6DE0F9331662").unwrap()
    }

    #[test]
    fn marshals_boot_entry_header_and_device_path() {
        let entry = BootEntry {
            description: "Linux Boot Manager".to_owned(),
            disk_guid: disk_guid(),
            path: r"\EFI\systemd\systemd-bootx64.efi".to_owned(),
            partition_number: 1,
            partition_start: 0x0800,
            partition_size: 0x02_f800,
        };

        let bytes = entry.marshal().unwrap();

        assert_eq!(&bytes[0..4], &1u32.to_le_bytes(), "LOAD_OPTION_ACTIVE");
        let path_list_len = u16::from_le_bytes([bytes[4], bytes[5]]);
        assert_eq!(usize::from(path_list_len), 42 + 70 + 4);

        let desc_start = 6;
        let desc_end = desc_start + (entry.description.len() + 1) * 2;
        let desc_units: Vec<u16> = bytes[desc_start..desc_end - 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&desc_units).unwrap(), entry.description);
        assert_eq!(&bytes[desc_end - 2..desc_end], &[0, 0]);

        let hd = &bytes[desc_end..];
        assert_eq!(hd[0], 0x04);
        assert_eq!(hd[1], 0x01);
        assert_eq!(u16::from_le_bytes([hd[2], hd[3]]), 42);
        assert_eq!(u32::from_le_bytes(hd[4..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(hd[8..16].try_into().unwrap()), 0x0800);
        assert_eq!(u64::from_le_bytes(hd[16..24].try_into().unwrap()), 0x02_f800);
        assert_eq!(&hd[24..40], &entry.disk_guid.to_bytes());

        assert_eq!(&bytes[bytes.len() - 4..], &END_ENTIRE_DEVICE_PATH);
    }

    #[test]
    fn rejects_empty_description() {
        let entry = BootEntry {
            description: String::new(),
            disk_guid: disk_guid(),
            path: "x".to_owned(),
            partition_number: 1,
            partition_start: 1,
            partition_size: 1,
        };
        assert!(entry.marshal().is_err());
    }

    #[test]
    fn round_trips_boot_order() {
        let order = vec![0x0000, 0x0010, 0x0011, 0x0012, 0x0013, 0x001c];
        let bytes = marshal_boot_order(&order);
        assert_eq!(unmarshal_boot_order(&bytes).unwrap(), order);
    }

    #[test]
    fn boot_order_matches_reference_bytes() {
        let order = vec![0xff00, 0x1234, 0xffff];
        let expected = [
            0x07, 0x00, 0x00, 0x00, 0x00, 0xff, 0x34, 0x12, 0xff, 0xff,
        ];
        assert_eq!(marshal_boot_order(&order), expected);
    }

    #[test]
    fn unmarshal_rejects_odd_length() {
        let bad = [0x12, 0xb4, 0xf3, 0x20, 0x34, 0x12, 0x00];
        assert!(unmarshal_boot_order(&bad).is_err());
    }

    #[test]
    fn unmarshal_ignores_attribute_bytes() {
        let bytes = [0x12, 0xb4, 0xf3, 0x20];
        assert_eq!(unmarshal_boot_order(&bytes).unwrap(), BootOrder::new());
    }

    #[test]
    fn parses_boot_entry_filename() {
        assert_eq!(
            parse_boot_entry_filename("Boot0003-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            Some(3)
        );
        assert_eq!(
            parse_boot_entry_filename("BootOrder-8be4df61-93ca-11d2-aa0d-00e098032b8c"),
            None
        );
        assert_eq!(parse_boot_entry_filename("Boot0003-not-the-right-guid"), None);
        assert_eq!(parse_boot_entry_filename("dump-mask-8be4df61"), None);
    }

    #[test]
    fn pick_boot_entry_id_reuses_matching_description() {
        let entries = vec![
            (0x0001u16, Some("Windows Boot Manager".to_owned())),
            (0x0005, Some("Diskflash (boot from disk)".to_owned())),
        ];
        assert_eq!(
            pick_boot_entry_id(&entries, "Diskflash (boot from disk)").unwrap(),
            0x0005
        );
    }

    #[test]
    fn pick_boot_entry_id_picks_free_id_when_no_match() {
        let entries = vec![(0x0000u16, None), (0x0001, Some("Other".to_owned()))];
        assert_eq!(
            pick_boot_entry_id(&entries, "Diskflash (boot from disk)").unwrap(),
            0x0002
        );
    }

    #[test]
    fn pick_boot_entry_id_rejects_duplicate_descriptions() {
        let entries = vec![
            (0x0001u16, Some("Diskflash (boot from disk)".to_owned())),
            (0x0002, Some("Diskflash (boot from disk)".to_owned())),
        ];
        assert!(pick_boot_entry_id(&entries, "Diskflash (boot from disk)").is_err());
    }
}
