//! `nvmc extract` subcommand: loads a settings-partition dump from a file
//! or a connected device, then recovers the provisioned MFi UUID, auth
//! token, and serial number.
//!
//! Grounded on `cmd_extract.py`'s `cli`/`extract` and its
//! `settings_partition_input_handle`/`load_from_file`/`load_from_device`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;

use nvmc::device::{self, StorageKind};
use nvmc::diagnostics::Diagnostic;
use nvmc::provisioning;

use crate::tool;

#[derive(Debug, Args)]
#[command(about = "FMN Accessory MFi Token Extractor Tool")]
pub struct ExtractArgs {
    /// Device of accessory to use
    #[arg(short = 'e', long = "device", value_name = "DEVICE")]
    device: String,

    /// File in *.hex or *.bin format with a settings-partition memory dump
    #[arg(short = 'i', long = "input-file", value_name = "FILE")]
    input_file: Option<PathBuf>,

    /// Settings base address in hex, only needed if overriding the device default
    #[arg(short = 'f', long = "settings-base", value_name = "ADDRESS")]
    settings_base: Option<String>,

    /// Settings partition size in hex, only needed if overriding the device default
    #[arg(short = 's', long = "settings-size", value_name = "SIZE")]
    settings_size: Option<String>,

    /// Non-volatile storage type, only needed if overriding the device default
    #[arg(short = 'n', long = "nv-storage", value_name = "nvs|zms")]
    nv_storage: Option<String>,
}

pub fn run(args: ExtractArgs) -> Result<()> {
    let device = device::lookup(&args.device)
        .ok_or_else(|| anyhow!("argument -e/--device: unknown device '{}'", args.device))?;

    if args.settings_size.is_some() && args.settings_base.is_none() {
        bail!("argument -s/--settings-size: requires -f/--settings-base argument");
    }
    if args.input_file.is_some() && (args.settings_base.is_some() || args.settings_size.is_some()) {
        bail!("argument -f/--settings-base and -s/--settings-size: cannot be used with -i/--input-file argument");
    }

    let bin = match &args.input_file {
        Some(path) => load_from_file(path)?,
        None => load_from_device(device, args.settings_base.as_deref(), args.settings_size.as_deref())?,
    };

    let nv_storage = nv_storage_input_handle(args.nv_storage.as_deref(), device)?;
    let (settings_base, _settings_size) =
        settings_partition_input_handle(args.settings_base.as_deref(), args.settings_size.as_deref(), device)?;

    log::info!("Using: device={} storage={nv_storage:?} settings_base={settings_base:#x}", device.name);

    let mut diagnostics = nvmc::diagnostics::Diagnostics::new();
    let extracted = provisioning::extract_at(device, settings_base, nv_storage, &bin, &mut diagnostics)
        .with_context(|| "extraction failed")?;

    for diagnostic in diagnostics.iter() {
        match diagnostic {
            Diagnostic::DuplicateKey { key } => log::warn!("duplicate key encountered during extraction: {key}"),
            Diagnostic::MultipleClosedToOpenTransitions { count } => {
                log::warn!("found {count} closed->open transitions while ordering sectors; used the first")
            }
        }
    }

    println!("SW Authentication UUID: {}", extracted.mfi_uuid);
    println!("SW Authentication Token: {}", extracted.mfi_auth_token_base64);
    match &extracted.serial_number_hex {
        Some(serial) => println!("Serial Number: {serial}"),
        None => println!("Serial Number: not found in the provisioned data"),
    }

    Ok(())
}

fn hex_arg_to_int(hex_str: &str) -> Option<u32> {
    let trimmed = hex_str.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).ok()
}

fn settings_partition_input_handle(
    settings_base: Option<&str>,
    settings_size: Option<&str>,
    device: &device::DeviceDesc,
) -> Result<(u32, u32)> {
    let nvm = &device.nvm;
    let nvm_end = nvm.base_address as u64 + nvm.size as u64;

    let (base, size) = match (settings_base, settings_size) {
        (Some(base), Some(size)) => {
            let base = hex_arg_to_int(base).ok_or_else(|| anyhow!("argument -f/--settings-base: malformed memory address"))?;
            let size = hex_arg_to_int(size).ok_or_else(|| anyhow!("argument -s/--settings-size: malformed memory size"))?;
            (base, size)
        }
        (Some(base), None) => {
            let base = hex_arg_to_int(base).ok_or_else(|| anyhow!("argument -f/--settings-base: malformed memory address"))?;
            let size = (nvm_end - base as u64) as u32;
            (base, size)
        }
        _ => (device.settings_partition_base(), device.default_settings_partition.size),
    };

    device::validate_settings_geometry(nvm, base, size).map_err(|e| anyhow!("argument -f/-s: {e}"))?;
    Ok((base, size))
}

fn nv_storage_input_handle(nv_storage: Option<&str>, device: &device::DeviceDesc) -> Result<StorageKind> {
    match nv_storage {
        Some("nvs") => Ok(StorageKind::Nvs),
        Some("zms") => Ok(StorageKind::Zms),
        Some(other) => bail!("argument -n/--nv-storage: invalid choice '{other}' (choose from: nvs, zms)"),
        None => Ok(device.default_settings_partition.storage_kind),
    }
}

/// Loads a settings-partition dump from a `.hex` or `.bin` file, right-padded
/// with the flash erase value up to a whole sector. Follows
/// `cmd_extract.py::load_from_file`.
fn load_from_file(path: &Path) -> Result<Vec<u8>> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mut bin = match extension {
        "hex" => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let sparse = nvmc::ihex::from_intel_hex(&text).map_err(|e| anyhow!(e.to_string()))?;
            // intelhex's `hex2bin` (what the original shells out to) starts the
            // flattened buffer at the file's lowest populated address, not at
            // absolute zero; reproduce that here so a hex file holding only a
            // settings partition flattens with its first byte at index 0.
            let min_addr = sparse.keys().min().copied().unwrap_or(0);
            let max_addr = sparse.keys().max().copied().unwrap_or(0);
            let mut flat = vec![device::NVM_ERASE_VALUE; (max_addr - min_addr) as usize + 1];
            for (addr, byte) in sparse {
                flat[(addr - min_addr) as usize] = byte;
            }
            flat
        }
        "bin" => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        other => bail!("Not supported file type '{other}', use .hex or .bin!"),
    };

    let sector_size = device::SETTINGS_SECTOR_SIZE;
    let aligned_len = ((bin.len() + sector_size - 1) / sector_size) * sector_size;
    bin.resize(aligned_len.max(sector_size), device::NVM_ERASE_VALUE);
    Ok(bin)
}

/// Pulls a settings-partition dump straight off a connected accessory.
/// Follows `cmd_extract.py::load_from_device`.
fn load_from_device(device: &device::DeviceDesc, settings_base: Option<&str>, settings_size: Option<&str>) -> Result<Vec<u8>> {
    let (base, size) = settings_partition_input_handle(settings_base, settings_size, device)?;
    log::info!("Looking for the provisioned data in the following memory range: {base:#x} - {:#x}", base as u64 + size as u64);

    let memory_tool = tool::create(device.tool);
    let serials = memory_tool.list_serials().map_err(|e| anyhow!(e.to_string()))?;
    let serial = choose_serial(&serials)?;
    let bytes = memory_tool.read(&serial, base, size).map_err(|e| anyhow!(e.to_string()))?;
    Ok(bytes)
}

/// Picks the device serial to read from: the only one if there's a single
/// device connected, otherwise prompts on stdin. Follows
/// `cmd_extract.py::sn_choose`.
fn choose_serial(serials: &[String]) -> Result<String> {
    if serials.is_empty() {
        bail!("no devices connected");
    }
    if serials.len() == 1 {
        return Ok(serials[0].clone());
    }

    println!("Choose the device:");
    for (idx, serial) in serials.iter().enumerate() {
        println!("{}. {serial}", idx + 1);
    }
    print!("> ");
    io::stdout().flush().ok();

    let mut line = String::new();
    io::stdin().read_line(&mut line).context("reading device choice")?;
    let line = line.trim();

    if let Ok(choice) = line.parse::<usize>() {
        if choice >= 1 && choice <= serials.len() {
            return Ok(serials[choice - 1].clone());
        }
    }
    if serials.iter().any(|s| s == line) {
        return Ok(line.to_string());
    }

    bail!("invalid choice (choose from: {})", (1..=serials.len()).map(|n| n.to_string()).collect::<Vec<_>>().join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_partition_defaults_to_device_partition() {
        let dev = device::lookup("NRF5340").unwrap();
        let (base, size) = settings_partition_input_handle(None, None, dev).unwrap();
        assert_eq!(base, dev.settings_partition_base());
        assert_eq!(size, dev.default_settings_partition.size);
    }

    #[test]
    fn settings_size_without_base_is_rejected_at_cli_layer() {
        // The CLI-layer precondition lives in `run`; this just documents the
        // invariant `settings_partition_input_handle` itself does not check
        // it and relies on the caller.
        let dev = device::lookup("NRF5340").unwrap();
        assert!(settings_partition_input_handle(None, Some("0x1000"), dev).is_ok());
    }

    #[test]
    fn base_only_sweeps_to_nvm_end() {
        let dev = device::lookup("NRF52840").unwrap();
        let (base, size) = settings_partition_input_handle(Some("0xfe000"), None, dev).unwrap();
        assert_eq!(base, 0xfe000);
        assert_eq!(size, dev.nvm.size - 0xfe000);
    }

    #[test]
    fn choose_serial_with_single_device_needs_no_prompt() {
        let serial = choose_serial(&["123456789".to_string()]).unwrap();
        assert_eq!(serial, "123456789");
    }

    #[test]
    fn choose_serial_with_no_devices_errors() {
        assert!(choose_serial(&[]).is_err());
    }
}
