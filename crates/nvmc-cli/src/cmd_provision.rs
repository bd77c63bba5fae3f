//! `nvmc provision` subcommand: validates CLI input and writes a single
//! initialized settings sector, wrapped in Intel-HEX, optionally merged on
//! top of an existing hex file.
//!
//! Grounded on `cmd_provision.py`'s `cli`/`provision` and its
//! `*_input_handle` validation helpers.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Args;
use regex::Regex;

use nvmc::device::{self, StorageKind};
use nvmc::provisioning::{self, ProvisionInput};

const MFI_UUID_EXAMPLE: &str = "12345678-1234-1234-1234-123456789abc";
const SERIAL_NUMBER_EXAMPLE: &str = "30313233343536373839414243444546";

#[derive(Debug, Args)]
#[command(about = "FMN Accessory Setup Provisioning Tool")]
pub struct ProvisionArgs {
    /// MFi UUID of the accessory, e.g. 12345678-1234-1234-1234-123456789abc
    #[arg(short = 'u', long = "mfi-uuid", value_name = "UUID")]
    mfi_uuid: String,

    /// MFi Token of the accessory, base64 encoded
    #[arg(short = 'm', long = "mfi-token", value_name = "TOKEN")]
    mfi_token: String,

    /// Serial number of the accessory in hex, e.g. 30313233343536373839414243444546
    #[arg(short = 's', long = "serial-number", value_name = "SN")]
    serial_number: Option<String>,

    /// Path to store the result of the provisioning
    #[arg(short = 'o', long = "output-path", value_name = "PATH", default_value = "provisioned.hex")]
    output_path: PathBuf,

    /// Device of accessory to provision
    #[arg(short = 'e', long = "device", value_name = "DEVICE")]
    device: String,

    /// Settings base address in hex, only needed if overriding the device default
    #[arg(short = 'f', long = "settings-base", value_name = "ADDRESS")]
    settings_base: Option<String>,

    /// Hex file to merge the provisioned settings into
    #[arg(short = 'x', long = "input-hex-file", value_name = "FILE")]
    input_hex_file: Option<PathBuf>,

    /// Non-volatile storage type, only needed if overriding the device default
    #[arg(short = 'n', long = "nv-storage", value_name = "nvs|zms")]
    nv_storage: Option<String>,
}

pub fn run(args: ProvisionArgs) -> Result<()> {
    let device = device::lookup(&args.device)
        .ok_or_else(|| anyhow!("argument -e/--device: unknown device '{}'", args.device))?;

    let settings_base = settings_base_input_handle(args.settings_base.as_deref(), device)?;
    let mfi_uuid = mfi_uuid_input_handle(&args.mfi_uuid)?;
    let mfi_token = mfi_token_input_handle(&args.mfi_token)?;
    let serial_number = serial_number_input_handle(args.serial_number.as_deref())?;
    let nv_storage = nv_storage_input_handle(args.nv_storage.as_deref(), device)?;
    output_path_input_handle(&args.output_path)?;
    if let Some(input_hex_file) = &args.input_hex_file {
        input_hex_file_input_handle(input_hex_file)?;
    }

    log::info!(
        "Using: device={} storage={:?} settings_base={settings_base:#x} write_block={} bytes",
        device.name,
        nv_storage,
        device.nvm.write_block_size,
    );

    let input = ProvisionInput { mfi_uuid, mfi_token, serial_number };
    let image = provisioning::provision_at(device, settings_base, nv_storage, &input)
        .with_context(|| "provisioning failed")?;

    let hex_text = nvmc::ihex::to_intel_hex(&image).map_err(|e| anyhow!(e.to_string()))?;

    let final_text = if let Some(input_hex_file) = &args.input_hex_file {
        let base = fs::read_to_string(input_hex_file)
            .with_context(|| format!("reading {}", input_hex_file.display()))?;
        nvmc::ihex::merge(&base, &hex_text).map_err(|e| anyhow!(e.to_string()))?
    } else {
        hex_text
    };

    fs::write(&args.output_path, final_text)
        .with_context(|| format!("writing {}", args.output_path.display()))?;

    println!("Provisioning successful: {}", args.output_path.display());
    Ok(())
}

fn hex_arg_to_int(hex_str: &str) -> Option<u32> {
    let trimmed = hex_str.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).ok()
}

fn settings_base_input_handle(settings_base: Option<&str>, device: &device::DeviceDesc) -> Result<u32> {
    let nvm = &device.nvm;
    let base = match settings_base {
        Some(s) => hex_arg_to_int(s).ok_or_else(|| anyhow!("argument -f/--settings-base: malformed memory address"))?,
        None => device.settings_partition_base(),
    };

    let size = device.default_settings_partition.size;
    device::validate_settings_geometry(nvm, base, size)
        .map_err(|e| anyhow!("argument -f/--settings-base: {e}"))?;
    Ok(base)
}

fn mfi_uuid_input_handle(mfi_uuid: &str) -> Result<[u8; 16]> {
    let pattern = Regex::new(
        "^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$",
    )
    .unwrap();
    if !pattern.is_match(mfi_uuid) {
        bail!(
            "argument -u/--mfi-uuid: malformed formatting\nPlease use the correct format as in the following example: {MFI_UUID_EXAMPLE}"
        );
    }

    let hex_digits: String = mfi_uuid.chars().filter(|c| *c != '-').collect();
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex_digits[i * 2..i * 2 + 2], 16)
            .map_err(|_| anyhow!("argument -u/--mfi-uuid: malformed formatting"))?;
    }
    Ok(bytes)
}

fn mfi_token_input_handle(mfi_token: &str) -> Result<Vec<u8>> {
    let decoded = BASE64
        .decode(mfi_token)
        .map_err(|e| anyhow!("argument -m/--mfi-token: malformed formatting\n{e}"))?;
    if decoded.len() > provisioning::MFI_AUTH_TOKEN.len {
        bail!(
            "argument -m/--mfi-token: exceeded maximum length: {}",
            provisioning::MFI_AUTH_TOKEN.len
        );
    }
    Ok(decoded)
}

fn serial_number_input_handle(serial_number: Option<&str>) -> Result<Option<[u8; 16]>> {
    let Some(serial_number) = serial_number else { return Ok(None) };

    let pattern = Regex::new(r"(?i)^([\da-f][\da-f])+$").unwrap();
    if !pattern.is_match(serial_number) {
        bail!(
            "argument -s/--serial-number: malformed formatting\nPlease use the correct format as in the following example: {SERIAL_NUMBER_EXAMPLE}"
        );
    }

    let bytes: Vec<u8> = (0..serial_number.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&serial_number[i..i + 2], 16).unwrap())
        .collect();
    if bytes.len() != provisioning::SERIAL_NUMBER.len {
        bail!("argument -s/--serial-number: incorrect length: {}", bytes.len());
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(Some(out))
}

fn input_hex_file_input_handle(input_hex_file: &PathBuf) -> Result<()> {
    if !input_hex_file.exists() {
        bail!("argument -x/--input-hex-file: target file does not exist");
    }
    if !input_hex_file.is_file() {
        bail!("argument -x/--input-hex-file: target path is not a file");
    }
    Ok(())
}

fn output_path_input_handle(output_path: &PathBuf) -> Result<()> {
    if output_path.is_dir() {
        bail!("argument -o/--output-path: target is an existing directory");
    }
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            bail!("argument -o/--output-path: target directory does not exist");
        }
    }
    if output_path.exists() {
        bail!("argument -o/--output-path: target file already exists");
    }
    Ok(())
}

fn nv_storage_input_handle(nv_storage: Option<&str>, device: &device::DeviceDesc) -> Result<StorageKind> {
    match nv_storage {
        Some("nvs") => Ok(StorageKind::Nvs),
        Some("zms") => Ok(StorageKind::Zms),
        Some(other) => bail!("argument -n/--nv-storage: invalid choice '{other}' (choose from: nvs, zms)"),
        None => Ok(device.default_settings_partition.storage_kind),
    }
}
