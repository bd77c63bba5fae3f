//! Provisioning façade: the fixed set of FMN accessory setup keys, and the
//! `provision`/`extract` workflows built on top of [`crate::settings`].
//!
//! Grounded on `provisioned_metadata.py`, `cmd_provision.py::provision()`
//! and `cmd_extract.py::extract()`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::device::{DeviceDesc, StorageKind};
use crate::diagnostics::Diagnostics;
use crate::error::{ExtractError, ProvisionError};
use crate::image::SparseImage;
use crate::settings::Settings;

/// One provisioned key's settings-store key string and expected value
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionedKey {
    pub key: &'static str,
    pub len: usize,
}

pub const SERIAL_NUMBER: ProvisionedKey = ProvisionedKey { key: "fmna/provisioning/997", len: 16 };
pub const MFI_TOKEN_UUID: ProvisionedKey = ProvisionedKey { key: "fmna/provisioning/998", len: 16 };
pub const MFI_AUTH_TOKEN: ProvisionedKey = ProvisionedKey { key: "fmna/provisioning/999", len: 1024 };

/// Already-validated provisioning input (raw UUID bytes, a decoded token,
/// an optional serial number). Parsing and format validation of the CLI's
/// string arguments happens one layer up, in `nvmc-cli`.
#[derive(Debug, Clone)]
pub struct ProvisionInput {
    pub mfi_uuid: [u8; 16],
    pub mfi_token: Vec<u8>,
    pub serial_number: Option<[u8; 16]>,
}

/// Builds a freshly initialized settings sector carrying the MFi UUID,
/// zero-padded MFi auth token, and optional serial number. Follows
/// `cmd_provision.py::provision()`.
pub fn provision(device: &DeviceDesc, input: &ProvisionInput) -> Result<SparseImage, ProvisionError> {
    provision_at(
        device,
        device.settings_partition_base(),
        device.default_settings_partition.storage_kind,
        input,
    )
}

/// Same as [`provision`], but against a caller-chosen settings base address
/// and storage kind rather than `device`'s defaults, covering the CLI's
/// `-f/--settings-base` and `-n/--nv-storage` overrides.
pub fn provision_at(
    device: &DeviceDesc,
    base_addr: u32,
    storage_kind: StorageKind,
    input: &ProvisionInput,
) -> Result<SparseImage, ProvisionError> {
    if input.mfi_token.len() > MFI_AUTH_TOKEN.len {
        return Err(ProvisionError::TokenTooLong { len: input.mfi_token.len(), max: MFI_AUTH_TOKEN.len });
    }

    let mut token = input.mfi_token.clone();
    token.resize(MFI_AUTH_TOKEN.len, 0);

    let mut kv_records = BTreeMap::new();
    kv_records.insert(MFI_TOKEN_UUID.key.to_string(), input.mfi_uuid.to_vec());
    kv_records.insert(MFI_AUTH_TOKEN.key.to_string(), token);
    if let Some(serial_number) = input.serial_number {
        kv_records.insert(SERIAL_NUMBER.key.to_string(), serial_number.to_vec());
    }

    let settings = Settings::with_overrides(device, base_addr, storage_kind);
    Ok(settings.write(&kv_records)?)
}

/// The provisioned data recovered from a settings partition dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedData {
    /// `8-4-4-4-12` hex-grouped MFi UUID.
    pub mfi_uuid: String,
    /// Base64-encoded MFi auth token, with trailing zero padding trimmed.
    pub mfi_auth_token_base64: String,
    /// Upper-case hex serial number, if one was provisioned.
    pub serial_number_hex: Option<String>,
}

/// Reads back the provisioned keys from a flattened settings partition
/// image. Follows `cmd_extract.py::extract()`.
pub fn extract(device: &DeviceDesc, bin: &[u8], diagnostics: &mut Diagnostics) -> Result<ExtractedData, ExtractError> {
    extract_at(
        device,
        device.settings_partition_base(),
        device.default_settings_partition.storage_kind,
        bin,
        diagnostics,
    )
}

/// Same as [`extract`], but against a caller-chosen settings base address
/// and storage kind rather than `device`'s defaults.
pub fn extract_at(
    device: &DeviceDesc,
    base_addr: u32,
    storage_kind: StorageKind,
    bin: &[u8],
    diagnostics: &mut Diagnostics,
) -> Result<ExtractedData, ExtractError> {
    let settings = Settings::with_overrides(device, base_addr, storage_kind);
    let kv_records = settings.read(bin, diagnostics).ok_or(ExtractError::NoRecords)?;
    if kv_records.is_empty() {
        return Err(ExtractError::NoRecords);
    }

    let mfi_uuid = kv_records
        .get(MFI_TOKEN_UUID.key)
        .filter(|v| v.len() == MFI_TOKEN_UUID.len)
        .map(|v| format_uuid(v));
    let mfi_auth_token_base64 = kv_records.get(MFI_AUTH_TOKEN.key).map(|v| {
        let mut trimmed = v.clone();
        while trimmed.last() == Some(&0) {
            trimmed.pop();
        }
        BASE64.encode(trimmed)
    });

    let (mfi_uuid, mfi_auth_token_base64) = match (mfi_uuid, mfi_auth_token_base64) {
        (Some(uuid), Some(token)) => (uuid, token),
        _ => return Err(ExtractError::MissingMandatoryKey),
    };

    let serial_number_hex = kv_records
        .get(SERIAL_NUMBER.key)
        .filter(|v| !v.is_empty())
        .map(|v| hex_upper(v));

    Ok(ExtractedData { mfi_uuid, mfi_auth_token_base64, serial_number_hex })
}

/// Formats exactly 16 bytes as an `8-4-4-4-12` hex-grouped UUID. Callers
/// must filter to `MFI_TOKEN_UUID.len` bytes first; a malformed-but-CRC-valid
/// dump carrying a shorter value is treated as the UUID being absent rather
/// than reaching this function.
fn format_uuid(bytes: &[u8]) -> String {
    debug_assert_eq!(bytes.len(), MFI_TOKEN_UUID.len);
    let hex = hex_lower(bytes);
    format!("{}-{}-{}-{}-{}", &hex[0..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..])
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;

    #[test]
    fn provision_then_extract_recovers_all_fields() {
        let dev = device::lookup("NRF5340").unwrap();
        let input = ProvisionInput {
            mfi_uuid: [0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x12, 0x34, 0x12, 0x34, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc],
            mfi_token: b"hello-token".to_vec(),
            serial_number: Some(*b"0123456789ABCDEF"),
        };

        let image = provision(dev, &input).unwrap();

        let partition_size = dev.default_settings_partition.size as usize;
        let base = dev.settings_partition_base();
        let mut flat = vec![device::NVM_ERASE_VALUE; partition_size];
        for (addr, byte) in image.iter() {
            flat[(addr - base) as usize] = byte;
        }

        let mut diagnostics = Diagnostics::new();
        let extracted = extract(dev, &flat, &mut diagnostics).unwrap();

        assert_eq!(extracted.mfi_uuid, "12345678-1234-1234-1234-123456789abc");
        assert_eq!(extracted.mfi_auth_token_base64, base64::engine::general_purpose::STANDARD.encode(b"hello-token"));
        assert_eq!(extracted.serial_number_hex.as_deref(), Some("30313233343536373839414243444546"));
    }

    #[test]
    fn token_exceeding_max_length_is_rejected() {
        let dev = device::lookup("NRF52840").unwrap();
        let input = ProvisionInput {
            mfi_uuid: [0u8; 16],
            mfi_token: vec![0u8; MFI_AUTH_TOKEN.len + 1],
            serial_number: None,
        };
        let err = provision(dev, &input).unwrap_err();
        assert!(matches!(err, ProvisionError::TokenTooLong { .. }));
    }

    #[test]
    fn extract_without_uuid_or_token_is_missing_mandatory_key() {
        let dev = device::lookup("NRF52840").unwrap();
        let settings = Settings::new(dev);
        let mut kv = BTreeMap::new();
        kv.insert(SERIAL_NUMBER.key.to_string(), b"only-serial-numbr".to_vec());
        let image = settings.write(&kv).unwrap();

        let partition_size = dev.default_settings_partition.size as usize;
        let base = dev.settings_partition_base();
        let mut flat = vec![device::NVM_ERASE_VALUE; partition_size];
        for (addr, byte) in image.iter() {
            flat[(addr - base) as usize] = byte;
        }

        let mut diagnostics = Diagnostics::new();
        let err = extract(dev, &flat, &mut diagnostics).unwrap_err();
        assert!(matches!(err, ExtractError::MissingMandatoryKey));
    }

    #[test]
    fn extract_with_undersized_uuid_value_is_missing_mandatory_key_not_a_panic() {
        let dev = device::lookup("NRF52840").unwrap();
        let settings = Settings::new(dev);
        let mut kv = BTreeMap::new();
        // A CRC-valid record at the UUID key, but shorter than 16 bytes —
        // the kind of malformed-but-valid flash the codec must never panic
        // on (spec.md §7: "never throws on malformed flash").
        kv.insert(MFI_TOKEN_UUID.key.to_string(), b"short".to_vec());
        kv.insert(MFI_AUTH_TOKEN.key.to_string(), b"token".to_vec());
        let image = settings.write(&kv).unwrap();

        let partition_size = dev.default_settings_partition.size as usize;
        let base = dev.settings_partition_base();
        let mut flat = vec![device::NVM_ERASE_VALUE; partition_size];
        for (addr, byte) in image.iter() {
            flat[(addr - base) as usize] = byte;
        }

        let mut diagnostics = Diagnostics::new();
        let err = extract(dev, &flat, &mut diagnostics).unwrap_err();
        assert!(matches!(err, ExtractError::MissingMandatoryKey));
    }
}
