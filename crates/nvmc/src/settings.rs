//! Settings orchestrator: dispatches per-sector parsing to the right codec,
//! locates the settings partition's sector range, orders the ring from
//! oldest to newest, consolidates records, and pairs keys with values.
//!
//! Rather than an abstract base class with an NVS/ZMS subclass each,
//! [`Settings`] is a tagged enum over the shared codec interface, the
//! idiomatic Rust shape for "one of two known implementations" dispatch.

use std::collections::BTreeMap;

use crate::device::{DeviceDesc, StorageKind};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::CodecError;
use crate::image::SparseImage;
use crate::sector::{SectorStatus, SECTOR_SIZE};
use crate::{nvs, zms};

/// A settings store bound to one device's geometry and codec.
pub struct Settings {
    storage_kind: StorageKind,
    base_addr: u32,
    sector_size: usize,
    write_block_size: usize,
    erase_value: u8,
    namecnt_id: u32,
    name_id_offset: u32,
}

struct SectorMetadata {
    status: SectorStatus,
    records: Option<BTreeMap<u64, Vec<u8>>>,
}

enum CodecWriter {
    Nvs(nvs::Writer),
    Zms(zms::Writer),
}

/// Accumulates writes for a single freshly-initialized sector, tracking
/// codec-specific cursor state across the record-by-record calls that
/// [`Settings::write`] makes.
struct SectorWriter {
    image: SparseImage,
    base_addr: u32,
    writer: CodecWriter,
}

impl SectorWriter {
    fn new(settings: &Settings) -> Result<Self, CodecError> {
        let mut image = SparseImage::new();
        let writer = match settings.storage_kind {
            StorageKind::Nvs => {
                let mut w = nvs::Writer::new(settings.sector_size, settings.write_block_size, settings.erase_value);
                w.init_sector()?;
                CodecWriter::Nvs(w)
            }
            StorageKind::Zms => {
                let mut w = zms::Writer::new(settings.sector_size, settings.write_block_size, settings.erase_value);
                w.init_sector(&mut image, settings.base_addr)?;
                CodecWriter::Zms(w)
            }
        };
        Ok(Self { image, base_addr: settings.base_addr, writer })
    }

    fn write(&mut self, record_id: u32, data: &[u8]) -> Result<(), CodecError> {
        match &mut self.writer {
            CodecWriter::Nvs(w) => w.write_data_record(&mut self.image, self.base_addr, record_id as u16, data),
            CodecWriter::Zms(w) => w.write_data_record(&mut self.image, self.base_addr, record_id, data),
        }
    }

    fn into_image(self) -> SparseImage {
        self.image
    }
}

impl Settings {
    pub fn new(device: &DeviceDesc) -> Self {
        Self::with_overrides(
            device,
            device.settings_partition_base(),
            device.default_settings_partition.storage_kind,
        )
    }

    /// Builds a settings store bound to `device`'s write-block size and
    /// erase value but a caller-supplied base address and storage kind,
    /// covering the `-f/--settings-base` and `-n/--nv-storage` CLI
    /// overrides from `cmd_provision.py` / `cmd_extract.py` that the
    /// default-only [`Settings::new`] cannot express.
    pub fn with_overrides(device: &DeviceDesc, base_addr: u32, storage_kind: StorageKind) -> Self {
        let (namecnt_id, name_id_offset) = match storage_kind {
            StorageKind::Nvs => (nvs::NAMECNT_ID as u32, nvs::NAME_ID_OFFSET as u32),
            StorageKind::Zms => (zms::NAMECNT_ID, zms::NAME_ID_OFFSET),
        };
        Self {
            storage_kind,
            base_addr,
            sector_size: SECTOR_SIZE,
            write_block_size: device.nvm.write_block_size,
            erase_value: crate::device::NVM_ERASE_VALUE,
            namecnt_id,
            name_id_offset,
        }
    }

    // --- Provisioning -----------------------------------------------------

    /// Writes one key/value pair plus the updated name-count ATE, following
    /// `_write_single_kv_record`.
    fn write_single_kv_record(&self, w: &mut SectorWriter, key_record_id: u32, key: &str, value: &[u8]) -> Result<(), CodecError> {
        let value_record_id = key_record_id + self.name_id_offset;
        w.write(value_record_id, value)?;
        w.write(key_record_id, key.as_bytes())?;
        w.write(self.namecnt_id, &key_record_id.to_le_bytes())?;
        Ok(())
    }

    /// Serializes `kv_records` into a freshly initialized sector and returns
    /// the resulting sparse image. Follows `Settings.write`.
    pub fn write(&self, kv_records: &BTreeMap<String, Vec<u8>>) -> Result<SparseImage, CodecError> {
        let mut w = SectorWriter::new(self)?;

        let mut free_key_record_id = self.namecnt_id + 1;
        for (key, value) in kv_records {
            self.write_single_kv_record(&mut w, free_key_record_id, key, value)?;
            free_key_record_id += 1;
        }

        Ok(w.into_image())
    }

    // --- Extraction ---------------------------------------------------------

    fn parse_sector(&self, sector: &[u8]) -> SectorMetadata {
        let (status, records) = match self.storage_kind {
            StorageKind::Nvs => nvs::parse_sector(sector, self.write_block_size, self.erase_value),
            StorageKind::Zms => zms::parse_sector(sector, self.sector_size, self.write_block_size, self.erase_value),
        };
        SectorMetadata { status, records }
    }

    fn parse_sectors(&self, bin: &[u8]) -> Vec<SectorMetadata> {
        assert_eq!(bin.len() % self.sector_size, 0);
        bin.chunks(self.sector_size).map(|s| self.parse_sector(s)).collect()
    }

    fn settings_range(&self, metadata: &[SectorMetadata]) -> Option<(usize, usize)> {
        let mut first_with_records = None;
        let mut count = 0usize;
        for (idx, sector) in metadata.iter().enumerate() {
            if sector.records.is_some() {
                first_with_records.get_or_insert(idx);
                count += 1;
            }
        }

        let Some(first) = first_with_records else {
            log::debug!("settings range: no sectors with data records found");
            return None;
        };
        if count == 1 {
            log::debug!("settings range: found only one sector with data records, idx {first}");
            Some((first, first + 1))
        } else {
            log::debug!("settings range: {first}..{} ({count} sectors with records)", metadata.len());
            Some((first, metadata.len()))
        }
    }

    fn find_newest_sector_idx(&self, metadata: &[SectorMetadata], diagnostics: &mut Diagnostics) -> usize {
        let len = metadata.len();
        let mut newest_idx = None;
        let mut transitions = 0usize;
        for idx in 0..len {
            let next_idx = (idx + 1) % len;
            if metadata[idx].status == SectorStatus::Closed && metadata[next_idx].status == SectorStatus::Open {
                transitions += 1;
                newest_idx.get_or_insert(next_idx);
            }
        }
        if transitions > 1 {
            log::warn!("found {transitions} closed->open transitions while ordering sectors; using the first");
            diagnostics.push(Diagnostic::MultipleClosedToOpenTransitions { count: transitions });
        }
        match newest_idx {
            Some(idx) => idx,
            None => {
                log::debug!("no closed->open transition found; proceeding from the end of the range");
                len - 1
            }
        }
    }

    /// Restricts `metadata` to the settings partition's sector range and
    /// rotates it so index 0 is the oldest sector. Follows `_order_sectors`.
    fn order_sectors(&self, mut metadata: Vec<SectorMetadata>, diagnostics: &mut Diagnostics) -> Option<Vec<SectorMetadata>> {
        if metadata.is_empty() {
            return None;
        }
        let (start, end) = self.settings_range(&metadata)?;
        let mut ranged: Vec<SectorMetadata> = metadata.drain(start..end).collect();

        if ranged.len() > 1 {
            let idx = (self.find_newest_sector_idx(&ranged, diagnostics) + 1) % ranged.len();
            ranged.rotate_left(idx);
        }

        Some(ranged)
    }

    /// Consolidates oldest-to-newest sector records and pairs keys with
    /// values. Follows `_parse_settings`.
    fn parse_settings(&self, metadata: Vec<SectorMetadata>, diagnostics: &mut Diagnostics) -> BTreeMap<String, Vec<u8>> {
        let mut consolidated: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for sector in metadata {
            if let Some(records) = sector.records {
                for (id, value) in records {
                    consolidated.insert(id, value);
                }
            }
        }

        let namecnt_id = self.namecnt_id as u64;
        let name_id_offset = self.name_id_offset as u64;

        let mut settings = BTreeMap::new();
        for (&record_id, value) in consolidated.iter() {
            if record_id <= namecnt_id || record_id >= namecnt_id + name_id_offset {
                continue;
            }
            if value.is_empty() {
                continue;
            }
            let Ok(key) = String::from_utf8(value.clone()) else {
                continue;
            };

            let Some(settings_value) = consolidated.get(&(record_id + name_id_offset)) else {
                continue;
            };
            if settings_value.is_empty() {
                continue;
            }

            if settings.contains_key(&key) {
                log::debug!("duplicate key encountered during consolidation: {key}");
                diagnostics.push(Diagnostic::DuplicateKey { key: key.clone() });
            }
            settings.insert(key, settings_value.clone());
        }

        settings
    }

    /// Reads every key/value pair out of a flattened settings partition
    /// image. Follows `Settings.read`.
    pub fn read(&self, bin: &[u8], diagnostics: &mut Diagnostics) -> Option<BTreeMap<String, Vec<u8>>> {
        let metadata = self.parse_sectors(bin);
        let ordered = self.order_sectors(metadata, diagnostics)?;
        Some(self.parse_settings(ordered, diagnostics))
    }
}
