//! The legacy NVS (Non-Volatile Storage) codec: 8-byte ATEs padded to the
//! write-block size, CRC-8/CCITT validation, a single sentinel Close ATE.
//!
//! The bound check in [`Ate::is_valid`] and [`Ate::is_close_ate`] against the
//! fixed [`sector::SECTOR_SIZE`] constant (rather than an instance's
//! configured sector size) is a preserved quirk of the firmware this codec
//! reads; every device in the catalog uses the same fixed sector size so
//! it's unobservable today, but don't "fix" it without checking real
//! firmware behavior for non-default sizes first.

use std::collections::BTreeMap;

use crate::crc::crc8_ccitt;
use crate::error::CodecError;
use crate::image::SparseImage;
use crate::sector::{self, is_populated, round_up_to_write_block, Cursors, SectorStatus};

/// Reserved record id holding the highest allocated key id.
pub const NAMECNT_ID: u16 = 0x8000;
/// Offset added to a key's `record_id` to find its paired value record.
pub const NAME_ID_OFFSET: u16 = 0x4000;
/// Record id marking the Close ATE.
const CLOSE_RECORD_ID: u16 = 0xffff;

const ATE_LOGICAL_SIZE: usize = 8;

fn ate_size(write_block_size: usize) -> usize {
    round_up_to_write_block(ATE_LOGICAL_SIZE, write_block_size)
}

#[derive(Debug, Clone, Copy)]
struct Ate {
    record_id: u16,
    data_offset: u16,
    data_len: u16,
    crc: u8,
}

impl Ate {
    fn deserialize(raw: &[u8]) -> Self {
        Self {
            record_id: u16::from_le_bytes([raw[0], raw[1]]),
            data_offset: u16::from_le_bytes([raw[2], raw[3]]),
            data_len: u16::from_le_bytes([raw[4], raw[5]]),
            crc: raw[7],
        }
    }

    fn serialize(record_id: u16, data_offset: u16, data_len: u16, ate_size: usize, erase_value: u8) -> Vec<u8> {
        let mut buf = vec![erase_value; ate_size];
        buf[0..2].copy_from_slice(&record_id.to_le_bytes());
        buf[2..4].copy_from_slice(&data_offset.to_le_bytes());
        buf[4..6].copy_from_slice(&data_len.to_le_bytes());
        // buf[6] is the reserved byte; it stays at the erase-value fill.
        buf[7] = crc8_ccitt(&buf[0..7]);
        buf
    }

    fn crc_is_valid(&self, raw: &[u8]) -> bool {
        crc8_ccitt(&raw[0..7]) == self.crc
    }

    /// CRC valid and `data_offset` inside the fixed sector constant.
    fn is_valid(&self, raw: &[u8], ate_size: usize) -> bool {
        self.crc_is_valid(raw) && (self.data_offset as usize) < (sector::SECTOR_SIZE - ate_size)
    }

    fn is_close_ate(&self, raw: &[u8], ate_size: usize) -> bool {
        self.is_valid(raw, ate_size)
            && self.record_id == CLOSE_RECORD_ID
            && self.data_len == 0
            && (sector::SECTOR_SIZE - self.data_offset as usize) % ate_size == 0
    }
}

/// Writer for one NVS sector. Pure in-memory cursor bookkeeping; nothing is
/// flushed to the image until [`Writer::write_data_record`] is called.
pub struct Writer {
    cursors: Cursors,
    write_block_size: usize,
    erase_value: u8,
    ate_size: usize,
}

impl Writer {
    pub fn new(sector_size: usize, write_block_size: usize, erase_value: u8) -> Self {
        let ate_size = ate_size(write_block_size);
        Self {
            cursors: Cursors::new(sector_size, ate_size),
            write_block_size,
            erase_value,
            ate_size,
        }
    }

    /// Reserves the trailing slot that will eventually hold the Close ATE.
    pub fn init_sector(&mut self) -> Result<(), CodecError> {
        self.cursors.reserve_ate_slots(self.ate_size, 1)
    }

    pub fn write_data_record(
        &mut self,
        image: &mut SparseImage,
        base_addr: u32,
        record_id: u16,
        data: &[u8],
    ) -> Result<(), CodecError> {
        let data_offset = self.cursors.data_cursor();
        let ate_bytes = Ate::serialize(
            record_id,
            data_offset as u16,
            data.len() as u16,
            self.ate_size,
            self.erase_value,
        );
        let ate_offset = self.cursors.place_ate(self.ate_size)?;
        image.write(base_addr + ate_offset as u32, &ate_bytes);

        let padded_len = round_up_to_write_block(data.len(), self.write_block_size);
        let mut aligned = data.to_vec();
        aligned.resize(padded_len, self.erase_value);
        let placed_offset = self.cursors.place_data(padded_len)?;
        debug_assert_eq!(placed_offset, data_offset);
        image.write(base_addr + placed_offset as u32, &aligned);
        Ok(())
    }
}

/// Parses one sector, returning its inferred status and, if it carried any
/// valid records, the record map keyed by the (widened) `record_id`. Walks
/// ATEs downward from the sector tail, stopping at the first invalid one.
pub fn parse_sector(
    sector: &[u8],
    write_block_size: usize,
    erase_value: u8,
) -> (SectorStatus, Option<BTreeMap<u64, Vec<u8>>>) {
    if sector::is_erased(sector, erase_value) {
        return (SectorStatus::Erased, None);
    }

    let ate_size = ate_size(write_block_size);
    let mut ate_ptr = sector.len() as isize - ate_size as isize;

    let probe_raw = &sector[ate_ptr as usize..ate_ptr as usize + ate_size];
    let probe = Ate::deserialize(probe_raw);

    let status = if probe.is_close_ate(probe_raw, ate_size) {
        SectorStatus::Closed
    } else if !is_populated(probe_raw, erase_value) {
        SectorStatus::Open
    } else {
        return (SectorStatus::Na, None);
    };

    let mut data_ptr: isize = 0;
    let mut records = BTreeMap::new();

    while ate_ptr >= 0 {
        ate_ptr -= ate_size as isize;
        if ate_ptr < data_ptr {
            break;
        }
        let raw = &sector[ate_ptr as usize..ate_ptr as usize + ate_size];
        if !is_populated(raw, erase_value) {
            break;
        }
        let ate = Ate::deserialize(raw);
        if !ate.is_valid(raw, ate_size) {
            continue;
        }
        let offset = ate.data_offset as isize;
        let len = ate.data_len as isize;
        if offset < data_ptr || offset + len >= ate_ptr {
            return (SectorStatus::Na, None);
        }
        let start = offset as usize;
        let end = start + ate.data_len as usize;
        records.insert(ate.record_id as u64, sector[start..end].to_vec());
        data_ptr = data_ptr.max(offset + len);
    }

    if status == SectorStatus::Open && records.is_empty() {
        return (SectorStatus::Na, None);
    }

    (status, Some(records))
}
