//! The ZMS (Zephyr Memory Storage) codec: 16-byte ATEs with a per-sector
//! cycle counter, inline small-data storage, big-data with a CRC-32
//! descriptor, and three special ATEs (Empty, Close, GC-done).


use std::collections::BTreeMap;

use crate::crc::{crc32_ieee, crc8_ccitt};
use crate::error::CodecError;
use crate::image::SparseImage;
use crate::sector::{round_up_to_write_block, Cursors, SectorStatus};

/// Reserved record id holding the highest allocated key id.
pub const NAMECNT_ID: u32 = 0x8000_0000;
/// Offset added to a key's `record_id` to find its paired value record.
pub const NAME_ID_OFFSET: u32 = 0x4000_0000;
/// Special-ATE id shared by Empty and Close ATEs.
const HEAD_ID: u32 = 0xffff_ffff;
/// `(version=1) | (magic=0x42 << 8)` packed into the Empty ATE's metadata word.
const EMPTY_METADATA: u32 = 0x01 | (0x42 << 8);
/// The Close ATE's metadata word is all-ones.
const CLOSE_METADATA: u32 = 0xffff_ffff;
/// Maximum length for the inline small-data form.
const SMALL_DATA_MAX: usize = 8;

const ATE_LOGICAL_SIZE: usize = 16;

fn ate_size(write_block_size: usize) -> usize {
    round_up_to_write_block(ATE_LOGICAL_SIZE, write_block_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Content {
    /// Inline value, valid for at most `len` bytes of the 8.
    Small([u8; 8]),
    /// A pointer into the data region plus a CRC-32 (data ATEs) or metadata
    /// word (special ATEs); which one it is depends on `id`.
    Info { offset: u32, info: u32 },
}

impl Content {
    fn to_bytes(self) -> [u8; 8] {
        match self {
            Content::Small(b) => b,
            Content::Info { offset, info } => {
                let mut buf = [0u8; 8];
                buf[0..4].copy_from_slice(&offset.to_le_bytes());
                buf[4..8].copy_from_slice(&info.to_le_bytes());
                buf
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ate {
    crc8: u8,
    cycle_cnt: u8,
    len: u16,
    id: u32,
    content: Content,
}

impl Ate {
    fn serialize(cycle_cnt: u8, len: u16, id: u32, content: Content, ate_size: usize, erase_value: u8) -> Vec<u8> {
        let mut body = Vec::with_capacity(15);
        body.push(cycle_cnt);
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(&id.to_le_bytes());
        body.extend_from_slice(&content.to_bytes());

        let mut buf = vec![erase_value; ate_size];
        buf[0] = crc8_ccitt(&body);
        buf[1..16].copy_from_slice(&body);
        buf
    }

    fn deserialize(raw: &[u8]) -> Self {
        let crc8 = raw[0];
        let cycle_cnt = raw[1];
        let len = u16::from_le_bytes([raw[2], raw[3]]);
        let id = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let is_special = id == HEAD_ID;
        let content = if len as usize <= SMALL_DATA_MAX && !is_special {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[8..16]);
            Content::Small(b)
        } else {
            let offset = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            let info = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
            Content::Info { offset, info }
        };
        Self { crc8, cycle_cnt, len, id, content }
    }

    fn crc_is_valid(&self, raw: &[u8]) -> bool {
        crc8_ccitt(&raw[1..16]) == self.crc8
    }

    fn is_valid(&self, raw: &[u8], current_cycle_cnt: u8) -> bool {
        self.crc_is_valid(raw) && self.cycle_cnt == current_cycle_cnt
    }
}

fn is_empty_ate(ate: &Ate, raw: &[u8]) -> bool {
    ate.crc_is_valid(raw)
        && ate.id == HEAD_ID
        && ate.len == 0xffff
        && matches!(ate.content, Content::Info { offset: 0, info } if info == EMPTY_METADATA)
}

fn is_close_ate(ate: &Ate, raw: &[u8], sector_size: usize, ate_size: usize) -> bool {
    if !ate.crc_is_valid(raw) || ate.id != HEAD_ID || ate.len != 0 {
        return false;
    }
    let Content::Info { offset, info } = ate.content else {
        return false;
    };
    if info != CLOSE_METADATA {
        return false;
    }
    (sector_size - offset as usize) % ate_size == 0
}

/// Writer for one ZMS sector: Empty ATE first, then data ATEs (small-form
/// inline or big-form pointing into the data region), ending with the
/// sector's Close ATE once the caller stops writing.
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

    /// Writes the Empty ATE to the sector's last slot, then reserves the
    /// Close and GC-done slots (left erased; garbage collection is out of
    /// scope for a single-sector writer).
    pub fn init_sector(&mut self, image: &mut SparseImage, base_addr: u32) -> Result<(), CodecError> {
        let content = Content::Info { offset: 0, info: EMPTY_METADATA };
        let empty_bytes = Ate::serialize(0x01, 0xffff, HEAD_ID, content, self.ate_size, self.erase_value);
        let at = self.cursors.place_ate(self.ate_size)?;
        image.write(base_addr + at as u32, &empty_bytes);
        self.cursors.reserve_ate_slots(self.ate_size, 2)
    }

    pub fn write_data_record(
        &mut self,
        image: &mut SparseImage,
        base_addr: u32,
        record_id: u32,
        data: &[u8],
    ) -> Result<(), CodecError> {
        if data.len() <= SMALL_DATA_MAX {
            self.write_small(image, base_addr, record_id, data)
        } else {
            self.write_big(image, base_addr, record_id, data)
        }
    }

    fn write_small(&mut self, image: &mut SparseImage, base_addr: u32, record_id: u32, data: &[u8]) -> Result<(), CodecError> {
        let mut inline = [self.erase_value; SMALL_DATA_MAX];
        inline[..data.len()].copy_from_slice(data);
        let ate_bytes = Ate::serialize(0x01, data.len() as u16, record_id, Content::Small(inline), self.ate_size, self.erase_value);
        let at = self.cursors.place_ate(self.ate_size)?;
        image.write(base_addr + at as u32, &ate_bytes);
        Ok(())
    }

    fn write_big(&mut self, image: &mut SparseImage, base_addr: u32, record_id: u32, data: &[u8]) -> Result<(), CodecError> {
        let data_offset = self.cursors.data_cursor();
        let content = Content::Info { offset: data_offset as u32, info: crc32_ieee(data) };
        let ate_bytes = Ate::serialize(0x01, data.len() as u16, record_id, content, self.ate_size, self.erase_value);
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

/// Parses one sector, walking ATEs downward from the sector tail starting
/// at the Empty ATE slot.
pub fn parse_sector(
    sector: &[u8],
    sector_size: usize,
    write_block_size: usize,
    erase_value: u8,
) -> (SectorStatus, Option<BTreeMap<u64, Vec<u8>>>) {
    if crate::sector::is_erased(sector, erase_value) {
        return (SectorStatus::Erased, None);
    }

    let ate_size = ate_size(write_block_size);
    let mut ate_ptr = sector.len() as isize - ate_size as isize;

    let empty_raw = &sector[ate_ptr as usize..ate_ptr as usize + ate_size];
    let empty = Ate::deserialize(empty_raw);
    if !is_empty_ate(&empty, empty_raw) {
        return (SectorStatus::Na, None);
    }
    let current_cycle_cnt = empty.cycle_cnt;

    ate_ptr -= ate_size as isize;
    let close_raw = &sector[ate_ptr as usize..ate_ptr as usize + ate_size];
    let close = Ate::deserialize(close_raw);
    let status = if is_close_ate(&close, close_raw, sector_size, ate_size) && close.cycle_cnt == current_cycle_cnt {
        SectorStatus::Closed
    } else {
        SectorStatus::Open
    };

    let mut data_ptr: isize = 0;
    let mut records = BTreeMap::new();

    while ate_ptr >= 0 {
        ate_ptr -= ate_size as isize;
        if ate_ptr < data_ptr {
            break;
        }
        let raw = &sector[ate_ptr as usize..ate_ptr as usize + ate_size];
        let ate = Ate::deserialize(raw);
        if !ate.is_valid(raw, current_cycle_cnt) {
            continue;
        }

        match ate.content {
            Content::Small(bytes) => {
                records.insert(ate.id as u64, bytes[..ate.len as usize].to_vec());
            }
            Content::Info { offset, info } => {
                if ate.id == HEAD_ID {
                    // A special ATE (Close or GC-done) surfaced mid-walk; not
                    // a record, ignore it and keep walking.
                    continue;
                }
                let offset = offset as isize;
                let len = ate.len as isize;
                if offset < data_ptr || offset + len >= ate_ptr {
                    return (SectorStatus::Na, None);
                }
                let start = offset as usize;
                let end = start + ate.len as usize;
                let data = &sector[start..end];
                if info == 0 || info == crc32_ieee(data) {
                    records.insert(ate.id as u64, data.to_vec());
                }
                data_ptr = data_ptr.max(offset + len);
            }
        }
    }

    if status == SectorStatus::Open && records.is_empty() {
        return (SectorStatus::Erased, None);
    }

    (status, Some(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector;

    fn write_sector(write_block_size: usize, records: &[(u32, &[u8])]) -> Vec<u8> {
        let mut image = SparseImage::new();
        let mut writer = Writer::new(sector::SECTOR_SIZE, write_block_size, sector::ERASE_VALUE);
        writer.init_sector(&mut image, 0).unwrap();
        for (id, data) in records {
            writer.write_data_record(&mut image, 0, *id, data).unwrap();
        }
        let mut flat = vec![sector::ERASE_VALUE; sector::SECTOR_SIZE];
        for (addr, byte) in image.iter() {
            flat[addr as usize] = byte;
        }
        flat
    }

    #[test]
    fn small_data_inline_roundtrip() {
        let sector = write_sector(16, &[(NAMECNT_ID + 1, &[0x01, 0x02, 0x03])]);
        let (status, records) = parse_sector(&sector, sector::SECTOR_SIZE, 16, sector::ERASE_VALUE);
        assert_eq!(status, SectorStatus::Open);
        let records = records.unwrap();
        assert_eq!(records.get(&(NAMECNT_ID as u64 + 1)).unwrap(), &vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn big_data_crc_checked() {
        let value = vec![0xab; 64];
        let sector = write_sector(16, &[(NAMECNT_ID + 1, &value)]);
        let (status, records) = parse_sector(&sector, sector::SECTOR_SIZE, 16, sector::ERASE_VALUE);
        assert_eq!(status, SectorStatus::Open);
        assert_eq!(records.unwrap().get(&(NAMECNT_ID as u64 + 1)).unwrap(), &value);
    }

    #[test]
    fn big_data_corruption_drops_record_only() {
        let value = vec![0xab; 64];
        let mut sector = write_sector(16, &[(NAMECNT_ID + 1, &value), (NAMECNT_ID + 2, b"other")]);
        // Flip a byte in the first record's data region (offset 0).
        sector[0] ^= 0xff;
        let (status, records) = parse_sector(&sector, sector::SECTOR_SIZE, 16, sector::ERASE_VALUE);
        assert_eq!(status, SectorStatus::Open);
        let records = records.unwrap();
        assert!(records.get(&(NAMECNT_ID as u64 + 1)).is_none());
        assert_eq!(records.get(&(NAMECNT_ID as u64 + 2)).unwrap(), b"other");
    }

    #[test]
    fn cycle_count_mismatch_drops_ate() {
        let sector = write_sector(16, &[(NAMECNT_ID + 1, b"abc")]);
        let ate_size = ate_size(16);
        // Corrupt the cycle_cnt byte of the only data ATE without fixing up
        // its CRC8, so it fails validation and is skipped, not substituted.
        let data_ate_offset = sector.len() - 4 * ate_size;
        let mut corrupted = sector.clone();
        corrupted[data_ate_offset + 1] ^= 0xff;
        let (status, records) = parse_sector(&corrupted, sector::SECTOR_SIZE, 16, sector::ERASE_VALUE);
        assert_eq!(status, SectorStatus::Erased);
        assert!(records.is_none());
    }

    #[test]
    fn empty_only_sector_with_no_records_is_erased() {
        let sector = write_sector(16, &[]);
        let (status, records) = parse_sector(&sector, sector::SECTOR_SIZE, 16, sector::ERASE_VALUE);
        assert_eq!(status, SectorStatus::Erased);
        assert!(records.is_none());
    }
}
