//! Intel-HEX byte-transport adapter. Wraps the `ihex` crate to move between
//! a [`SparseImage`] and Intel-HEX text or a flat binary buffer.

use std::collections::BTreeMap;

use ihex::Record;

use crate::error::IhexError;
use crate::image::SparseImage;

const MAX_DATA_RECORD_LEN: usize = 16;

/// Renders a sparse image as Intel-HEX text, splitting contiguous runs into
/// 16-byte data records and emitting an extended linear address record
/// whenever the upper 16 address bits change.
pub fn to_intel_hex(image: &SparseImage) -> Result<String, IhexError> {
    let bytes: Vec<(u32, u8)> = image.iter().collect();
    let mut records = Vec::new();
    let mut current_upper: Option<u16> = None;

    let mut i = 0;
    while i < bytes.len() {
        let (start_addr, first_byte) = bytes[i];
        let mut chunk = vec![first_byte];
        let mut next_addr = start_addr + 1;
        i += 1;
        while i < bytes.len() && chunk.len() < MAX_DATA_RECORD_LEN && bytes[i].0 == next_addr {
            chunk.push(bytes[i].1);
            next_addr += 1;
            i += 1;
        }

        let upper = (start_addr >> 16) as u16;
        if current_upper != Some(upper) {
            records.push(Record::ExtendedLinearAddress(upper));
            current_upper = Some(upper);
        }
        records.push(Record::Data { offset: (start_addr & 0xffff) as u16, value: chunk });
    }
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records).map_err(|e| IhexError::Encode(e.to_string()))
}

/// Parses Intel-HEX text into a sparse byte map.
pub fn from_intel_hex(text: &str) -> Result<BTreeMap<u32, u8>, IhexError> {
    let mut bytes = BTreeMap::new();
    let mut upper: u32 = 0;

    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| IhexError::Decode(e.to_string()))?;
        match record {
            Record::Data { offset, value } => {
                let base = upper | offset as u32;
                for (i, b) in value.into_iter().enumerate() {
                    bytes.insert(base + i as u32, b);
                }
            }
            Record::ExtendedLinearAddress(addr) => upper = (addr as u32) << 16,
            Record::ExtendedSegmentAddress(addr) => upper = (addr as u32) << 4,
            Record::EndOfFile => break,
            _ => {}
        }
    }

    Ok(bytes)
}

/// Merges `overlay` on top of `base`, overlay bytes winning on overlapping
/// addresses. Follows `cmd_provision.py`'s `merge_hex_files`.
pub fn merge(base: &str, overlay: &str) -> Result<String, IhexError> {
    let mut merged = from_intel_hex(base)?;
    merged.extend(from_intel_hex(overlay)?);

    let mut image = SparseImage::new();
    for (addr, byte) in merged {
        image.write(addr, &[byte]);
    }
    to_intel_hex(&image)
}

/// Loads a raw binary dump, placed at `base_addr`, into a sparse byte map.
pub fn from_raw(bytes: &[u8], base_addr: u32) -> BTreeMap<u32, u8> {
    bytes.iter().enumerate().map(|(i, &b)| (base_addr + i as u32, b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_intel_hex_text() {
        let mut image = SparseImage::new();
        image.write(0x1000, &[1, 2, 3, 4]);
        image.write(0x20000, &[0xaa, 0xbb]);

        let text = to_intel_hex(&image).unwrap();
        let parsed = from_intel_hex(&text).unwrap();

        assert_eq!(parsed.get(&0x1000).copied(), Some(1));
        assert_eq!(parsed.get(&0x1003).copied(), Some(4));
        assert_eq!(parsed.get(&0x20000).copied(), Some(0xaa));
        assert_eq!(parsed.get(&0x20001).copied(), Some(0xbb));
    }

    #[test]
    fn merge_overlay_wins_on_overlap() {
        let mut base_image = SparseImage::new();
        base_image.write(0x0, &[1, 1, 1, 1]);
        let base = to_intel_hex(&base_image).unwrap();

        let mut overlay_image = SparseImage::new();
        overlay_image.write(0x2, &[9, 9]);
        let overlay = to_intel_hex(&overlay_image).unwrap();

        let merged_text = merge(&base, &overlay).unwrap();
        let merged = from_intel_hex(&merged_text).unwrap();

        assert_eq!(merged.get(&0x0).copied(), Some(1));
        assert_eq!(merged.get(&0x2).copied(), Some(9));
        assert_eq!(merged.get(&0x3).copied(), Some(9));
    }

    #[test]
    fn from_raw_places_bytes_at_base_address() {
        let bin = vec![0x11, 0x22, 0x33];
        let sparse = from_raw(&bin, 0x7e000);
        assert_eq!(sparse.get(&0x7e000).copied(), Some(0x11));
        assert_eq!(sparse.get(&0x7e002).copied(), Some(0x33));
    }
}
