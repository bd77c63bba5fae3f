//! Sector model shared between the NVS and ZMS codecs: fixed sector size,
//! status classification, and the write-cursor bookkeeping used by both
//! writers.

use crate::error::CodecError;

/// Fixed size of a settings sector. Several validity checks in the NVS
/// reader are against this constant rather than an instance's configured
/// sector size, a quirk preserved verbatim (see [`crate::nvs`]); do not
/// generalize this constant away without checking real firmware behavior
/// for non-default sizes.
pub const SECTOR_SIZE: usize = 0x1000;

/// Flash erase value for every device in the catalog.
pub const ERASE_VALUE: u8 = 0xff;

/// Inferred state of one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStatus {
    /// Every byte equals the erase value.
    Erased,
    /// Valid trailing metadata; still accepts writes.
    Open,
    /// Sealed; the ring continues at the next sector.
    Closed,
    /// Not a recognizable settings sector.
    Na,
}

/// `true` if every byte of `sector` equals `erase_value`.
pub fn is_erased(sector: &[u8], erase_value: u8) -> bool {
    sector.iter().all(|&b| b == erase_value)
}

/// `true` if at least one byte of `raw` differs from `erase_value`, i.e. the
/// slot has been written to.
pub fn is_populated(raw: &[u8], erase_value: u8) -> bool {
    raw.iter().any(|&b| b != erase_value)
}

/// Rounds `len` up to the next multiple of `write_block_size` (a power of
/// two).
pub fn round_up_to_write_block(len: usize, write_block_size: usize) -> usize {
    debug_assert!(write_block_size.is_power_of_two());
    (len + write_block_size - 1) & !(write_block_size - 1)
}

/// The two cursors a sector writer advances: `ate_offset` downward from the
/// sector tail, `data_offset` upward from the sector base. Writing never
/// wraps into a second sector: once the cursors would collide, the sector
/// is closed and a new one started.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursors {
    ate_offset: usize,
    data_offset: usize,
}

impl Cursors {
    pub fn new(sector_size: usize, ate_size: usize) -> Self {
        Self {
            ate_offset: sector_size - ate_size,
            data_offset: 0,
        }
    }

    fn check(&self) -> Result<(), CodecError> {
        if self.ate_offset < self.data_offset {
            Err(CodecError::SectorOverflow {
                ate_offset: self.ate_offset,
                data_offset: self.data_offset,
            })
        } else {
            Ok(())
        }
    }

    /// Reserves `n` trailing ATE slots without writing anything (used to
    /// skip over slots destined for special ATEs written elsewhere, or left
    /// erased for a future garbage collection pass).
    pub fn reserve_ate_slots(&mut self, ate_size: usize, n: usize) -> Result<(), CodecError> {
        self.ate_offset = self
            .ate_offset
            .checked_sub(ate_size * n)
            .ok_or(CodecError::SectorOverflow {
                ate_offset: self.ate_offset,
                data_offset: self.data_offset,
            })?;
        self.check()
    }

    /// Returns the offset at which the next ATE should be written, then
    /// advances the cursor past it.
    pub fn place_ate(&mut self, ate_size: usize) -> Result<usize, CodecError> {
        self.check()?;
        let at = self.ate_offset;
        self.ate_offset = self
            .ate_offset
            .checked_sub(ate_size)
            .ok_or(CodecError::SectorOverflow {
                ate_offset: self.ate_offset,
                data_offset: self.data_offset,
            })?;
        self.check()?;
        Ok(at)
    }

    /// Current value of the data cursor, without advancing it. Used to embed
    /// the upcoming data placement into an ATE before the data itself is
    /// written.
    pub fn data_cursor(&self) -> usize {
        self.data_offset
    }

    /// Returns the offset at which `len` bytes of payload should be written,
    /// then advances the cursor past them.
    pub fn place_data(&mut self, len: usize) -> Result<usize, CodecError> {
        self.check()?;
        let at = self.data_offset;
        self.data_offset =
            self.data_offset
                .checked_add(len)
                .ok_or(CodecError::SectorOverflow {
                    ate_offset: self.ate_offset,
                    data_offset: self.data_offset,
                })?;
        self.check()?;
        Ok(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_overflow_is_fatal() {
        let mut cursors = Cursors::new(32, 8);
        assert!(cursors.place_ate(8).is_ok());
        assert!(cursors.place_ate(8).is_ok());
        // Only 32 bytes total; two ATEs already consumed 16, one more plus a
        // 24 byte payload should not fit.
        assert!(cursors.place_ate(8).is_ok());
        assert!(cursors.place_data(24).is_err());
    }

    #[test]
    fn round_up_write_block() {
        assert_eq!(round_up_to_write_block(8, 4), 8);
        assert_eq!(round_up_to_write_block(16, 16), 16);
        assert_eq!(round_up_to_write_block(3, 4), 4);
    }
}
