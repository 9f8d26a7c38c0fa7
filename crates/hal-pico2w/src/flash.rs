//! Flash-backed configuration storage
//!
//! The last 4 KB sector of the 4 MB QSPI flash holds the configuration
//! record (see `memory.x`, which keeps the firmware image clear of it).
//! Writes erase the sector and program the record padded to page size.

use embassy_rp::flash::{Blocking, Flash, ERASE_SIZE, PAGE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;

use config_store::{ConfigStorage, StorageError};

/// Total QSPI flash size on the Pico 2 W
pub const FLASH_SIZE: usize = 4 * 1024 * 1024;

/// Byte offset of the configuration sector
pub const CONFIG_OFFSET: u32 = (FLASH_SIZE - ERASE_SIZE) as u32;

/// The configuration record store over the reserved sector
pub struct FlashStore<'d> {
    flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>,
}

impl<'d> FlashStore<'d> {
    /// Take ownership of the flash peripheral
    pub fn new(flash: Peri<'d, FLASH>) -> Self {
        Self {
            flash: Flash::new_blocking(flash),
        }
    }
}

impl ConfigStorage for FlashStore<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let len = buf.len().min(ERASE_SIZE);
        self.flash
            .blocking_read(CONFIG_OFFSET, &mut buf[..len])
            .map_err(|_| StorageError::Read)?;
        Ok(len)
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if record.len() > ERASE_SIZE {
            return Err(StorageError::Write);
        }
        self.erase()?;

        // Program whole pages; the tail pads with the erased value.
        let mut page = [0xFFu8; PAGE_SIZE];
        let mut offset = 0;
        while offset < record.len() {
            let n = (record.len() - offset).min(PAGE_SIZE);
            page[..n].copy_from_slice(&record[offset..offset + n]);
            page[n..].fill(0xFF);
            self.flash
                .blocking_write(CONFIG_OFFSET + offset as u32, &page)
                .map_err(|_| StorageError::Write)?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.flash
            .blocking_erase(CONFIG_OFFSET, CONFIG_OFFSET + ERASE_SIZE as u32)
            .map_err(|_| StorageError::Erase)
    }
}
