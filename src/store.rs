//! Driver for a bank of identical 25xx series SPI EEPROMs sharing one bus. Every command runs in
//! its own chip session (select, transfer, flush, deselect) so no two sessions ever interleave.

use crate::error::Error;
use crate::page::{MAX_CHIPS, PAGE_SIZE, PAGES_PER_CHIP, Page, PageAddress};
use crate::platform::{ChipSelect, Timing};
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiBus;
use embedded_storage::{ReadStorage, Storage};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

const CMD_WRITE: u8 = 0b0000_0010;
const CMD_READ: u8 = 0b0000_0011;
const CMD_WRDI: u8 = 0b0000_0100;
const CMD_RDSR: u8 = 0b0000_0101;
const CMD_WREN: u8 = 0b0000_0110;

/// Write-in-progress
const STATUS_WIP: u8 = 0x01;
/// Write-enable latch
const STATUS_WEL: u8 = 0x02;

pub struct PagedStore<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    timing: Timing,
    chips: u8,
}

impl<SPI, CS, D> PagedStore<SPI, CS, D>
where
    SPI: SpiBus,
    CS: ChipSelect,
    D: DelayNs,
{
    /// Until the configuration is loaded only the first chip is addressable; the configuration
    /// page lives there.
    pub fn new(spi: SPI, cs: CS, delay: D, timing: Timing) -> Self {
        Self {
            spi,
            cs,
            delay,
            timing,
            chips: 1,
        }
    }

    pub fn chips(&self) -> u8 {
        self.chips
    }

    /// Number of addressable pages for the current chip count.
    pub fn pages(&self) -> u32 {
        PAGES_PER_CHIP * self.chips as u32
    }

    /// Re-scales the addressable range. Claiming more chips than are fitted makes the extra range
    /// fail on access; the chips are not queried here.
    pub fn set_capacity(&mut self, chips: u8) -> Result<(), Error> {
        if chips == 0 || chips > MAX_CHIPS {
            return Err(Error::InvalidChipCount);
        }

        #[cfg(feature = "defmt")]
        trace!("set_capacity: {} chips", chips);

        self.chips = chips;
        Ok(())
    }

    pub fn read_page(&mut self, page: u32) -> Result<Page, Error> {
        let address = PageAddress::new(page, self.chips)?;

        #[cfg(feature = "defmt")]
        trace!("read_page: {} @{}:{:#06x}", page, address.chip, address.offset);

        #[cfg(feature = "debug-logs")]
        println!("  store: read_page {page} @{}:{:#06x}", address.chip, address.offset);

        self.wait_for_idle(address.chip)?;

        let mut buf = Page::zeroed();
        let [hi, lo] = address.offset.to_be_bytes();
        self.session(address.chip, |spi| {
            spi.write(&[CMD_READ, hi, lo])?;
            spi.read(&mut buf.0)
        })?;

        Ok(buf)
    }

    /// Returns once the chip reports the write cycle as finished. A write that could not be
    /// confirmed is reported as `BusTimeout`.
    pub fn write_page(&mut self, page: u32, data: &Page) -> Result<(), Error> {
        let address = PageAddress::new(page, self.chips)?;

        #[cfg(feature = "defmt")]
        trace!("write_page: {} @{}:{:#06x}", page, address.chip, address.offset);

        #[cfg(feature = "debug-logs")]
        println!("  store: write_page {page} @{}:{:#06x}", address.chip, address.offset);

        self.wait_for_idle(address.chip)?;
        self.set_write_enable(address.chip)?;

        let [hi, lo] = address.offset.to_be_bytes();
        self.session(address.chip, |spi| {
            spi.write(&[CMD_WRITE, hi, lo])?;
            spi.write(&data.0)
        })?;

        self.wait_for_idle(address.chip)
    }

    pub fn release(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    /// Brackets `op` with select / deselect. The chip is deselected even if the transfer failed.
    fn session<R>(
        &mut self,
        chip: u8,
        op: impl FnOnce(&mut SPI) -> Result<R, SPI::Error>,
    ) -> Result<R, Error> {
        self.cs.select(chip).map_err(|_| Error::Bus)?;
        let result = op(&mut self.spi).and_then(|r| self.spi.flush().map(|()| r));
        let deselected = self.cs.deselect(chip);

        let r = result.map_err(|_| Error::Bus)?;
        deselected.map_err(|_| Error::Bus)?;
        Ok(r)
    }

    fn read_status(&mut self, chip: u8) -> Result<u8, Error> {
        let mut status = [0xFFu8];
        self.session(chip, |spi| {
            spi.write(&[CMD_RDSR])?;
            spi.read(&mut status)
        })?;
        Ok(status[0])
    }

    /// Polls until no write cycle is in progress, then drops a write-enable latch left over from
    /// an interrupted sequence.
    fn wait_for_idle(&mut self, chip: u8) -> Result<(), Error> {
        let mut status = self.read_status(chip)?;
        let mut attempts = 1;
        while status & STATUS_WIP != 0 {
            if attempts >= self.timing.status_poll_attempts {
                #[cfg(feature = "defmt")]
                warn!("wait_for_idle: chip {} busy, status {:#04x}", chip, status);

                #[cfg(feature = "debug-logs")]
                println!("  store: chip {chip} stuck busy, status {status:#04x}");

                return Err(Error::BusTimeout);
            }
            self.delay.delay_us(self.timing.status_poll_interval_us);
            status = self.read_status(chip)?;
            attempts += 1;
        }

        if status & STATUS_WEL != 0 {
            #[cfg(feature = "defmt")]
            trace!("wait_for_idle: clearing stale write enable on chip {}", chip);

            self.session(chip, |spi| spi.write(&[CMD_WRDI]))?;
        }

        Ok(())
    }

    fn set_write_enable(&mut self, chip: u8) -> Result<(), Error> {
        for attempt in 0..self.timing.write_enable_attempts {
            if attempt > 0 {
                self.delay.delay_us(self.timing.write_enable_interval_us);
            }
            self.session(chip, |spi| spi.write(&[CMD_WREN]))?;
            if self.read_status(chip)? & STATUS_WEL != 0 {
                return Ok(());
            }
        }

        #[cfg(feature = "defmt")]
        warn!("set_write_enable: chip {} never latched", chip);

        Err(Error::BusTimeout)
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<(), Error> {
        let pages = self.pages();
        let end = offset as u64 + len as u64;
        if end > pages as u64 * PAGE_SIZE as u64 {
            return Err(Error::PageOutOfRange {
                page: (end.saturating_sub(1) / PAGE_SIZE as u64) as u32,
                pages,
            });
        }
        Ok(())
    }
}

/// Flat byte view of the configured range. Partial pages are read-modify-written, so the bus
/// still only ever sees whole pages.
impl<SPI, CS, D> ReadStorage for PagedStore<SPI, CS, D>
where
    SPI: SpiBus,
    CS: ChipSelect,
    D: DelayNs,
{
    type Error = Error;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_span(offset, bytes.len())?;

        let mut done = 0usize;
        while done < bytes.len() {
            let position = offset as usize + done;
            let page = self.read_page((position / PAGE_SIZE) as u32)?;
            let start = position % PAGE_SIZE;
            let len = (PAGE_SIZE - start).min(bytes.len() - done);
            bytes[done..done + len].copy_from_slice(&page[start..start + len]);
            done += len;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.pages() as usize * PAGE_SIZE
    }
}

impl<SPI, CS, D> Storage for PagedStore<SPI, CS, D>
where
    SPI: SpiBus,
    CS: ChipSelect,
    D: DelayNs,
{
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_span(offset, bytes.len())?;

        let mut done = 0usize;
        while done < bytes.len() {
            let position = offset as usize + done;
            let page_no = (position / PAGE_SIZE) as u32;
            let start = position % PAGE_SIZE;
            let len = (PAGE_SIZE - start).min(bytes.len() - done);

            let mut page = if len == PAGE_SIZE {
                Page::zeroed()
            } else {
                self.read_page(page_no)?
            };
            page[start..start + len].copy_from_slice(&bytes[done..done + len]);
            self.write_page(page_no, &page)?;
            done += len;
        }
        Ok(())
    }
}
