use crate::error::Error;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// Size of the atomic unit of every read and write. There are no partial page operations.
pub const PAGE_SIZE: usize = 64;
pub const PAGES_PER_CHIP: u32 = 512;
/// The board has five chip select lines.
pub const MAX_CHIPS: u8 = 5;

/// Contents of one page. Erased or never written EEPROM reads as all ones.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub const fn erased() -> Self {
        Self([0xFF; PAGE_SIZE])
    }

    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }

    pub const fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    pub fn is_erased(&self) -> bool {
        self.0.iter().all(|&b| b == 0xFF)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl From<[u8; PAGE_SIZE]> for Page {
    fn from(value: [u8; PAGE_SIZE]) -> Self {
        Self(value)
    }
}

impl Deref for Page {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Eight rows of eight bytes, the same dump the console prints for a page.
impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page [")?;
        for (row, chunk) in self.0.chunks(8).enumerate() {
            write!(f, "  r{row}:")?;
            for byte in chunk {
                write!(f, " {byte:02X}")?;
            }
            writeln!(f)?;
        }
        write!(f, "]")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Page {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Page({=[u8]:x})", &self.0[..])
    }
}

/// Chip and byte offset within that chip for a global page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageAddress {
    pub chip: u8,
    pub offset: u16,
}

impl PageAddress {
    /// Translates `page` for a bank of `chips` chips. Pages beyond the bank are rejected, never
    /// wrapped.
    pub fn new(page: u32, chips: u8) -> Result<Self, Error> {
        let pages = PAGES_PER_CHIP * chips as u32;
        if page >= pages {
            return Err(Error::PageOutOfRange { page, pages });
        }

        Ok(Self {
            chip: (page / PAGES_PER_CHIP) as u8,
            offset: ((page % PAGES_PER_CHIP) * PAGE_SIZE as u32) as u16,
        })
    }
}
