//! Fixed page map of the EEPROM bank and accessors for the pages owned by the provisioning and
//! network code.
//!
//! | Page    | Content                                           |
//! |---------|---------------------------------------------------|
//! | 0       | `ConfigRecord`                                    |
//! | 1       | temperature sensor id table                       |
//! | 2       | device auth token (CRC framed)                    |
//! | 3       | registration secret                               |
//! | 4       | upload URL                                        |
//! | 16..=35 | Wi-Fi credentials, SSID then PSK per slot         |
//! | 128..   | sample ring                                       |

use crate::codec;
use crate::config::ConfigRecord;
use crate::error::Error;
use crate::page::{PAGE_SIZE, Page};
use crate::platform::ChipSelect;
use crate::store::PagedStore;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiBus;
#[cfg(feature = "defmt")]
use defmt::trace;

pub const CONFIG_PAGE: u32 = 0;
pub const TEMPERATURE_SENSOR_TABLE_PAGE: u32 = 1;
pub const DEVICE_TOKEN_PAGE: u32 = 2;
pub const REGISTRATION_SECRET_PAGE: u32 = 3;
pub const URL_PAGE: u32 = 4;
pub const FIRST_WIFI_PAGE: u32 = 16;
pub const MAX_WIFI_CREDENTIALS: u8 = 10;
pub const FIRST_SAMPLE_PAGE: u32 = 128;

/// Leading byte of a cleared text page.
const CLEARED: u8 = 0xFF;

/// Null terminated UTF-8 text filling at most one page.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TextPage(Page);

impl TextPage {
    pub fn new(text: &str) -> Result<Self, Error> {
        // room for the terminator
        if text.len() >= PAGE_SIZE {
            return Err(Error::ValueTooLong);
        }

        let mut page = Page::zeroed();
        page[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self(page))
    }

    pub fn cleared() -> Self {
        let mut page = Page::zeroed();
        page[0] = CLEARED;
        Self(page)
    }

    pub fn is_cleared(&self) -> bool {
        self.0[0] == CLEARED
    }

    /// `None` for a cleared page or bytes that are not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        if self.is_cleared() {
            return None;
        }
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(PAGE_SIZE);
        core::str::from_utf8(&self.0[..len]).ok()
    }

    pub fn as_page(&self) -> &Page {
        &self.0
    }
}

impl core::fmt::Debug for TextPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.as_str() {
            Some(text) => write!(f, "TextPage({text:?})"),
            None if self.is_cleared() => write!(f, "TextPage(<cleared>)"),
            None => write!(f, "TextPage(<invalid>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiCredential {
    pub ssid: TextPage,
    pub psk: TextPage,
}

impl WifiCredential {
    pub fn ssid(&self) -> Option<&str> {
        self.ssid.as_str()
    }

    pub fn psk(&self) -> Option<&str> {
        self.psk.as_str()
    }
}

/// SSID page of credential `slot`; the PSK is on the page after it.
pub const fn wifi_page(slot: u8) -> u32 {
    FIRST_WIFI_PAGE + 2 * slot as u32
}

impl<SPI, CS, D> PagedStore<SPI, CS, D>
where
    SPI: SpiBus,
    CS: ChipSelect,
    D: DelayNs,
{
    pub fn read_text(&mut self, page: u32) -> Result<TextPage, Error> {
        Ok(TextPage(self.read_page(page)?))
    }

    pub fn write_text(&mut self, page: u32, text: &str) -> Result<(), Error> {
        let text = TextPage::new(text)?;
        self.write_page(page, text.as_page())
    }

    /// Credential in `slot`, `None` if the slot was cleared.
    pub fn read_credential(
        &mut self,
        config: &ConfigRecord,
        slot: u8,
    ) -> Result<Option<WifiCredential>, Error> {
        if slot >= config.wifi_credentials {
            return Err(Error::CredentialSlotOutOfRange);
        }

        let ssid = self.read_text(wifi_page(slot))?;
        if ssid.is_cleared() {
            return Ok(None);
        }
        let psk = self.read_text(wifi_page(slot) + 1)?;
        if psk.is_cleared() {
            return Ok(None);
        }

        Ok(Some(WifiCredential { ssid, psk }))
    }

    /// Writes the SSID of `slot`. Slots are filled in order: writing the slot right after the last
    /// one appends a credential and bumps the count in `config`, which the caller has to save.
    pub fn write_ssid(
        &mut self,
        config: &mut ConfigRecord,
        slot: u8,
        ssid: &str,
    ) -> Result<(), Error> {
        self.write_credential_page(config, slot, 0, ssid)
    }

    pub fn write_psk(&mut self, config: &mut ConfigRecord, slot: u8, psk: &str) -> Result<(), Error> {
        self.write_credential_page(config, slot, 1, psk)
    }

    /// Clears both pages of `slot`. The count in `config` then shrinks past every cleared slot at
    /// the end, so clearing slots 1 and then 2 of three leaves one credential.
    pub fn clear_credential(&mut self, config: &mut ConfigRecord, slot: u8) -> Result<(), Error> {
        if slot >= config.wifi_credentials {
            return Err(Error::CredentialSlotOutOfRange);
        }

        #[cfg(feature = "defmt")]
        trace!("clear_credential: slot {}", slot);

        let cleared = TextPage::cleared();
        self.write_page(wifi_page(slot), cleared.as_page())?;
        self.write_page(wifi_page(slot) + 1, cleared.as_page())?;

        while let Some(last) = config.wifi_credentials.checked_sub(1) {
            if !self.is_slot_cleared(last)? {
                break;
            }
            config.wifi_credentials = last;
        }
        Ok(())
    }

    fn is_slot_cleared(&mut self, slot: u8) -> Result<bool, Error> {
        Ok(self.read_text(wifi_page(slot))?.is_cleared()
            && self.read_text(wifi_page(slot) + 1)?.is_cleared())
    }

    /// The token handed out on registration carries its own trailing CRC32.
    pub fn read_device_token(&mut self) -> Result<Page, Error> {
        let page = self.read_page(DEVICE_TOKEN_PAGE)?;
        codec::verify(&page)?;
        Ok(page)
    }

    /// Refuses tokens that do not pass their CRC so a garbled token never replaces a good one.
    pub fn write_device_token(&mut self, token: &Page) -> Result<(), Error> {
        codec::verify(token)?;
        self.write_page(DEVICE_TOKEN_PAGE, token)
    }

    fn write_credential_page(
        &mut self,
        config: &mut ConfigRecord,
        slot: u8,
        offset: u32,
        text: &str,
    ) -> Result<(), Error> {
        if slot > config.wifi_credentials || slot >= MAX_WIFI_CREDENTIALS {
            return Err(Error::CredentialSlotOutOfRange);
        }

        #[cfg(feature = "defmt")]
        trace!("write_credential_page: slot {} +{}", slot, offset);

        self.write_text(wifi_page(slot) + offset, text)?;

        if slot == config.wifi_credentials {
            config.wifi_credentials += 1;
        }
        Ok(())
    }
}
