use crate::codec::{FieldReader, FieldWriter, Record};
use crate::error::{Error, Loaded};
use crate::layout::{CONFIG_PAGE, MAX_WIFI_CREDENTIALS};
use crate::page::MAX_CHIPS;
use crate::platform::ChipSelect;
use crate::sample::TEMPERATURE_SENSORS;
use crate::store::PagedStore;
use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiBus;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Device configuration, persisted on `CONFIG_PAGE`. Changes made through the setters only reach
/// the EEPROM with `save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigRecord {
    pub barometer: bool,
    pub humidity: bool,
    /// Number of fitted EEPROM chips; the only source for the store's addressable range.
    pub chips: u8,
    pub temperature_sensors: u8,
    pub wifi_credentials: u8,
    /// Zero until provisioned. Always passes `validate_serial_no` otherwise.
    pub serial_no: u32,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            barometer: false,
            humidity: false,
            chips: 1,
            temperature_sensors: 0,
            wifi_credentials: 0,
            serial_no: 0,
        }
    }
}

impl Record for ConfigRecord {
    fn write_fields(&self, w: &mut FieldWriter<'_>) {
        w.u8(self.barometer as u8)
            .u8(self.humidity as u8)
            .u8(self.chips)
            .u8(self.temperature_sensors)
            .u8(self.wifi_credentials)
            .skip(3)
            .u32(self.serial_no);
    }

    fn read_fields(r: &mut FieldReader<'_>) -> Self {
        let barometer = r.u8() != 0;
        let humidity = r.u8() != 0;
        let chips = r.u8();
        let temperature_sensors = r.u8();
        let wifi_credentials = r.u8();
        r.skip(3);
        let serial_no = r.u32();

        Self {
            barometer,
            humidity,
            chips,
            temperature_sensors,
            wifi_credentials,
            serial_no,
        }
    }
}

impl ConfigRecord {
    /// Loads the configuration page. A page failing its checksum is replaced by the defaults,
    /// which are written back before returning so the page never stays invalid. Values that pass
    /// the checksum but are out of range are reset to safe values.
    pub fn load<SPI, CS, D>(store: &mut PagedStore<SPI, CS, D>) -> Result<Loaded<Self>, Error>
    where
        SPI: SpiBus,
        CS: ChipSelect,
        D: DelayNs,
    {
        let page = store.read_page(CONFIG_PAGE)?;
        match Self::decode(&page) {
            Ok(config) => Ok(Loaded::Stored(config.normalized())),
            Err(Error::ChecksumMismatch) => {
                #[cfg(feature = "defmt")]
                warn!("load: configuration invalid, writing defaults");

                #[cfg(feature = "debug-logs")]
                println!("config: invalid page, using defaults");

                let config = Self::default();
                config.save(store)?;
                Ok(Loaded::Defaulted(config))
            }
            Err(e) => Err(e),
        }
    }

    pub fn save<SPI, CS, D>(&self, store: &mut PagedStore<SPI, CS, D>) -> Result<(), Error>
    where
        SPI: SpiBus,
        CS: ChipSelect,
        D: DelayNs,
    {
        store.write_page(CONFIG_PAGE, &self.encode())
    }

    pub fn set_chip_count(&mut self, chips: u8) -> Result<(), Error> {
        if chips == 0 || chips > MAX_CHIPS {
            return Err(Error::InvalidChipCount);
        }
        self.chips = chips;
        Ok(())
    }

    /// The serial can be set once, and only to a value passing the parity fingerprint.
    pub fn set_serial_no(&mut self, serial_no: u32) -> Result<(), Error> {
        if self.serial_no != 0 || !validate_serial_no(serial_no) {
            return Err(Error::InvalidSerialNo);
        }
        self.serial_no = serial_no;
        Ok(())
    }

    fn normalized(mut self) -> Self {
        if self.serial_no != 0 && !validate_serial_no(self.serial_no) {
            #[cfg(feature = "defmt")]
            warn!("load: discarding invalid serial {:#010x}", self.serial_no);
            self.serial_no = 0;
        }
        if self.chips == 0 || self.chips > MAX_CHIPS {
            #[cfg(feature = "defmt")]
            warn!("load: invalid chip count {}", self.chips);
            self.chips = 1;
        }
        self.temperature_sensors = self.temperature_sensors.min(TEMPERATURE_SENSORS as u8);
        self.wifi_credentials = self.wifi_credentials.min(MAX_WIFI_CREDENTIALS);
        self
    }
}

/// Parity fingerprint of a serial number, least significant byte first: bytes 0 and 3 need an odd
/// number of set bits, bytes 1 and 2 an even number. Rejects blank (0x00000000) and erased
/// (0xFFFFFFFF) values; it does not authenticate anything.
pub fn validate_serial_no(serial_no: u32) -> bool {
    let [b0, b1, b2, b3] = serial_no.to_le_bytes();
    b0.count_ones() % 2 == 1
        && b1.count_ones() % 2 == 0
        && b2.count_ones() % 2 == 0
        && b3.count_ones() % 2 == 1
}
