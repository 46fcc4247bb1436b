//! Measurement records and their ring buffer in the sample region.
//!
//! Sample `id` lives on page `FIRST_SAMPLE_PAGE + id % capacity`, where the capacity is whatever
//! the configured chips leave after the fixed pages. Once ids pass the capacity the oldest pages
//! are reused whether or not they were acknowledged.

use crate::codec::{FieldReader, FieldWriter, Record};
use crate::error::Error;
use crate::layout::FIRST_SAMPLE_PAGE;
use crate::platform::ChipSelect;
use crate::sequence::DurableSequence;
use crate::store::PagedStore;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;
#[cfg(feature = "defmt")]
use defmt::trace;

pub const TEMPERATURE_SENSORS: usize = 8;

/// All ones, the value of a reading that was not taken.
pub const NOT_MEASURED: f32 = f32::from_bits(u32::MAX);

/// Status bit: the node was on external power when the sample was taken.
pub const STATUS_EXTERNAL_POWER: u8 = 0x01;

#[derive(strum::FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SampleType {
    SensorRead = 0x01,
    PowerFail = 0x20,
    Unknown = 0xFF,
}

/// The two type dependent slots of a sample, disambiguated by the type tag.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleKind {
    Reading { battery_voltage: f32, pressure: f32 },
    PowerEvent { failed_at: u32, restored_at: u32 },
    /// Tag not known to this firmware; the slots are kept verbatim.
    Unknown { tag: u8, slots: [u32; 2] },
}

impl SampleKind {
    pub fn sample_type(&self) -> SampleType {
        match self {
            SampleKind::Reading { .. } => SampleType::SensorRead,
            SampleKind::PowerEvent { .. } => SampleType::PowerFail,
            SampleKind::Unknown { .. } => SampleType::Unknown,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            SampleKind::Unknown { tag, .. } => *tag,
            _ => self.sample_type() as u8,
        }
    }

    fn slots(&self) -> [u32; 2] {
        match *self {
            SampleKind::Reading {
                battery_voltage,
                pressure,
            } => [battery_voltage.to_bits(), pressure.to_bits()],
            SampleKind::PowerEvent {
                failed_at,
                restored_at,
            } => [failed_at, restored_at],
            SampleKind::Unknown { slots, .. } => slots,
        }
    }

    fn from_tag(tag: u8, slots: [u32; 2]) -> Self {
        match SampleType::from_repr(tag) {
            Some(SampleType::SensorRead) => SampleKind::Reading {
                battery_voltage: f32::from_bits(slots[0]),
                pressure: f32::from_bits(slots[1]),
            },
            Some(SampleType::PowerFail) => SampleKind::PowerEvent {
                failed_at: slots[0],
                restored_at: slots[1],
            },
            _ => SampleKind::Unknown { tag, slots },
        }
    }
}

// readings compare bit exact so NOT_MEASURED equals itself
impl PartialEq for SampleKind {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag() && self.slots() == other.slots()
    }
}

/// One measurement event. Written once, never updated in place.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SampleRecord {
    /// Low 16 bits of the sequence id, stamped by `commit`.
    pub id: u16,
    pub status: u8,
    /// Unix time of the measurement.
    pub timestamp: u32,
    pub kind: SampleKind,
    pub baro_temperature: f32,
    pub humidity: f32,
    pub humidity_temperature: f32,
    pub temperatures: [f32; TEMPERATURE_SENSORS],
}

impl SampleRecord {
    /// A sensor reading with every measurement set to `NOT_MEASURED`.
    pub fn reading(timestamp: u32) -> Self {
        Self {
            id: 0,
            status: 0,
            timestamp,
            kind: SampleKind::Reading {
                battery_voltage: NOT_MEASURED,
                pressure: NOT_MEASURED,
            },
            baro_temperature: NOT_MEASURED,
            humidity: NOT_MEASURED,
            humidity_temperature: NOT_MEASURED,
            temperatures: [NOT_MEASURED; TEMPERATURE_SENSORS],
        }
    }

    pub fn power_event(timestamp: u32, failed_at: u32, restored_at: u32) -> Self {
        Self {
            kind: SampleKind::PowerEvent {
                failed_at,
                restored_at,
            },
            ..Self::reading(timestamp)
        }
    }

    pub fn sample_type(&self) -> SampleType {
        self.kind.sample_type()
    }

    pub fn external_power(&self) -> bool {
        self.status & STATUS_EXTERNAL_POWER != 0
    }
}

impl PartialEq for SampleRecord {
    fn eq(&self, other: &Self) -> bool {
        fn bits<const N: usize>(values: &[f32; N]) -> [u32; N] {
            values.map(f32::to_bits)
        }

        self.id == other.id
            && self.status == other.status
            && self.timestamp == other.timestamp
            && self.kind == other.kind
            && bits(&[
                self.baro_temperature,
                self.humidity,
                self.humidity_temperature,
            ]) == bits(&[
                other.baro_temperature,
                other.humidity,
                other.humidity_temperature,
            ])
            && bits(&self.temperatures) == bits(&other.temperatures)
    }
}

impl Record for SampleRecord {
    fn write_fields(&self, w: &mut FieldWriter<'_>) {
        let [slot_a, slot_b] = self.kind.slots();
        w.u16(self.id)
            .u8(self.kind.tag())
            .u8(self.status)
            .u32(self.timestamp)
            .u32(slot_a)
            .u32(slot_b)
            .f32(self.baro_temperature)
            .f32(self.humidity)
            .f32(self.humidity_temperature);
        for temperature in self.temperatures {
            w.f32(temperature);
        }
    }

    fn read_fields(r: &mut FieldReader<'_>) -> Self {
        let id = r.u16();
        let tag = r.u8();
        let status = r.u8();
        let timestamp = r.u32();
        let slots = [r.u32(), r.u32()];
        let baro_temperature = r.f32();
        let humidity = r.f32();
        let humidity_temperature = r.f32();
        let temperatures = core::array::from_fn(|_| r.f32());

        Self {
            id,
            status,
            timestamp,
            kind: SampleKind::from_tag(tag, slots),
            baro_temperature,
            humidity,
            humidity_temperature,
            temperatures,
        }
    }
}

/// Number of ring slots left by `pages` addressable pages.
pub fn sample_capacity(pages: u32) -> u32 {
    pages.saturating_sub(FIRST_SAMPLE_PAGE)
}

/// Page holding sample `id` when `pages` pages are addressable.
pub fn sample_page(id: u32, pages: u32) -> Result<u32, Error> {
    let capacity = sample_capacity(pages);
    if capacity == 0 {
        return Err(Error::PageOutOfRange {
            page: FIRST_SAMPLE_PAGE,
            pages,
        });
    }
    Ok(FIRST_SAMPLE_PAGE + id % capacity)
}

/// Stamps `sample` with the next id, writes it to its ring slot and only then advances the
/// persisted counter. A failed page write leaves the counter alone; a failed counter update after
/// a confirmed write means the next commit reuses the id and overwrites the same page, so an id is
/// never associated with two different pages.
pub fn commit<SPI, CS, SD, I2C, CD>(
    sample: &mut SampleRecord,
    sequence: &mut DurableSequence<I2C, CD>,
    store: &mut PagedStore<SPI, CS, SD>,
) -> Result<u32, Error>
where
    SPI: SpiBus,
    CS: ChipSelect,
    SD: DelayNs,
    I2C: I2c,
    CD: DelayNs,
{
    let id = sequence.next_id();
    let page = sample_page(id, store.pages())?;
    sample.id = id as u16;

    #[cfg(feature = "defmt")]
    trace!("commit: sample {} to page {}", id, page);

    store.write_page(page, &sample.encode())?;
    sequence.advance()?;

    Ok(id)
}

/// Loads sample `id` from its ring slot. Reports `SampleNotFound` when the slot is blank,
/// corrupted, or already holds a different sample.
pub fn read_sample<SPI, CS, D>(
    id: u32,
    store: &mut PagedStore<SPI, CS, D>,
) -> Result<SampleRecord, Error>
where
    SPI: SpiBus,
    CS: ChipSelect,
    D: DelayNs,
{
    let page = store.read_page(sample_page(id, store.pages())?)?;
    match SampleRecord::decode(&page) {
        Ok(sample) if sample.id == id as u16 => Ok(sample),
        Ok(_) | Err(Error::ChecksumMismatch) => Err(Error::SampleNotFound),
        Err(e) => Err(e),
    }
}
