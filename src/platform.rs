//! Hardware seams. The storage bus, the clock bus and the delay source come from `embedded-hal`;
//! chip selection is a small trait of this crate so that boards routing the select lines through
//! an I/O expander can plug in directly.

use embedded_hal::digital::OutputPin;

/// Drives the select line of one of several chips sharing a bus. Select lines are active low;
/// at most one chip is selected at any time.
pub trait ChipSelect {
    type Error;

    fn select(&mut self, chip: u8) -> Result<(), Self::Error>;
    fn deselect(&mut self, chip: u8) -> Result<(), Self::Error>;
}

impl<T: ChipSelect> ChipSelect for &mut T {
    type Error = T::Error;

    fn select(&mut self, chip: u8) -> Result<(), Self::Error> {
        (*self).select(chip)
    }

    fn deselect(&mut self, chip: u8) -> Result<(), Self::Error> {
        (*self).deselect(chip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelectError<E> {
    Pin(E),
    /// No select line is wired for this chip.
    NoSuchChip(u8),
}

/// One GPIO per chip, index = chip number. Chips beyond the array are refused so that a chip
/// count larger than the wired lines never reaches the bus.
impl<P: OutputPin, const N: usize> ChipSelect for [P; N] {
    type Error = SelectError<P::Error>;

    fn select(&mut self, chip: u8) -> Result<(), Self::Error> {
        self.get_mut(chip as usize)
            .ok_or(SelectError::NoSuchChip(chip))?
            .set_low()
            .map_err(SelectError::Pin)
    }

    fn deselect(&mut self, chip: u8) -> Result<(), Self::Error> {
        self.get_mut(chip as usize)
            .ok_or(SelectError::NoSuchChip(chip))?
            .set_high()
            .map_err(SelectError::Pin)
    }
}

/// Bounds for every busy-wait in the crate. A chip that has not become ready after `attempts`
/// polls is reported as `Error::BusTimeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    /// Status register polls while an EEPROM write cycle is in progress.
    pub status_poll_attempts: u16,
    pub status_poll_interval_us: u32,
    /// Write-enable (WREN) assertions before giving up on a chip.
    pub write_enable_attempts: u16,
    pub write_enable_interval_us: u32,
    /// Polls of the clock's oscillator-running bit after starting or stopping it.
    pub oscillator_poll_attempts: u16,
    pub oscillator_poll_interval_us: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            // 25xx write cycles take up to 5 ms
            status_poll_attempts: 50,
            status_poll_interval_us: 1_000,
            write_enable_attempts: 10,
            write_enable_interval_us: 10_000,
            // the crystal may need more than a second to start
            oscillator_poll_attempts: 200,
            oscillator_poll_interval_us: 10_000,
        }
    }
}
