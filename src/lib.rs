#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod page;
pub mod platform;
pub mod sample;
pub mod sequence;
pub mod store;
pub mod time;

pub use codec::Record;
pub use config::{ConfigRecord, validate_serial_no};
pub use error::{Error, Loaded};
pub use page::{PAGE_SIZE, Page};
pub use sample::{SampleKind, SampleRecord};
pub use sequence::{DurableSequence, PowerWindow, SequenceRecord};
pub use store::PagedStore;
pub use time::DateTime;

use crate::platform::ChipSelect;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;
#[cfg(feature = "defmt")]
use defmt::{info, warn};

/// What happened during `Node::boot`, for the caller to log or report.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootReport {
    /// The clock kept its time through the last power cycle.
    pub clock_running: bool,
    pub power_window: Option<PowerWindow>,
    /// Outcome of committing a power event sample for `power_window`. On failure the window stays
    /// pending and `Node::record_power_event` can be retried.
    pub power_event: Option<Result<u32, Error>>,
    pub config_defaulted: bool,
    pub sequence_defaulted: bool,
}

/// A failed `Node::boot`. Carries the hardware back so the caller can retry.
pub struct BootError<SPI, CS, SD, I2C, CD> {
    pub error: Error,
    pub store: PagedStore<SPI, CS, SD>,
    pub sequence: DurableSequence<I2C, CD>,
}

impl<SPI, CS, SD, I2C, CD> core::fmt::Debug for BootError<SPI, CS, SD, I2C, CD> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Owns the storage engine, the clock and the configuration. Built once at startup and handed to
/// every collaborator by reference.
pub struct Node<SPI, CS, SD, I2C, CD> {
    pub store: PagedStore<SPI, CS, SD>,
    pub sequence: DurableSequence<I2C, CD>,
    pub config: ConfigRecord,
}

impl<SPI, CS, SD, I2C, CD> core::fmt::Debug for Node<SPI, CS, SD, I2C, CD> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<SPI, CS, SD, I2C, CD> Node<SPI, CS, SD, I2C, CD>
where
    SPI: SpiBus,
    CS: ChipSelect,
    SD: DelayNs,
    I2C: I2c,
    CD: DelayNs,
{
    /// Brings up the clock and the sequence record first, then the configuration, and scales the
    /// store to the configured chip count. A power failure seen by the clock is recorded as a
    /// power event sample; failing to do so does not fail the boot.
    pub fn boot(
        mut store: PagedStore<SPI, CS, SD>,
        mut sequence: DurableSequence<I2C, CD>,
    ) -> Result<(Self, BootReport), BootError<SPI, CS, SD, I2C, CD>> {
        let loaded = sequence
            .begin()
            .and_then(|seq| Ok((seq, ConfigRecord::load(&mut store)?)));
        let (sequence_loaded, config_loaded) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                return Err(BootError {
                    error,
                    store,
                    sequence,
                });
            }
        };

        let config = config_loaded.into_inner();
        if let Err(error) = store.set_capacity(config.chips) {
            return Err(BootError {
                error,
                store,
                sequence,
            });
        }

        #[cfg(feature = "defmt")]
        info!("boot: {} chips, next id {}", config.chips, sequence.next_id());

        let mut node = Self {
            store,
            sequence,
            config,
        };

        let power_window = node.sequence.power_window();
        let power_event = node.record_power_event();

        let report = BootReport {
            clock_running: node.sequence.is_running(),
            power_window,
            power_event,
            config_defaulted: config_loaded.is_defaulted(),
            sequence_defaulted: sequence_loaded.is_defaulted(),
        };
        Ok((node, report))
    }

    /// Commits a power event sample for the clock's pending power window and clears the window.
    /// `None` when there is nothing pending. A failed commit leaves the window pending.
    pub fn record_power_event(&mut self) -> Option<Result<u32, Error>> {
        let window = self.sequence.power_window()?;

        let result = self.sequence.now().and_then(|now| {
            let mut sample = SampleRecord::power_event(
                now.to_epoch(),
                window.failed_at.to_epoch(),
                window.restored_at.to_epoch(),
            );
            self.commit(&mut sample)
        });

        match result {
            Ok(_) => self.sequence.clear_power_window(),
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("record_power_event: {}", _e);
            }
        }
        Some(result)
    }

    /// Commits `sample` under the next sequence id and returns that id.
    pub fn commit(&mut self, sample: &mut SampleRecord) -> Result<u32, Error> {
        sample::commit(sample, &mut self.sequence, &mut self.store)
    }

    pub fn read_sample(&mut self, id: u32) -> Result<SampleRecord, Error> {
        sample::read_sample(id, &mut self.store)
    }

    /// Persists the configuration and applies its chip count to the store.
    pub fn save_config(&mut self) -> Result<(), Error> {
        self.config.save(&mut self.store)?;
        self.store.set_capacity(self.config.chips)
    }

    pub fn release(self) -> (PagedStore<SPI, CS, SD>, DurableSequence<I2C, CD>) {
        (self.store, self.sequence)
    }
}
