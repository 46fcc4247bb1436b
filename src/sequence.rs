//! Battery backed clock (MCP7940N register map) and the sequence metadata kept in its SRAM.
//!
//! The clock keeps running on its backup battery while the node is unpowered. On power loss it
//! latches the minute, hour, day and month of the failure and of the restoration and raises the
//! power-fail flag. `begin` turns those snapshots into full timestamps and clears the flag.
//!
//! The sequence record lives in the clock's 64 byte SRAM rather than in the EEPROM bank so it
//! survives even when the EEPROMs are absent or blank.

use crate::codec::{FieldReader, FieldWriter, Record};
use crate::error::{Error, Loaded};
use crate::page::{PAGE_SIZE, Page};
use crate::platform::Timing;
use crate::time::{DateTime, EPOCH_FLOOR_YEAR, LAST_YEAR, bcd_to_bin, bin_to_bcd};
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
#[cfg(feature = "defmt")]
use defmt::{info, trace, warn};

pub const RTC_ADDRESS: u8 = 0x6F;

const REG_RTCSEC: u8 = 0x00;
const REG_RTCWKDAY: u8 = 0x03;
const REG_PWRDN: u8 = 0x18;
const REG_SRAM: u8 = 0x20;

/// Oscillator start bit in RTCSEC
const SEC_ST: u8 = 0x80;
/// Oscillator running, read only
const WKDAY_OSCRUN: u8 = 0x20;
const WKDAY_PWRFAIL: u8 = 0x10;
/// Keeps the clock on the backup battery during power loss
const WKDAY_VBATEN: u8 = 0x08;
const WKDAY_MASK: u8 = 0x07;

/// Two digit year register, offset from 2000
const CENTURY: u16 = 2000;
/// Allowed clock drift before a time sync resets the clock, in seconds
pub const MAX_DRIFT: u32 = 3600;
/// Ids at most this far ahead of the counter count as not yet issued
const HALF_ID_SPACE: u32 = 1 << 31;

#[derive(strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockState {
    /// Oscillator disabled: fresh chip, or the backup battery ran flat.
    Stopped,
    /// Power-fail snapshots are being turned into timestamps.
    Reconciling,
    Running,
}

/// Power loss and restoration as reconstructed from the clock's snapshot registers. The
/// snapshots have no seconds, so both timestamps are rounded down to the minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerWindow {
    pub failed_at: DateTime,
    pub restored_at: DateTime,
}

impl PowerWindow {
    /// Rebuilds both timestamps from the raw 4 byte snapshots (minute, hour, day, weekday/month
    /// in BCD) using the year of `now`.
    pub fn reconstruct(
        power_down: [u8; 4],
        power_up: [u8; 4],
        now: &DateTime,
    ) -> Result<Self, Error> {
        Ok(Self {
            failed_at: reconstruct_snapshot(power_down, now)?,
            restored_at: reconstruct_snapshot(power_up, now)?,
        })
    }
}

/// The snapshot carries no year. A snapshot month past the current month can only come from the
/// previous year.
pub fn reconstruct_snapshot(snapshot: [u8; 4], now: &DateTime) -> Result<DateTime, Error> {
    let minute = bcd_to_bin(snapshot[0] & 0x7F);
    let hour = bcd_to_bin(snapshot[1] & 0x3F);
    let day = bcd_to_bin(snapshot[2] & 0x3F);
    let month = bcd_to_bin(snapshot[3] & 0x1F);

    let year = if month > now.month {
        now.year - 1
    } else {
        now.year
    };

    DateTime::new(year, month, day, hour, minute, 0)
}

/// Sequence metadata, persisted in the clock's SRAM.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceRecord {
    /// Id handed to the next committed sample.
    pub next_id: u32,
    /// Samples with ids below this value have been acknowledged by the server. Zero means none.
    pub last_sent_id: u32,
    /// Credential slot of the last successful connection.
    pub last_used_wifi: u8,
    /// Unix time of the last successful time sync, zero if never synced.
    pub last_time_sync: u32,
}

impl Record for SequenceRecord {
    fn write_fields(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.next_id)
            .u32(self.last_sent_id)
            .u8(self.last_used_wifi)
            .skip(3)
            .u32(self.last_time_sync);
    }

    fn read_fields(r: &mut FieldReader<'_>) -> Self {
        let next_id = r.u32();
        let last_sent_id = r.u32();
        let last_used_wifi = r.u8();
        r.skip(3);
        let last_time_sync = r.u32();

        Self {
            next_id,
            last_sent_id,
            last_used_wifi,
            last_time_sync,
        }
    }
}

pub struct DurableSequence<I2C, D> {
    i2c: I2C,
    delay: D,
    timing: Timing,
    state: ClockState,
    power_window: Option<PowerWindow>,
    record: SequenceRecord,
}

impl<I2C, D> DurableSequence<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D, timing: Timing) -> Self {
        Self {
            i2c,
            delay,
            timing,
            state: ClockState::Stopped,
            power_window: None,
            record: SequenceRecord::default(),
        }
    }

    /// Detects whether the clock kept running, reconciles a pending power failure and loads the
    /// sequence record. A corrupted or blank record is replaced by a zeroed one, which is
    /// persisted before returning.
    ///
    /// The clock forgets a failure once it is reconciled, so a window that has not been cleared
    /// with `clear_power_window` is kept across a failed and retried `begin`.
    pub fn begin(&mut self) -> Result<Loaded<SequenceRecord>, Error> {
        let wkday = self.read_register(REG_RTCWKDAY)?;

        if wkday & WKDAY_OSCRUN != 0 {
            if wkday & WKDAY_PWRFAIL != 0 {
                self.state = ClockState::Reconciling;
                self.reconcile()?;
            }
            self.state = ClockState::Running;
        } else {
            self.state = ClockState::Stopped;
            if wkday & WKDAY_PWRFAIL != 0 {
                // the snapshots are relative to a clock that was not running, nothing to recover
                self.clear_power_fail()?;
            }
        }

        #[cfg(feature = "defmt")]
        info!("begin: clock {}", self.state);

        let mut buf = Page::zeroed();
        self.i2c
            .write_read(RTC_ADDRESS, &[REG_SRAM], &mut buf.0)
            .map_err(|_| Error::Bus)?;

        match SequenceRecord::decode(&buf) {
            Ok(record) => {
                self.record = record;
                Ok(Loaded::Stored(record))
            }
            Err(Error::ChecksumMismatch) => {
                #[cfg(feature = "defmt")]
                warn!("begin: sequence record invalid, starting over");

                let record = SequenceRecord::default();
                self.persist(record)?;
                Ok(Loaded::Defaulted(record))
            }
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    /// Power failure reconciled by `begin` and not yet cleared.
    pub fn power_window(&self) -> Option<PowerWindow> {
        self.power_window
    }

    /// Drops the reconciled window once it has been recorded elsewhere.
    pub fn clear_power_window(&mut self) {
        self.power_window = None;
    }

    pub fn record(&self) -> &SequenceRecord {
        &self.record
    }

    pub fn next_id(&self) -> u32 {
        self.record.next_id
    }

    /// Samples committed but not yet acknowledged. Purely informational: nothing throttles
    /// production when the ring wraps over unacknowledged samples.
    pub fn pending(&self) -> u32 {
        self.record.next_id.wrapping_sub(self.record.last_sent_id)
    }

    /// Decodes the live time registers.
    pub fn now(&mut self) -> Result<DateTime, Error> {
        let mut regs = [0u8; 7];
        self.i2c
            .write_read(RTC_ADDRESS, &[REG_RTCSEC], &mut regs)
            .map_err(|_| Error::Bus)?;

        DateTime::new(
            CENTURY + bcd_to_bin(regs[6]) as u16,
            bcd_to_bin(regs[5] & 0x1F),
            bcd_to_bin(regs[4] & 0x3F),
            bcd_to_bin(regs[2] & 0x3F),
            bcd_to_bin(regs[1] & 0x7F),
            bcd_to_bin(regs[0] & 0x7F),
        )
    }

    /// Stops the oscillator, writes the new time in 24 hour mode with battery backup enabled, and
    /// restarts the oscillator. Returns once the chip reports it running again.
    pub fn set_time(&mut self, time: DateTime) -> Result<(), Error> {
        if time.year < EPOCH_FLOOR_YEAR || time.year > LAST_YEAR {
            return Err(Error::TimeOutOfRange);
        }

        #[cfg(feature = "defmt")]
        trace!("set_time: {}", time);

        self.write_registers(REG_RTCSEC, &[0x00])?;
        self.wait_for_oscillator(false)?;

        let second = bin_to_bcd(time.second);
        self.write_registers(
            REG_RTCSEC,
            &[
                second,
                bin_to_bcd(time.minute),
                bin_to_bcd(time.hour),
                WKDAY_VBATEN | (time.weekday() & WKDAY_MASK),
                bin_to_bcd(time.day),
                bin_to_bcd(time.month),
                bin_to_bcd((time.year - CENTURY) as u8),
            ],
        )?;
        self.write_registers(REG_RTCSEC, &[second | SEC_ST])?;
        self.wait_for_oscillator(true)?;

        self.state = ClockState::Running;
        Ok(())
    }

    /// Applies a time obtained from the network. The clock is only set when it is not running,
    /// reads back garbage, or has drifted by more than `MAX_DRIFT`; the sync itself is always
    /// recorded. Returns whether the clock was set.
    pub fn sync_time(&mut self, network_time: DateTime) -> Result<bool, Error> {
        let set = if self.is_running() {
            match self.now() {
                Ok(now) => now.to_epoch().abs_diff(network_time.to_epoch()) > MAX_DRIFT,
                Err(Error::InvalidTime) => {
                    #[cfg(feature = "defmt")]
                    warn!("sync_time: clock registers unreadable, resetting");
                    true
                }
                Err(e) => return Err(e),
            }
        } else {
            true
        };

        if set {
            self.set_time(network_time)?;
        }

        self.persist(SequenceRecord {
            last_time_sync: network_time.to_epoch(),
            ..self.record
        })?;
        Ok(set)
    }

    /// Marks `id` and every earlier sample as acknowledged. Never moves backwards.
    ///
    /// Ids are compared modulo 2^32 like the counter itself: anything up to half the id space
    /// at or ahead of `next_id` has not been issued yet, anything else outside the pending range
    /// was acknowledged before.
    pub fn acknowledge(&mut self, id: u32) -> Result<(), Error> {
        if id.wrapping_sub(self.record.last_sent_id) >= self.pending() {
            if id.wrapping_sub(self.record.next_id) < HALF_ID_SPACE {
                return Err(Error::SampleNotFound);
            }
            return Ok(());
        }

        self.persist(SequenceRecord {
            last_sent_id: id.wrapping_add(1),
            ..self.record
        })
    }

    pub fn set_last_used_wifi(&mut self, slot: u8) -> Result<(), Error> {
        if slot == self.record.last_used_wifi {
            return Ok(());
        }

        self.persist(SequenceRecord {
            last_used_wifi: slot,
            ..self.record
        })
    }

    /// Persists `next_id + 1`. Only called once the sample carrying `next_id` is confirmed on its
    /// page; if persisting fails the in-memory counter is left untouched.
    pub(crate) fn advance(&mut self) -> Result<u32, Error> {
        let next_id = self.record.next_id.wrapping_add(1);
        self.persist(SequenceRecord {
            next_id,
            ..self.record
        })?;
        Ok(next_id)
    }

    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    /// The in-memory copy is only replaced after the SRAM write succeeded.
    fn persist(&mut self, record: SequenceRecord) -> Result<(), Error> {
        let page = record.encode();
        let mut buf = [0u8; PAGE_SIZE + 1];
        buf[0] = REG_SRAM;
        buf[1..].copy_from_slice(&page.0);
        self.i2c.write(RTC_ADDRESS, &buf).map_err(|_| Error::Bus)?;

        self.record = record;
        Ok(())
    }

    fn reconcile(&mut self) -> Result<(), Error> {
        let mut snapshots = [0u8; 8];
        self.i2c
            .write_read(RTC_ADDRESS, &[REG_PWRDN], &mut snapshots)
            .map_err(|_| Error::Bus)?;

        let mut power_down = [0u8; 4];
        let mut power_up = [0u8; 4];
        power_down.copy_from_slice(&snapshots[..4]);
        power_up.copy_from_slice(&snapshots[4..]);

        match self
            .now()
            .and_then(|now| PowerWindow::reconstruct(power_down, power_up, &now))
        {
            Ok(window) => {
                #[cfg(feature = "defmt")]
                info!("reconcile: power failed {} restored {}", window.failed_at, window.restored_at);

                self.power_window = Some(window);
            }
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("reconcile: discarding unreadable snapshot: {}", _e);
            }
        }

        self.clear_power_fail()
    }

    /// Clearing the flag also clears both snapshots.
    fn clear_power_fail(&mut self) -> Result<(), Error> {
        let wkday = self.read_register(REG_RTCWKDAY)?;
        self.write_registers(REG_RTCWKDAY, &[wkday & !WKDAY_PWRFAIL])
    }

    fn wait_for_oscillator(&mut self, running: bool) -> Result<(), Error> {
        for attempt in 0..self.timing.oscillator_poll_attempts {
            if attempt > 0 {
                self.delay.delay_us(self.timing.oscillator_poll_interval_us);
            }
            let wkday = self.read_register(REG_RTCWKDAY)?;
            if (wkday & WKDAY_OSCRUN != 0) == running {
                return Ok(());
            }
        }

        #[cfg(feature = "defmt")]
        warn!("wait_for_oscillator: never reached running = {}", running);

        Err(Error::BusTimeout)
    }

    fn read_register(&mut self, register: u8) -> Result<u8, Error> {
        let mut value = [0u8];
        self.i2c
            .write_read(RTC_ADDRESS, &[register], &mut value)
            .map_err(|_| Error::Bus)?;
        Ok(value[0])
    }

    fn write_registers(&mut self, register: u8, values: &[u8]) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        buf[0] = register;
        buf[1..=values.len()].copy_from_slice(values);
        self.i2c
            .write(RTC_ADDRESS, &buf[..=values.len()])
            .map_err(|_| Error::Bus)
    }
}
