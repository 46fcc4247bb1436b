#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use std::cell::{RefCell, RefMut};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital;
use embedded_hal::i2c;
use embedded_hal::spi;
use tempsens_store::platform::{ChipSelect, Timing};
use tempsens_store::{DateTime, DurableSequence, PagedStore};

pub const PAGE_SIZE: usize = 64;
pub const PAGES_PER_CHIP: usize = 512;
pub const CHIP_SIZE: usize = PAGE_SIZE * PAGES_PER_CHIP;

const CMD_WRITE: u8 = 0b0000_0010;
const CMD_READ: u8 = 0b0000_0011;
const CMD_WRDI: u8 = 0b0000_0100;
const CMD_RDSR: u8 = 0b0000_0101;
const CMD_WREN: u8 = 0b0000_0110;

const STATUS_WIP: u8 = 0x01;
const STATUS_WEL: u8 = 0x02;

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { chip: u8, offset: u16 },
    Write { chip: u8, offset: u16, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusFault;

impl spi::Error for BusFault {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

impl i2c::Error for BusFault {
    fn kind(&self) -> i2c::ErrorKind {
        i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address)
    }
}

pub struct Chip {
    pub mem: Vec<u8>,
    pub write_enabled: bool,
    /// Remaining status reads that still report a write in progress
    pub busy_polls: u32,
    pub stuck_busy: bool,
    /// Nothing answers: the bus floats high
    pub absent: bool,
}

impl Chip {
    fn new() -> Self {
        Self {
            mem: vec![0xFFu8; CHIP_SIZE],
            write_enabled: false,
            busy_polls: 0,
            stuck_busy: false,
            absent: false,
        }
    }
}

enum Session {
    Idle,
    Command,
    Address { write: bool, collected: Vec<u8> },
    Reading { offset: usize },
    Writing { offset: u16, data: Vec<u8> },
    Status,
    Done,
}

/// A bank of 25xx series SPI EEPROMs behind one bus.
pub struct Bank {
    pub chips: Vec<Chip>,
    pub operations: Vec<Operation>,
    pub fail_after_operation: usize,
    /// Status reads reporting busy after each page write
    pub write_cycle_polls: u32,
    pub status_reads: usize,
    selected: Option<u8>,
    session: Session,
}

impl Bank {
    fn chip(&mut self) -> &mut Chip {
        let selected = self.selected.expect("bus used without a selected chip") as usize;
        &mut self.chips[selected]
    }

    fn status(&mut self) -> u8 {
        self.status_reads += 1;
        let chip = self.chip();
        let mut status = 0u8;
        if chip.write_enabled {
            status |= STATUS_WEL;
        }
        if chip.stuck_busy {
            status |= STATUS_WIP;
        } else if chip.busy_polls > 0 {
            chip.busy_polls -= 1;
            status |= STATUS_WIP;
        }
        status
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), BusFault> {
        let session = std::mem::replace(&mut self.session, Session::Done);
        self.session = match session {
            Session::Idle => panic!("bus used without a selected chip"),
            Session::Command => match byte {
                CMD_READ | CMD_WRITE => {
                    if self.operations.len() >= self.fail_after_operation {
                        println!("    eeprom: FAULT");
                        return Err(BusFault);
                    }
                    Session::Address {
                        write: byte == CMD_WRITE,
                        collected: vec![],
                    }
                }
                CMD_WREN => {
                    self.chip().write_enabled = true;
                    Session::Done
                }
                CMD_WRDI => {
                    self.chip().write_enabled = false;
                    Session::Done
                }
                CMD_RDSR => Session::Status,
                other => panic!("unexpected command {other:#04x}"),
            },
            Session::Address {
                write,
                mut collected,
            } => {
                collected.push(byte);
                if collected.len() < 2 {
                    Session::Address { write, collected }
                } else {
                    let offset = u16::from_be_bytes([collected[0], collected[1]]);
                    if write {
                        Session::Writing {
                            offset,
                            data: vec![],
                        }
                    } else {
                        let chip = self.selected.unwrap_or_default();
                        println!("    eeprom: read:  {chip}:0x{offset:04X} #{:>2}", self.operations.len());
                        self.operations.push(Operation::Read { chip, offset });
                        Session::Reading {
                            offset: offset as usize,
                        }
                    }
                }
            }
            Session::Writing { offset, mut data } => {
                data.push(byte);
                Session::Writing { offset, data }
            }
            other => other,
        };
        Ok(())
    }

    fn read_byte(&mut self) -> u8 {
        if self.chip().absent {
            return 0xFF;
        }
        match self.session {
            Session::Reading { ref mut offset } => {
                let at = *offset % CHIP_SIZE;
                *offset += 1;
                let selected = self.selected.unwrap_or_default() as usize;
                self.chips[selected].mem[at]
            }
            Session::Status => self.status(),
            _ => 0xFF,
        }
    }

    fn select(&mut self, chip: u8) {
        assert_eq!(self.selected, None, "chip {chip} selected while another is active");
        self.selected = Some(chip);
        self.session = Session::Command;
    }

    fn deselect(&mut self, chip: u8) {
        assert_eq!(self.selected, Some(chip), "deselecting a chip that is not selected");

        let session = std::mem::replace(&mut self.session, Session::Idle);
        if let Session::Writing { offset, data } = session {
            let ops = self.operations.len();
            let write_cycle_polls = self.write_cycle_polls;
            let target = self.chip();
            if target.write_enabled && !target.absent {
                // writes wrap around within the addressed page
                let base = offset as usize & !(PAGE_SIZE - 1);
                for (i, byte) in data.iter().enumerate() {
                    let at = base + (offset as usize + i) % PAGE_SIZE;
                    target.mem[at] = *byte;
                }
                target.write_enabled = false;
                target.busy_polls = write_cycle_polls;
                println!("    eeprom: write: {chip}:0x{offset:04X}[{}] #{ops:>2}", data.len());
                self.operations.push(Operation::Write {
                    chip,
                    offset,
                    len: data.len(),
                });
            }
        }
        self.selected = None;
    }
}

#[derive(Clone)]
pub struct Eeprom(Rc<RefCell<Bank>>);

impl Eeprom {
    pub fn new(chips: usize) -> Self {
        Self(Rc::new(RefCell::new(Bank {
            chips: (0..chips).map(|_| Chip::new()).collect(),
            operations: vec![],
            fail_after_operation: usize::MAX,
            write_cycle_polls: 2,
            status_reads: 0,
            selected: None,
            session: Session::Idle,
        })))
    }

    pub fn new_with_fault(chips: usize, fail_after_operation: usize) -> Self {
        let eeprom = Self::new(chips);
        eeprom.bank().fail_after_operation = fail_after_operation;
        eeprom
    }

    pub fn bank(&self) -> RefMut<'_, Bank> {
        self.0.borrow_mut()
    }

    pub fn disable_faults(&self) {
        self.bank().fail_after_operation = usize::MAX;
    }

    pub fn page(&self, page: usize) -> Vec<u8> {
        let bank = self.0.borrow();
        let chip = &bank.chips[page / PAGES_PER_CHIP];
        let start = (page % PAGES_PER_CHIP) * PAGE_SIZE;
        chip.mem[start..start + PAGE_SIZE].to_vec()
    }

    pub fn corrupt(&self, page: usize, byte: usize) {
        let mut bank = self.bank();
        let chip = &mut bank.chips[page / PAGES_PER_CHIP];
        chip.mem[(page % PAGES_PER_CHIP) * PAGE_SIZE + byte] ^= 0x01;
    }

    pub fn writes(&self) -> usize {
        self.0
            .borrow()
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.0.borrow().operations {
            println!("  {:?}", op);
        }
    }

    pub fn spi(&self) -> Spi {
        Spi(self.0.clone())
    }

    pub fn store(&self) -> PagedStore<Spi, Select, NoDelay> {
        PagedStore::new(Spi(self.0.clone()), Select(self.0.clone()), NoDelay, Timing::default())
    }
}

pub struct Spi(Rc<RefCell<Bank>>);

impl spi::ErrorType for Spi {
    type Error = BusFault;
}

impl spi::SpiBus for Spi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut bank = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = bank.read_byte();
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut bank = self.0.borrow_mut();
        for &word in words {
            bank.write_byte(word)?;
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.write(write)?;
        self.read(read)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let out = words.to_vec();
        self.write(&out)?;
        self.read(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct Select(Rc<RefCell<Bank>>);

impl ChipSelect for Select {
    type Error = BusFault;

    fn select(&mut self, chip: u8) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(chip);
        Ok(())
    }

    fn deselect(&mut self, chip: u8) -> Result<(), Self::Error> {
        self.0.borrow_mut().deselect(chip);
        Ok(())
    }
}

/// Select line driven by a GPIO.
#[derive(Debug, Default)]
pub struct Pin {
    pub low: bool,
}

impl digital::ErrorType for Pin {
    type Error = Infallible;
}

impl digital::OutputPin for Pin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.low = false;
        Ok(())
    }
}

pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

const REG_RTCSEC: usize = 0x00;
const REG_RTCWKDAY: usize = 0x03;
const REG_PWRDN: usize = 0x18;
const REG_PWRUP: usize = 0x1C;
const REG_SRAM: usize = 0x20;
const SRAM_SIZE: usize = 64;

const ST: u8 = 0x80;
const OSCRUN: u8 = 0x20;
const PWRFAIL: u8 = 0x10;

fn bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// MCP7940N style battery backed clock with 64 bytes of SRAM.
pub struct ClockChip {
    pub registers: [u8; REG_SRAM + SRAM_SIZE],
    pub absent: bool,
    pub stuck_oscillator: bool,
    pub sram_writes: usize,
    pub fail_after_sram_writes: usize,
}

impl ClockChip {
    fn write(&mut self, pointer: usize, bytes: &[u8]) -> Result<(), BusFault> {
        if pointer >= REG_SRAM {
            if self.sram_writes >= self.fail_after_sram_writes {
                println!("    rtc: FAULT");
                return Err(BusFault);
            }
            self.sram_writes += 1;
        }

        for (i, &byte) in bytes.iter().enumerate() {
            let register = pointer + i;
            match register {
                REG_RTCSEC => {
                    self.registers[REG_RTCSEC] = byte;
                    let running = byte & ST != 0 && !self.stuck_oscillator;
                    if running {
                        self.registers[REG_RTCWKDAY] |= OSCRUN;
                    } else {
                        self.registers[REG_RTCWKDAY] &= !OSCRUN;
                    }
                }
                REG_RTCWKDAY => {
                    let oscrun = self.registers[REG_RTCWKDAY] & OSCRUN;
                    if self.registers[REG_RTCWKDAY] & PWRFAIL != 0 && byte & PWRFAIL == 0 {
                        self.registers[REG_PWRDN..REG_PWRDN + 8].fill(0);
                    }
                    self.registers[REG_RTCWKDAY] = (byte & !OSCRUN) | oscrun;
                }
                r if r < self.registers.len() => self.registers[r] = byte,
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Rtc(Rc<RefCell<ClockChip>>);

impl Rtc {
    /// Fresh chip: oscillator stopped, SRAM blank.
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(ClockChip {
            registers: [0u8; REG_SRAM + SRAM_SIZE],
            absent: false,
            stuck_oscillator: false,
            sram_writes: 0,
            fail_after_sram_writes: usize::MAX,
        })))
    }

    /// Chip that kept running through the last power cycle.
    pub fn running_at(time: DateTime) -> Self {
        let rtc = Self::new();
        {
            let mut chip = rtc.chip();
            chip.registers[0x00] = ST | bcd(time.second);
            chip.registers[0x01] = bcd(time.minute);
            chip.registers[0x02] = bcd(time.hour);
            chip.registers[0x03] = OSCRUN | 0x08 | time.weekday();
            chip.registers[0x04] = bcd(time.day);
            chip.registers[0x05] = bcd(time.month);
            chip.registers[0x06] = bcd((time.year - 2000) as u8);
        }
        rtc
    }

    /// Latches a power failure: snapshots are (minute, hour, day, month) in plain decimal.
    pub fn with_power_fail(self, down: [u8; 4], up: [u8; 4]) -> Self {
        {
            let mut chip = self.chip();
            chip.registers[REG_RTCWKDAY] |= PWRFAIL;
            for (i, value) in down.into_iter().enumerate() {
                chip.registers[REG_PWRDN + i] = bcd(value);
            }
            for (i, value) in up.into_iter().enumerate() {
                chip.registers[REG_PWRUP + i] = bcd(value);
            }
        }
        self
    }

    pub fn chip(&self) -> RefMut<'_, ClockChip> {
        self.0.borrow_mut()
    }

    pub fn power_fail_flag(&self) -> bool {
        self.0.borrow().registers[REG_RTCWKDAY] & PWRFAIL != 0
    }

    pub fn sram(&self) -> Vec<u8> {
        self.0.borrow().registers[REG_SRAM..].to_vec()
    }

    pub fn sequence(&self) -> DurableSequence<Rtc, NoDelay> {
        DurableSequence::new(self.clone(), NoDelay, Timing::default())
    }
}

impl i2c::ErrorType for Rtc {
    type Error = BusFault;
}

impl i2c::I2c for Rtc {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [i2c::Operation<'_>],
    ) -> Result<(), Self::Error> {
        assert_eq!(address, 0x6F);
        let mut chip = self.0.borrow_mut();
        if chip.absent {
            return Err(BusFault);
        }

        let mut pointer = 0usize;
        for operation in operations {
            match operation {
                i2c::Operation::Write(bytes) => {
                    pointer = bytes[0] as usize;
                    chip.write(pointer, &bytes[1..])?;
                    pointer += bytes.len() - 1;
                }
                i2c::Operation::Read(buf) => {
                    for byte in buf.iter_mut() {
                        *byte = chip.registers[pointer % chip.registers.len()];
                        pointer += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reference CRC32 from zlib.
pub fn zlib_crc32(data: &[u8]) -> u32 {
    unsafe { libz_sys::crc32(0, data.as_ptr(), data.len() as _) as u32 }
}
