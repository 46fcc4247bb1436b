//! Fixed size, CRC framed records. Every persisted structure is exactly one page: the fields in
//! little endian order, zero padding, and a CRC32 over the first `PAYLOAD_SIZE` bytes in the last
//! four bytes. Field order and padding are defined by each record's `Record` impl, never by the
//! in-memory layout.

use crate::error::Error;
use crate::page::{PAGE_SIZE, Page};
#[cfg(feature = "defmt")]
use defmt::trace;

pub const CRC_SIZE: usize = 4;
pub const PAYLOAD_SIZE: usize = PAGE_SIZE - CRC_SIZE;

/// CRC32 with the IEEE polynomial, identical to zlib's `crc32(0, data)`. Used for every record,
/// the clock's scratch memory and the device token.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Recomputes the CRC over the payload and stores it in the trailing four bytes.
pub fn stamp(page: &mut Page) {
    let crc = crc32(&page[..PAYLOAD_SIZE]);
    page[PAYLOAD_SIZE..].copy_from_slice(&crc.to_le_bytes());
}

/// A page is valid iff the stored CRC matches the recomputed one.
pub fn verify(page: &Page) -> Result<(), Error> {
    let stored = u32::from_le_bytes([
        page[PAYLOAD_SIZE],
        page[PAYLOAD_SIZE + 1],
        page[PAYLOAD_SIZE + 2],
        page[PAYLOAD_SIZE + 3],
    ]);
    let calculated = crc32(&page[..PAYLOAD_SIZE]);

    if stored != calculated {
        #[cfg(feature = "defmt")]
        trace!("verify: stored {:#010x} != {:#010x}", stored, calculated);
        return Err(Error::ChecksumMismatch);
    }
    Ok(())
}

/// A typed view of one page.
pub trait Record: Sized {
    fn write_fields(&self, w: &mut FieldWriter<'_>);
    fn read_fields(r: &mut FieldReader<'_>) -> Self;

    /// Serializes the record and stamps the CRC.
    fn encode(&self) -> Page {
        let mut page = Page::zeroed();
        {
            let mut w = FieldWriter::new(&mut page[..PAYLOAD_SIZE]);
            self.write_fields(&mut w);
        }
        stamp(&mut page);
        page
    }

    /// Validates the CRC, then deserializes. Invalid pages are never partially trusted.
    fn decode(page: &Page) -> Result<Self, Error> {
        verify(page)?;
        let mut r = FieldReader::new(&page[..PAYLOAD_SIZE]);
        Ok(Self::read_fields(&mut r))
    }
}

/// Sequential little endian writer over a record payload. Untouched bytes stay zero.
pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Floats are stored bit exact, so the all-ones NaN used for "not measured" survives.
    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.u32(value.to_bits())
    }

    pub fn skip(&mut self, len: usize) -> &mut Self {
        self.pos += len;
        self
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.bytes::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.bytes())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }

    pub fn skip(&mut self, len: usize) -> &mut Self {
        self.pos += len;
        self
    }
}
