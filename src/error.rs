use thiserror::Error;

/// Errors returned by the storage engine and the clock. Structurally invalid but CRC-valid
/// values (e.g. a garbled serial number) are normalized on load and never show up here.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The page lies beyond the range claimed by the configured chip count. Rejected before any
    /// bus activity.
    #[error("page {page} out of range, {pages} pages configured")]
    PageOutOfRange { page: u32, pages: u32 },

    /// The trailing CRC32 of a record does not match its contents. Callers treat the record as
    /// absent.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A chip did not leave its busy / not-ready state within the configured number of polls.
    #[error("bus timeout")]
    BusTimeout,

    /// The internal error value is returned from the provided bus, chip select or delay
    #[error("bus error")]
    Bus,

    /// The clock refuses times before `EPOCH_FLOOR_YEAR` or past the two digit year range.
    #[error("time out of range")]
    TimeOutOfRange,

    /// A calendar field is outside its range (e.g. month 13 or February 30th).
    #[error("invalid time")]
    InvalidTime,

    /// The chip count has to be within `1..=MAX_CHIPS`.
    #[error("invalid chip count")]
    InvalidChipCount,

    /// Serial numbers have to pass the parity fingerprint and can only be set once.
    #[error("invalid serial number")]
    InvalidSerialNo,

    /// Credential slots are limited to `MAX_WIFI_CREDENTIALS` and have to be filled in order.
    #[error("credential slot out of range")]
    CredentialSlotOutOfRange,

    /// Text pages hold at most `PAGE_SIZE - 1` bytes plus the null terminator.
    #[error("value too long")]
    ValueTooLong,

    /// The ring slot for the requested id is empty, corrupted, or already reused by a newer sample.
    #[error("sample not found")]
    SampleNotFound,
}

/// Result of loading a record that falls back to defaults when the stored copy is absent or
/// corrupted. A defaulted record has already been written back by the time it is returned.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Loaded<T> {
    Stored(T),
    Defaulted(T),
}

impl<T> Loaded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Loaded::Stored(value) | Loaded::Defaulted(value) => value,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Loaded::Defaulted(_))
    }
}
