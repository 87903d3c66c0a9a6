use std::fmt;
use std::io;

use super::model::InstrumentId;

/// Errors surfaced by the store.
///
/// `Io`, `Codec`, `Corrupt` and `Migration` are systemic: they abort the
/// current cycle. `ReferentialViolation` and `UnknownInstrument` reject a
/// single write.
#[derive(Debug)]
pub enum StoreError {
    /// Write against an instrument that does not exist.
    ReferentialViolation { instrument: InstrumentId },
    /// Lookup by name/serial found nothing.
    UnknownInstrument(String),
    Io(io::Error),
    Codec(String),
    Corrupt(String),
    Migration { from: u16, to: u16, reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ReferentialViolation { instrument } => {
                write!(f, "instrument {instrument} does not exist")
            }
            StoreError::UnknownInstrument(what) => write!(f, "no such instrument: {what}"),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
            StoreError::Codec(e) => write!(f, "encoding error: {e}"),
            StoreError::Corrupt(e) => write!(f, "corrupt state file: {e}"),
            StoreError::Migration { from, to, reason } => {
                write!(f, "migration {from} -> {to} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}
