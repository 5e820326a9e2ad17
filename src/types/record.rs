//! The unit of data moving through the pipeline

use bytes::Bytes;
use std::fmt;

/// The byte that terminates a record on the wire
pub const DELIMITER: u8 = b'\n';

/// One newline-delimited line received from a client.
///
/// The delimiter is kept as part of the record so the sink receives exactly
/// the bytes the client sent. A record is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Bytes);

impl Record {
    /// Wrap raw bytes, returning `None` for an empty slice
    pub fn new(bytes: impl Into<Bytes>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Raw bytes, delimiter included
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the record and return its bytes
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for Record {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.0);
        write!(f, "{}", text.trim_end_matches(['\r', '\n']))
    }
}
