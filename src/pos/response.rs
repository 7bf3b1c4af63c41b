//! Typed response records and their decoders.

use std::fmt;

use serde::Serialize;

use super::frame::{self, extract_field, parse_decimal};
use crate::error::{PosError, Result};

/// Field position inside a fixed-layout response.
#[derive(Debug, Clone, Copy)]
struct FieldInfo {
    index: usize,
    length: usize,
}

impl FieldInfo {
    const fn new(index: usize, length: usize) -> Self {
        Self { index, length }
    }

    fn extract<'a>(&self, buf: &'a [u8]) -> Result<&'a str> {
        extract_field(buf, self.index, self.length)
    }
}

// Close / load keys response layout:
// STX | function(4) | '|' | code(2) | '|' | commerce(12) | '|' | terminal(8) | ETX | LRC
const FUNCTION: FieldInfo = FieldInfo::new(1, 4);
const RESPONSE_CODE: FieldInfo = FieldInfo::new(6, 2);
const COMMERCE_CODE: FieldInfo = FieldInfo::new(9, 12);
const TERMINAL_ID: FieldInfo = FieldInfo::new(22, 8);

/// Whether a record came from a completed exchange.
///
/// Decoders only ever build records with `Ok`; failed exchanges surface as
/// [`PosError`] instead of a `Nok` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    Nok,
}

/// Response to close and load keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseResponse {
    pub function: u32,
    pub response_code: u32,
    pub commerce_code: u64,
    pub terminal_id: u32,
    pub status: Status,
}

impl BaseResponse {
    /// Decode the fixed-offset layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            function: parse_decimal(FUNCTION.extract(buf)?)?,
            response_code: parse_decimal(RESPONSE_CODE.extract(buf)?)?,
            commerce_code: parse_decimal(COMMERCE_CODE.extract(buf)?)?,
            terminal_id: parse_decimal(TERMINAL_ID.extract(buf)?)?,
            status: Status::Ok,
        })
    }

    /// Response code `00`.
    pub fn is_approved(&self) -> bool {
        self.response_code == 0
    }
}

/// Response to get totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalsResponse {
    pub function: u32,
    pub response_code: u32,
    pub tx_count: u32,
    pub tx_total: u64,
    pub status: Status,
}

impl TotalsResponse {
    /// Decode the `|`-delimited layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let tokens = frame::tokenize(buf)?;
        if tokens.len() < 4 {
            return Err(PosError::decode(format!(
                "Totals response has {} fields, expected 4",
                tokens.len()
            )));
        }

        Ok(Self {
            function: parse_decimal(tokens[0])?,
            response_code: parse_decimal(tokens[1])?,
            tx_count: parse_decimal(tokens[2])?,
            tx_total: parse_decimal(tokens[3])?,
            status: Status::Ok,
        })
    }

    /// Response code `00`.
    pub fn is_approved(&self) -> bool {
        self.response_code == 0
    }
}

/// Response frame handed back undecoded (sale, last sale, cancellation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(Vec<u8>);

impl RawFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `|`-separated fields between `STX` and `ETX`.
    pub fn fields(&self) -> Result<Vec<&str>> {
        frame::tokenize(&self.0)
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RawFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RawFrame {
    /// Printable ASCII as is, everything else escaped.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02X}")?;
            }
        }
        Ok(())
    }
}
