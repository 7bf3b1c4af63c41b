//! Frame building, LRC calculation and field extraction.
//!
//! Frame layout:
//! - `STX`
//! - Command code (4 ASCII digits)
//! - Zero or more fields, each prefixed by `|`
//! - `ETX`
//! - LRC (1 byte)

use std::str::FromStr;

use crate::error::{PosError, Result};

/// Start of text.
pub const STX: u8 = 0x02;
/// End of text.
pub const ETX: u8 = 0x03;
/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;
/// Field delimiter.
pub const PIPE: u8 = b'|';
/// Occupies the LRC slot until the checksum is computed.
pub const LRC_PLACEHOLDER: u8 = b'0';

/// Width of the sale amount field.
pub const AMOUNT_WIDTH: usize = 9;
/// Width of the ticket and transaction id fields.
pub const TICKET_WIDTH: usize = 6;

/// Calculate the longitudinal redundancy check (XOR of all bytes).
///
/// Callers pass the covered range: everything after `STX` up to and
/// including `ETX`.
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Compute the LRC of a complete frame whose last byte is the LRC slot.
fn frame_lrc(frame: &[u8]) -> u8 {
    // Covered range: [1, len - 1)
    lrc(&frame[1..frame.len() - 1])
}

/// Format a number as a zero-padded ASCII decimal field.
pub fn format_number(value: u64, width: usize) -> Result<String> {
    let field = format!("{value:0width$}");
    if field.len() > width {
        return Err(PosError::invalid_parameter(format!(
            "{value} does not fit in {width} digits"
        )));
    }
    Ok(field)
}

/// Builder for request frames.
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame with the given 4-digit command code.
    pub fn new(code: &str) -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.push(STX);
        bytes.extend_from_slice(code.as_bytes());
        Self { bytes }
    }

    /// Append a raw field.
    pub fn field(mut self, value: &str) -> Self {
        self.bytes.push(PIPE);
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    /// Append an empty field.
    pub fn empty(self) -> Self {
        self.field("")
    }

    /// Append a zero-padded decimal field.
    pub fn number(self, value: u64, width: usize) -> Result<Self> {
        let field = format_number(value, width)?;
        Ok(self.field(&field))
    }

    /// Append a boolean flag field (`'0'` / `'1'`).
    pub fn flag(self, value: bool) -> Self {
        self.field(if value { "1" } else { "0" })
    }

    /// Close the frame and write its LRC.
    pub fn build(mut self) -> Vec<u8> {
        self.bytes.push(ETX);
        self.bytes.push(LRC_PLACEHOLDER);

        let checksum = frame_lrc(&self.bytes);
        if let Some(slot) = self.bytes.last_mut() {
            *slot = checksum;
        }

        self.bytes
    }
}

/// Position of the first `ETX` in a buffer.
fn find_etx(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == ETX)
}

/// Length of the complete frame at the start of `buf` (`ETX` followed by
/// the LRC), or `None` if more bytes are needed.
pub fn complete_len(buf: &[u8]) -> Option<usize> {
    find_etx(buf).map(|etx| etx + 2).filter(|&len| len <= buf.len())
}

/// Verify framing and LRC of a received frame.
///
/// Bytes after the LRC are ignored.
pub fn verify(frame: &[u8]) -> Result<()> {
    if frame.first() != Some(&STX) {
        return Err(PosError::decode("Frame does not start with STX"));
    }

    let etx = find_etx(frame).ok_or_else(|| PosError::decode("Frame has no ETX"))?;
    let received = *frame
        .get(etx + 1)
        .ok_or_else(|| PosError::decode("Frame is missing its LRC byte"))?;

    let expected = frame_lrc(&frame[..etx + 2]);
    if received != expected {
        return Err(PosError::decode(format!(
            "LRC mismatch: expected {expected:#04x}, got {received:#04x}"
        )));
    }

    Ok(())
}

/// Extract the field `[index, index + length)` as ASCII text.
pub fn extract_field(buf: &[u8], index: usize, length: usize) -> Result<&str> {
    let end = index
        .checked_add(length)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| {
            PosError::decode(format!(
                "Field [{index}, {}) out of bounds for {} byte buffer",
                index.saturating_add(length),
                buf.len()
            ))
        })?;

    let field = &buf[index..end];
    if !field.is_ascii() {
        return Err(PosError::decode(format!("Field at offset {index} is not ASCII")));
    }

    std::str::from_utf8(field).map_err(|e| PosError::decode(format!("Field at offset {index}: {e}")))
}

/// Split a frame body on `|`.
///
/// Scanning starts after the leading `STX` and stops at `ETX`, or at the end
/// of the buffer when there is none.
pub fn tokenize(buf: &[u8]) -> Result<Vec<&str>> {
    if buf.first() != Some(&STX) {
        return Err(PosError::decode("Frame does not start with STX"));
    }

    let end = find_etx(buf).unwrap_or(buf.len());
    let body = &buf[1..end];
    if !body.is_ascii() {
        return Err(PosError::decode("Frame body is not ASCII"));
    }

    let text = std::str::from_utf8(body).map_err(|e| PosError::decode(e.to_string()))?;
    Ok(text.split('|').collect())
}

/// Parse a strictly decimal ASCII field.
pub fn parse_decimal<T: FromStr>(field: &str) -> Result<T> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PosError::decode(format!("Invalid decimal field: {field:?}")));
    }

    field
        .parse::<T>()
        .map_err(|_| PosError::decode(format!("Decimal field out of range: {field:?}")))
}
