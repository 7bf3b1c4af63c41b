//! Transbank POS serial protocol client.
//!
//! Drives a payment terminal over a byte-serial link using the framed
//! request/response protocol (STX, command code, `|` fields, ETX, LRC).
//!
//! # Example
//!
//! ```ignore
//! use transbank_pos::pos::PosTerminal;
//!
//! let mut terminal = PosTerminal::open("/dev/ttyACM0", 115200)?;
//! terminal.poll()?;
//! let totals = terminal.get_totals()?;
//! println!("{} transactions, {} total", totals.tx_count, totals.tx_total);
//! terminal.close_port()?;
//! ```

mod catalog;
mod engine;
pub mod frame;
mod response;
mod terminal;
mod transport;

#[cfg(test)]
mod tests;

pub use catalog::{
    Availability, Command, CommandSpec, MAX_AMOUNT, MAX_TICKET, Message, RETRIES, ReadMode, message,
    prepare_cancellation, prepare_sale,
};
pub use engine::{Engine, EngineConfig, Exchange, Phase};
pub use response::{BaseResponse, RawFrame, Status, TotalsResponse};
pub use terminal::PosTerminal;
pub use transport::{DEFAULT_READ_TIMEOUT, PortInfo, SerialTransport, Transport, list_ports};

/// Default baud rate of the terminal's serial link.
pub const DEFAULT_BAUD_RATE: u32 = 115200;
