//! Command table and request message construction.

use std::fmt;
use std::sync::LazyLock;

use super::frame::{AMOUNT_WIDTH, FrameBuilder, TICKET_WIDTH};
use crate::error::{PosError, Result};

/// Attempts allowed per exchange phase, for every command.
pub const RETRIES: u32 = 3;

/// Largest amount that fits the sale amount field.
pub const MAX_AMOUNT: u64 = 999_999_999;

/// Largest ticket or transaction id that fits its field.
pub const MAX_TICKET: u32 = 999_999;

/// Terminal commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Sale,
    LastSale,
    Cancellation,
    Close,
    GetTotals,
    LoadKeys,
    Poll,
    ChangeToNormal,
}

/// Input-availability threshold that must hold before reading a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// No response phase: the exchange ends at the acknowledgement.
    AckOnly,
    /// More than `n` bytes are waiting.
    MoreThan(usize),
    /// Exactly the expected response length is waiting.
    Exactly,
}

impl Availability {
    /// Whether `waiting` bytes satisfy this policy for a response of `expected` bytes.
    pub fn is_satisfied(self, waiting: usize, expected: usize) -> bool {
        match self {
            Availability::AckOnly => false,
            Availability::MoreThan(n) => waiting > n,
            Availability::Exactly => waiting == expected,
        }
    }

    /// Whether the command has a response phase at all.
    pub fn expects_response(self) -> bool {
        self != Availability::AckOnly
    }
}

/// How the working message's response size is treated after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Keep the declared response size.
    Declared,
    /// Overwrite the response size with the number of bytes actually read.
    RecordActual,
}

/// Static protocol properties of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// 4-digit ASCII command code.
    pub code: &'static str,
    /// Request frame length, LRC included.
    pub payload_size: usize,
    /// Expected response frame length.
    pub response_size: usize,
    pub availability: Availability,
    pub read_mode: ReadMode,
}

impl Command {
    /// All commands, in code order.
    pub const ALL: [Command; 8] = [
        Command::Poll,
        Command::Sale,
        Command::LastSale,
        Command::ChangeToNormal,
        Command::Close,
        Command::GetTotals,
        Command::LoadKeys,
        Command::Cancellation,
    ];

    /// Protocol properties for this command.
    pub const fn spec(self) -> CommandSpec {
        match self {
            Command::Sale => CommandSpec {
                code: "0200",
                payload_size: 28,
                response_size: 146,
                availability: Availability::MoreThan(65),
                read_mode: ReadMode::RecordActual,
            },
            Command::LastSale => CommandSpec {
                code: "0250",
                payload_size: 8,
                response_size: 146,
                availability: Availability::MoreThan(0),
                read_mode: ReadMode::RecordActual,
            },
            Command::Cancellation => CommandSpec {
                code: "1200",
                payload_size: 15,
                response_size: 46,
                availability: Availability::MoreThan(0),
                read_mode: ReadMode::RecordActual,
            },
            Command::Close => CommandSpec {
                code: "0500",
                payload_size: 9,
                response_size: 33,
                availability: Availability::MoreThan(0),
                read_mode: ReadMode::Declared,
            },
            Command::GetTotals => CommandSpec {
                code: "0700",
                payload_size: 9,
                response_size: 24,
                availability: Availability::MoreThan(10),
                read_mode: ReadMode::Declared,
            },
            Command::LoadKeys => CommandSpec {
                code: "0800",
                payload_size: 7,
                response_size: 32,
                availability: Availability::Exactly,
                read_mode: ReadMode::Declared,
            },
            Command::Poll => CommandSpec {
                code: "0100",
                payload_size: 7,
                response_size: 1,
                availability: Availability::AckOnly,
                read_mode: ReadMode::Declared,
            },
            Command::ChangeToNormal => CommandSpec {
                code: "0300",
                payload_size: 7,
                response_size: 1,
                availability: Availability::AckOnly,
                read_mode: ReadMode::Declared,
            },
        }
    }

    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Command::Sale => "sale",
            Command::LastSale => "last sale",
            Command::Cancellation => "cancellation",
            Command::Close => "close",
            Command::GetTotals => "get totals",
            Command::LoadKeys => "load keys",
            Command::Poll => "poll",
            Command::ChangeToNormal => "change to normal mode",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.spec().code)
    }
}

/// A request ready to be sent to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    /// Complete frame, LRC included.
    pub payload: Vec<u8>,
    pub payload_size: usize,
    /// Expected response length. Descriptive only, see [`ReadMode`].
    pub response_size: usize,
    pub retries: u32,
}

impl Message {
    /// Wrap a built frame, checking it against the command's declared length.
    fn from_frame(command: Command, frame: Vec<u8>) -> Result<Self> {
        let spec = command.spec();
        if frame.len() != spec.payload_size {
            return Err(PosError::invalid_parameter(format!(
                "{command} frame is {} bytes, expected {}",
                frame.len(),
                spec.payload_size
            )));
        }

        Ok(Self {
            command,
            payload: frame,
            payload_size: spec.payload_size,
            response_size: spec.response_size,
            retries: RETRIES,
        })
    }

    /// Protocol properties of this message's command.
    pub fn spec(&self) -> CommandSpec {
        self.command.spec()
    }

    /// The frame bytes to put on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
}

fn static_frame(command: Command) -> Vec<u8> {
    let builder = FrameBuilder::new(command.spec().code);
    match command {
        Command::Close | Command::GetTotals => builder.empty().empty().build(),
        Command::LastSale => builder.empty().build(),
        _ => builder.build(),
    }
}

fn static_message(command: Command) -> Message {
    let frame = static_frame(command);
    let spec = command.spec();
    Message {
        command,
        payload_size: spec.payload_size,
        response_size: spec.response_size,
        retries: RETRIES,
        payload: frame,
    }
}

static POLL: LazyLock<Message> = LazyLock::new(|| static_message(Command::Poll));
static CHANGE_TO_NORMAL: LazyLock<Message> = LazyLock::new(|| static_message(Command::ChangeToNormal));
static CLOSE: LazyLock<Message> = LazyLock::new(|| static_message(Command::Close));
static GET_TOTALS: LazyLock<Message> = LazyLock::new(|| static_message(Command::GetTotals));
static LOAD_KEYS: LazyLock<Message> = LazyLock::new(|| static_message(Command::LoadKeys));
static LAST_SALE: LazyLock<Message> = LazyLock::new(|| static_message(Command::LastSale));

/// The fixed message for a parameterless command.
///
/// Returns `None` for sale and cancellation, which need [`prepare_sale`] and
/// [`prepare_cancellation`].
pub fn message(command: Command) -> Option<&'static Message> {
    let msg: &'static Message = match command {
        Command::Poll => &*POLL,
        Command::ChangeToNormal => &*CHANGE_TO_NORMAL,
        Command::Close => &*CLOSE,
        Command::GetTotals => &*GET_TOTALS,
        Command::LoadKeys => &*LOAD_KEYS,
        Command::LastSale => &*LAST_SALE,
        Command::Sale | Command::Cancellation => return None,
    };
    Some(msg)
}

/// Build a sale request.
///
/// Fields: `amount(9) | ticket(6) | | | send_messages(1)`.
pub fn prepare_sale(amount: u64, ticket: u32, send_messages: bool) -> Result<Message> {
    if amount > MAX_AMOUNT {
        return Err(PosError::invalid_parameter(format!(
            "Amount {amount} exceeds {MAX_AMOUNT}"
        )));
    }
    if ticket > MAX_TICKET {
        return Err(PosError::invalid_parameter(format!(
            "Ticket {ticket} exceeds {MAX_TICKET}"
        )));
    }

    let frame = FrameBuilder::new(Command::Sale.spec().code)
        .number(amount, AMOUNT_WIDTH)?
        .number(u64::from(ticket), TICKET_WIDTH)?
        .empty()
        .empty()
        .flag(send_messages)
        .build();

    Message::from_frame(Command::Sale, frame)
}

/// Build a cancellation request for a previous transaction.
pub fn prepare_cancellation(transaction_id: u32) -> Result<Message> {
    if transaction_id > MAX_TICKET {
        return Err(PosError::invalid_parameter(format!(
            "Transaction id {transaction_id} exceeds {MAX_TICKET}"
        )));
    }

    let frame = FrameBuilder::new(Command::Cancellation.spec().code)
        .number(u64::from(transaction_id), TICKET_WIDTH)?
        .empty()
        .build();

    Message::from_frame(Command::Cancellation, frame)
}
