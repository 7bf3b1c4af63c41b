//! PosTerminal struct and public API.

use tracing::{debug, info};

use super::catalog::{self, Command, Message};
use super::engine::{Engine, EngineConfig, Exchange};
use super::response::{BaseResponse, RawFrame, TotalsResponse};
use super::transport::{SerialTransport, Transport};
use crate::config::SerialConfig;
use crate::error::{PosError, Result};

/// Host-side client for a POS terminal.
///
/// Owns its transport; every operation takes `&mut self`, so at most one
/// exchange is in flight per terminal. All calls block until the exchange
/// completes or its retries are exhausted.
pub struct PosTerminal<T: Transport = SerialTransport> {
    engine: Engine<T>,
}

impl PosTerminal<SerialTransport> {
    /// Open a serial port and bind a terminal to it.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let serial = SerialConfig {
            port: port_name.to_string(),
            baud_rate,
            ..SerialConfig::default()
        };
        Self::open_with(&serial, EngineConfig::default())
    }

    /// Open the port described by `serial` with explicit engine settings.
    pub fn open_with(serial: &SerialConfig, config: EngineConfig) -> Result<Self> {
        let transport = SerialTransport::open(&serial.port, serial.baud_rate, serial.read_timeout())?;
        info!(
            "Terminal bound to {}",
            transport.name().unwrap_or_else(|| serial.port.clone())
        );
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> PosTerminal<T> {
    /// Bind a terminal to an existing transport.
    pub fn with_transport(transport: T, config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(transport, config),
        }
    }

    /// Request a sale for `amount` under `ticket`.
    ///
    /// Returns the terminal's response frame undecoded.
    pub fn sale(&mut self, amount: u64, ticket: u32, send_messages: bool) -> Result<RawFrame> {
        info!("Requesting sale: amount={amount}, ticket={ticket}, send_messages={send_messages}");
        let message = catalog::prepare_sale(amount, ticket, send_messages)?;
        self.exchange_raw(&message)
    }

    /// Fetch the last sale recorded by the terminal.
    pub fn last_sale(&mut self) -> Result<RawFrame> {
        let message = static_message(Command::LastSale)?;
        self.exchange_raw(message)
    }

    /// Cancel a previous transaction.
    pub fn cancellation(&mut self, transaction_id: u32) -> Result<RawFrame> {
        info!("Requesting cancellation of transaction {transaction_id}");
        let message = catalog::prepare_cancellation(transaction_id)?;
        self.exchange_raw(&message)
    }

    /// Close the terminal's day.
    pub fn close(&mut self) -> Result<BaseResponse> {
        let exchange = self.exchange(Command::Close)?;
        BaseResponse::decode(&exchange.frame)
    }

    /// Load keys from the acquirer.
    pub fn load_keys(&mut self) -> Result<BaseResponse> {
        let exchange = self.exchange(Command::LoadKeys)?;
        BaseResponse::decode(&exchange.frame)
    }

    /// Transaction count and total since the last close.
    pub fn get_totals(&mut self) -> Result<TotalsResponse> {
        let exchange = self.exchange(Command::GetTotals)?;
        TotalsResponse::decode(&exchange.frame)
    }

    /// Check the terminal is connected and responsive.
    pub fn poll(&mut self) -> Result<()> {
        self.exchange(Command::Poll).map(|_| ())
    }

    /// Switch the terminal back to normal (standalone) mode.
    pub fn set_normal_mode(&mut self) -> Result<()> {
        self.exchange(Command::ChangeToNormal).map(|_| ())
    }

    pub fn transport(&self) -> &T {
        self.engine.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.engine.transport_mut()
    }

    pub fn into_transport(self) -> T {
        self.engine.into_transport()
    }

    /// Flush both buffers and release the transport.
    pub fn close_port(mut self) -> Result<()> {
        debug!("Closing terminal port");
        self.engine.flush()?;
        drop(self.engine);
        Ok(())
    }

    fn exchange(&mut self, command: Command) -> Result<Exchange> {
        let message = static_message(command)?;
        self.engine.execute(message)
    }

    fn exchange_raw(&mut self, message: &Message) -> Result<RawFrame> {
        let exchange = self.engine.execute(message)?;
        Ok(RawFrame::new(exchange.frame))
    }
}

fn static_message(command: Command) -> Result<&'static Message> {
    catalog::message(command)
        .ok_or_else(|| PosError::invalid_parameter(format!("{command} needs parameters")))
}
