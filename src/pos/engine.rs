//! Send / acknowledge / receive / acknowledge handshake.
//!
//! Every exchange walks the same phases:
//!
//! ```text
//! Idle -> Sending -> AwaitAck -> AwaitResponse -> AwaitReplyAck -> Success
//!            ^          |             ^                 |
//!            +-- nak ---+             +---- bad lrc ----+
//! ```
//!
//! The send phase and the response phase each get `Message::retries`
//! attempts, counted independently. Commands whose availability policy is
//! [`Availability::AckOnly`] finish as soon as the terminal acknowledges.
//!
//! Bytes read past the end of a response frame are kept and served first
//! by the next read.
//!
//! Waiting for response bytes is a busy poll of [`Transport::bytes_waiting`]
//! with no sleep between polls. [`EngineConfig::poll_interval`] and
//! [`EngineConfig::response_timeout`] can relax or bound it.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::catalog::{Availability, Message, ReadMode};
use super::frame::{self, ACK, NAK};
use super::transport::Transport;
use crate::error::{PosError, Result};

/// Upper bound on a single response frame.
pub const MAX_RESPONSE_SIZE: usize = 1024;

const READ_CHUNK: usize = 64;

/// Exchange phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitAck,
    AwaitResponse,
    AwaitReplyAck,
    Success,
    Failed,
}

/// Tuning knobs for the response wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Give up waiting for response bytes after this long. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// Sleep between availability polls. `None` spins.
    pub poll_interval: Option<Duration>,
}

/// Outcome of a successful exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Working copy of the request. `response_size` holds the bytes actually
    /// read for [`ReadMode::RecordActual`] commands.
    pub message: Message,
    /// Response frame as received. Empty for acknowledgement-only commands.
    pub frame: Vec<u8>,
    /// Frames written before the terminal acknowledged.
    pub send_attempts: u32,
    /// Response attempts consumed, including the successful one.
    pub response_attempts: u32,
}

/// Protocol state machine bound to one transport.
pub struct Engine<T: Transport> {
    transport: T,
    config: EngineConfig,
    phase: Phase,
    /// Bytes taken off the link after the last complete frame.
    pending: Vec<u8>,
}

impl<T: Transport> Engine<T> {
    /// Create an engine over `transport`.
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            phase: Phase::Idle,
            pending: Vec::new(),
        }
    }

    /// Phase reached by the last exchange.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Bytes already read that follow the last response frame.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop pending bytes and clear the transport's buffers.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!("Discarding {} pending bytes", self.pending.len());
            self.pending.clear();
        }
        self.transport.flush_buffers()
    }

    /// Run a full exchange for `message`.
    pub fn execute(&mut self, message: &Message) -> Result<Exchange> {
        let mut working = message.clone();
        self.phase = Phase::Idle;

        let result = self.run(&mut working);
        self.phase = if result.is_ok() { Phase::Success } else { Phase::Failed };

        match &result {
            Ok(exchange) => info!(
                "{} completed: {} bytes received, {} send attempt(s)",
                working.command,
                exchange.frame.len(),
                exchange.send_attempts
            ),
            Err(e) => warn!("{} failed: {e}", working.command),
        }

        result
    }

    fn run(&mut self, working: &mut Message) -> Result<Exchange> {
        let send_attempts = self.send_until_acknowledged(working)?;

        if !working.spec().availability.expects_response() {
            return Ok(Exchange {
                message: working.clone(),
                frame: Vec::new(),
                send_attempts,
                response_attempts: 0,
            });
        }

        let (frame, response_attempts) = self.receive_with_reply_ack(working)?;

        Ok(Exchange {
            message: working.clone(),
            frame,
            send_attempts,
            response_attempts,
        })
    }

    /// `Sending` / `AwaitAck`: write the frame until the terminal ACKs it.
    fn send_until_acknowledged(&mut self, message: &Message) -> Result<u32> {
        let mut tries = 0;

        while tries < message.retries {
            tries += 1;
            self.phase = Phase::Sending;
            debug!(
                "TX {} ({} bytes, attempt {tries}/{}): {:02X?}",
                message.command,
                message.payload.len(),
                message.retries,
                message.as_bytes()
            );

            if let Err(e) = self.transport.write_all(message.as_bytes()) {
                warn!("Write of {} failed: {e}", message.command);
                continue;
            }

            self.phase = Phase::AwaitAck;
            match self.read_ack_byte()? {
                Some(ACK) => {
                    debug!("RX ACK for {}", message.command);
                    return Ok(tries);
                }
                Some(other) => warn!("Expected ACK for {}, got {other:#04x}", message.command),
                None => warn!("No acknowledgement byte for {}", message.command),
            }
        }

        Err(PosError::NoAcknowledgement {
            command: message.command,
            attempts: tries,
        })
    }

    /// Read the single acknowledgement byte. `None` on timeout or empty read.
    fn read_ack_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read_some(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_retryable(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `AwaitResponse` / `AwaitReplyAck`: wait for data, read it, reply ACK.
    fn receive_with_reply_ack(&mut self, working: &mut Message) -> Result<(Vec<u8>, u32)> {
        let spec = working.spec();
        let mut tries = 0;

        while tries < working.retries {
            self.phase = Phase::AwaitResponse;
            if !self.wait_for_data(spec.availability, working.response_size)? {
                warn!("Timed out waiting for response to {}", working.command);
                return Err(PosError::NoResponse {
                    command: working.command,
                    attempts: tries,
                });
            }

            let frame = self.read_frame(working.response_size)?;
            tries += 1;

            if frame.is_empty() {
                warn!(
                    "Empty read for {} (attempt {tries}/{})",
                    working.command, working.retries
                );
                continue;
            }

            debug!("RX {} bytes: {:02X?}", frame.len(), frame);
            if spec.read_mode == ReadMode::RecordActual {
                working.response_size = frame.len();
            }

            self.phase = Phase::AwaitReplyAck;
            if self.reply_ack(&frame) {
                return Ok((frame, tries));
            }
            warn!(
                "Reply acknowledgement for {} failed (attempt {tries}/{})",
                working.command, working.retries
            );
        }

        Err(PosError::NoResponse {
            command: working.command,
            attempts: tries,
        })
    }

    /// Poll the input buffer until `availability` holds.
    ///
    /// Returns `false` if the configured response timeout elapsed first.
    fn wait_for_data(&mut self, availability: Availability, expected: usize) -> Result<bool> {
        let started = Instant::now();

        loop {
            let waiting = self.pending.len() + self.transport.bytes_waiting()?;
            if availability.is_satisfied(waiting, expected) {
                debug!("{waiting} bytes waiting, reading response");
                return Ok(true);
            }

            if let Some(timeout) = self.config.response_timeout {
                if started.elapsed() >= timeout {
                    return Ok(false);
                }
            }

            if let Some(interval) = self.config.poll_interval {
                std::thread::sleep(interval);
            }
        }
    }

    /// Read until a complete frame is buffered or the transport has nothing
    /// more to give.
    ///
    /// `expected` only sizes the initial buffer; frames longer than declared
    /// are read whole, up to [`MAX_RESPONSE_SIZE`]. Bytes after the frame's
    /// LRC go back to `pending`.
    fn read_frame(&mut self, expected: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(expected);
        let mut chunk = [0u8; READ_CHUNK];

        while buf.len() < MAX_RESPONSE_SIZE {
            let want = READ_CHUNK.min(MAX_RESPONSE_SIZE - buf.len());
            match self.read_some(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(len) = frame::complete_len(&buf) {
                        let mut rest = buf.split_off(len);
                        if !rest.is_empty() {
                            debug!("Keeping {} bytes after frame", rest.len());
                            rest.append(&mut self.pending);
                            self.pending = rest;
                        }
                        break;
                    }
                }
                Err(e) if is_retryable(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(buf)
    }

    /// Read from `pending` first, then from the transport.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return self.transport.read(buf);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    /// Check the frame and answer ACK (valid) or NAK (invalid).
    ///
    /// Returns `true` only if the frame was valid and the ACK was written.
    fn reply_ack(&mut self, frame: &[u8]) -> bool {
        match frame::verify(frame) {
            Ok(()) => match self.transport.write_all(&[ACK]) {
                Ok(()) => {
                    debug!("TX ACK");
                    true
                }
                Err(e) => {
                    warn!("Failed to write ACK: {e}");
                    false
                }
            },
            Err(e) => {
                warn!("Rejecting response: {e}");
                if let Err(e) = self.transport.write_all(&[NAK]) {
                    warn!("Failed to write NAK: {e}");
                }
                false
            }
        }
    }
}

/// Read errors that mean "nothing arrived" rather than a broken link.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
