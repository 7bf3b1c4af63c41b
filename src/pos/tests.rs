//! Unit tests for the handshake engine and terminal operations.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::frame::{ACK, ETX, NAK, STX, lrc};
use super::{
    BaseResponse, Command, EngineConfig, Phase, PosTerminal, Status, TotalsResponse, Transport,
    message, prepare_sale,
};
use crate::error::{PosError, Result};

/// In-memory terminal.
///
/// Every write that is not a bare ACK/NAK pops the next scripted reply and
/// appends it to the input buffer. Replies to ACK/NAK writes come from
/// `on_reply`.
#[derive(Default)]
struct ScriptedTerminal {
    inbound: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    on_reply: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    availability_polls: usize,
    /// Fail this many request frame writes.
    fail_writes: usize,
    /// Fail this many ACK/NAK writes.
    fail_control_writes: usize,
    /// Return `Ok(0)` for this many multi-byte reads, even with data waiting.
    empty_reads: usize,
}

impl ScriptedTerminal {
    fn new() -> Self {
        Self::default()
    }

    /// Queue the terminal's answer to the next request frame.
    fn reply(mut self, bytes: Vec<u8>) -> Self {
        self.replies.push_back(bytes);
        self
    }

    /// Queue what the terminal sends after the host's ACK/NAK.
    fn after_reply(mut self, bytes: Vec<u8>) -> Self {
        self.on_reply.push_back(bytes);
        self
    }

    fn request_writes(&self) -> usize {
        self.writes.iter().filter(|w| w.len() > 1).count()
    }

    fn control_writes(&self) -> Vec<u8> {
        self.writes.iter().filter(|w| w.len() == 1).map(|w| w[0]).collect()
    }
}

impl Transport for ScriptedTerminal {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let budget = if bytes.len() == 1 {
            &mut self.fail_control_writes
        } else {
            &mut self.fail_writes
        };
        if *budget > 0 {
            *budget -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }

        self.writes.push(bytes.to_vec());
        let next = if bytes.len() == 1 {
            self.on_reply.pop_front()
        } else {
            self.replies.pop_front()
        };
        if let Some(reply) = next {
            self.inbound.extend(reply);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        if buf.len() > 1 && self.empty_reads > 0 {
            self.empty_reads -= 1;
            return Ok(0);
        }
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        self.availability_polls += 1;
        Ok(self.inbound.len())
    }

    fn flush_buffers(&mut self) -> Result<()> {
        self.inbound.clear();
        Ok(())
    }
}

/// Build a response frame with a valid LRC.
fn response_frame(body: &str) -> Vec<u8> {
    let mut frame = vec![STX];
    frame.extend_from_slice(body.as_bytes());
    frame.push(ETX);
    let checksum = lrc(&frame[1..]);
    frame.push(checksum);
    frame
}

fn ack_then(frame: Vec<u8>) -> Vec<u8> {
    let mut bytes = vec![ACK];
    bytes.extend(frame);
    bytes
}

fn terminal(script: ScriptedTerminal) -> PosTerminal<ScriptedTerminal> {
    PosTerminal::with_transport(
        script,
        EngineConfig {
            response_timeout: Some(Duration::from_millis(50)),
            poll_interval: None,
        },
    )
}

/// Sale response padded past the 65 byte availability threshold.
fn sale_response() -> Vec<u8> {
    let body = format!(
        "0210|00|597029414300|70000170|000001|123456|00000000012345|00|1234|CR|{}",
        "0".repeat(40)
    );
    response_frame(&body)
}

#[test]
fn test_poll_success() {
    let mut term = terminal(ScriptedTerminal::new().reply(vec![ACK]));
    term.poll().unwrap();

    let transport = term.transport();
    assert_eq!(transport.request_writes(), 1);
    assert_eq!(transport.writes[0], message(Command::Poll).unwrap().payload);
    assert_eq!(transport.availability_polls, 0);
}

#[test]
fn test_poll_no_ack_exhausts_retries() {
    let mut term = terminal(ScriptedTerminal::new());

    let err = term.poll().unwrap_err();
    assert!(matches!(
        err,
        PosError::NoAcknowledgement {
            command: Command::Poll,
            attempts: 3
        }
    ));

    let transport = term.transport();
    assert_eq!(transport.request_writes(), 3);
    assert_eq!(transport.availability_polls, 0);
}

#[test]
fn test_nak_then_ack_retries_send() {
    let script = ScriptedTerminal::new().reply(vec![NAK]).reply(vec![0x00]).reply(vec![ACK]);
    let mut term = terminal(script);

    term.set_normal_mode().unwrap();
    assert_eq!(term.transport().request_writes(), 3);
}

#[test]
fn test_write_failure_counts_as_attempt() {
    let mut script = ScriptedTerminal::new().reply(vec![ACK]);
    script.fail_writes = 2;
    let mut term = terminal(script);

    term.poll().unwrap();
    assert_eq!(term.transport().request_writes(), 1);

    let mut script = ScriptedTerminal::new();
    script.fail_writes = 3;
    let mut term = terminal(script);
    assert!(matches!(term.poll(), Err(PosError::NoAcknowledgement { attempts: 3, .. })));
}

#[test]
fn test_close_decodes_base_response() {
    let frame = response_frame("0501|00|000000001234|00000042");
    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));

    let response = term.close().unwrap();
    assert_eq!(
        response,
        BaseResponse {
            function: 501,
            response_code: 0,
            commerce_code: 1234,
            terminal_id: 42,
            status: Status::Ok,
        }
    );
    assert_eq!(term.transport().control_writes(), vec![ACK]);
}

#[test]
fn test_load_keys_requires_exact_length() {
    let frame = response_frame("0810|00|597029414300|70000170");
    assert_eq!(frame.len(), Command::LoadKeys.spec().response_size);

    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));
    let response = term.load_keys().unwrap();
    assert_eq!(response.function, 810);
    assert_eq!(response.commerce_code, 597_029_414_300);
    assert_eq!(response.terminal_id, 70_000_170);
}

#[test]
fn test_load_keys_short_response_times_out() {
    let frame = response_frame("0810|00|597029414300|7000017");
    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));

    assert!(matches!(
        term.load_keys(),
        Err(PosError::NoResponse {
            command: Command::LoadKeys,
            ..
        })
    ));
    // Never read, never acknowledged
    assert!(term.transport().control_writes().is_empty());
}

#[test]
fn test_get_totals() {
    let frame = response_frame("0710|00|0005|0001234500");
    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));

    let totals = term.get_totals().unwrap();
    assert_eq!(
        totals,
        TotalsResponse {
            function: 710,
            response_code: 0,
            tx_count: 5,
            tx_total: 1_234_500,
            status: Status::Ok,
        }
    );
}

#[test]
fn test_sale_returns_raw_frame() {
    let frame = sale_response();
    assert!(frame.len() > 65);

    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame.clone())));
    let raw = term.sale(12345, 1, true).unwrap();

    assert_eq!(raw.as_bytes(), frame.as_slice());
    assert_eq!(raw.fields().unwrap()[0], "0210");

    let sent = &term.transport().writes[0];
    assert_eq!(*sent, prepare_sale(12345, 1, true).unwrap().payload);
    assert_eq!(term.transport().control_writes(), vec![ACK]);
}

#[test]
fn test_sale_below_threshold_never_reads() {
    // 65 bytes waiting does not satisfy the sale policy
    let mut body = String::from("0210|00|");
    body.push_str(&"0".repeat(65 - 3 - body.len()));
    let frame = response_frame(&body);
    assert_eq!(frame.len(), 65);

    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));
    assert!(matches!(term.sale(100, 2, false), Err(PosError::NoResponse { .. })));
    assert!(term.transport().control_writes().is_empty());
}

#[test]
fn test_bad_lrc_is_nacked_and_retried() {
    let good = response_frame("0260|00|000001");
    let mut bad = good.clone();
    *bad.last_mut().unwrap() ^= 0xFF;

    let script = ScriptedTerminal::new().reply(ack_then(bad)).after_reply(good.clone());
    let mut term = terminal(script);

    let raw = term.last_sale().unwrap();
    assert_eq!(raw.as_bytes(), good.as_slice());
    assert_eq!(term.transport().control_writes(), vec![NAK, ACK]);
}

#[test]
fn test_repeated_bad_lrc_exhausts_retries() {
    let mut bad = response_frame("1210|00|000042");
    *bad.last_mut().unwrap() ^= 0xFF;

    let script = ScriptedTerminal::new()
        .reply(ack_then(bad.clone()))
        .after_reply(bad.clone())
        .after_reply(bad.clone());
    let mut term = terminal(script);

    let err = term.cancellation(42).unwrap_err();
    assert!(matches!(
        err,
        PosError::NoResponse {
            command: Command::Cancellation,
            attempts: 3
        }
    ));
    assert_eq!(term.transport().control_writes(), vec![NAK, NAK, NAK]);
    assert_eq!(term.transport().request_writes(), 1);
}

#[test]
fn test_undecodable_close_is_an_error() {
    let frame = response_frame("0501|00|0000000012");
    let mut term = terminal(ScriptedTerminal::new().reply(ack_then(frame)));

    assert!(matches!(term.close(), Err(PosError::Decode(_))));
}

#[test]
fn test_record_actual_response_size() {
    let frame = response_frame("0260|00|000001");
    let transport = ScriptedTerminal::new().reply(ack_then(frame.clone()));
    let mut engine = super::Engine::new(transport, EngineConfig::default());

    let exchange = engine.execute(message(Command::LastSale).unwrap()).unwrap();
    assert_eq!(exchange.message.response_size, frame.len());
    assert_eq!(exchange.send_attempts, 1);
    assert_eq!(exchange.response_attempts, 1);
    assert_eq!(engine.phase(), Phase::Success);

    // The catalog entry is untouched
    assert_eq!(message(Command::LastSale).unwrap().response_size, 146);
}

#[test]
fn test_declared_response_size_kept() {
    let frame = response_frame("0710|00|0005|0001234500");
    let transport = ScriptedTerminal::new().reply(ack_then(frame));
    let mut engine = super::Engine::new(transport, EngineConfig::default());

    let exchange = engine.execute(message(Command::GetTotals).unwrap()).unwrap();
    assert_eq!(exchange.message.response_size, 24);
}

#[test]
fn test_failed_exchange_sets_phase() {
    let mut engine = super::Engine::new(ScriptedTerminal::new(), EngineConfig::default());
    assert_eq!(engine.phase(), Phase::Idle);

    assert!(engine.execute(message(Command::Poll).unwrap()).is_err());
    assert_eq!(engine.phase(), Phase::Failed);
}

#[test]
fn test_invalid_sale_parameters_send_nothing() {
    let mut term = terminal(ScriptedTerminal::new());
    assert!(matches!(
        term.sale(1_000_000_000, 1, false),
        Err(PosError::InvalidParameter(_))
    ));
    assert!(term.transport().writes.is_empty());
}

#[test]
fn test_close_port_flushes() {
    let mut script = ScriptedTerminal::new();
    script.inbound.extend([1, 2, 3]);

    let term = PosTerminal::with_transport(&mut script, EngineConfig::default());
    term.close_port().unwrap();

    assert!(script.inbound.is_empty());
}

#[test]
fn test_bytes_after_frame_are_kept() {
    let frame = response_frame("0260|00|000001");
    let trailing = response_frame("0900|PROCESANDO");
    let mut delivery = ack_then(frame.clone());
    delivery.extend_from_slice(&trailing);

    let transport = ScriptedTerminal::new().reply(delivery);
    let mut engine = super::Engine::new(transport, EngineConfig::default());

    let exchange = engine.execute(message(Command::LastSale).unwrap()).unwrap();
    assert_eq!(exchange.frame, frame);
    assert_eq!(exchange.message.response_size, frame.len());
    assert_eq!(engine.pending(), trailing.as_slice());
    assert!(engine.transport().inbound.is_empty());

    engine.flush().unwrap();
    assert!(engine.pending().is_empty());
}

#[test]
fn test_kept_bytes_serve_the_next_exchange() {
    let first = response_frame("0260|00|000001");
    let second = response_frame("0260|00|000002");

    // Second ACK and response arrive early, glued to the first response
    let mut delivery = ack_then(first.clone());
    delivery.extend(ack_then(second.clone()));

    let mut term = terminal(ScriptedTerminal::new().reply(delivery));
    assert_eq!(term.last_sale().unwrap().as_bytes(), first.as_slice());
    assert_eq!(term.last_sale().unwrap().as_bytes(), second.as_slice());
    assert_eq!(term.transport().request_writes(), 2);
    assert_eq!(term.transport().control_writes(), vec![ACK, ACK]);
}

#[test]
fn test_empty_reads_consume_response_attempts() {
    let frame = response_frame("0260|00|000001");
    let mut script = ScriptedTerminal::new().reply(ack_then(frame));
    script.empty_reads = 3;
    let mut term = terminal(script);

    assert!(matches!(
        term.last_sale(),
        Err(PosError::NoResponse {
            command: Command::LastSale,
            attempts: 3
        })
    ));
    assert!(term.transport().control_writes().is_empty());
    assert_eq!(term.transport().request_writes(), 1);
}

#[test]
fn test_failed_reply_ack_consumes_attempt() {
    let frame = response_frame("0260|00|000001");
    let mut delivery = ack_then(frame.clone());
    delivery.extend_from_slice(&frame);

    let mut script = ScriptedTerminal::new().reply(delivery);
    script.fail_control_writes = 1;
    let mut engine = super::Engine::new(script, EngineConfig::default());

    let exchange = engine.execute(message(Command::LastSale).unwrap()).unwrap();
    assert_eq!(exchange.frame, frame);
    assert_eq!(exchange.response_attempts, 2);
    assert_eq!(engine.transport().control_writes(), vec![ACK]);
}

#[test]
fn test_failed_reply_acks_exhaust_retries() {
    let frame = response_frame("0260|00|000001");
    let mut delivery = ack_then(frame.clone());
    for _ in 0..2 {
        delivery.extend_from_slice(&frame);
    }

    let mut script = ScriptedTerminal::new().reply(delivery);
    script.fail_control_writes = 3;
    let mut term = terminal(script);

    assert!(matches!(
        term.last_sale(),
        Err(PosError::NoResponse { attempts: 3, .. })
    ));
    assert!(term.transport().control_writes().is_empty());
}

#[test]
fn test_send_and_response_attempts_counted_separately() {
    let mut bad = response_frame("1210|00|000042");
    *bad.last_mut().unwrap() ^= 0xFF;

    let script = ScriptedTerminal::new()
        .reply(vec![NAK])
        .reply(vec![NAK])
        .reply(ack_then(bad.clone()))
        .after_reply(bad.clone())
        .after_reply(bad.clone());
    let mut term = terminal(script);

    assert!(matches!(
        term.cancellation(42),
        Err(PosError::NoResponse {
            command: Command::Cancellation,
            attempts: 3
        })
    ));
    assert_eq!(term.transport().request_writes(), 3);
    assert_eq!(term.transport().control_writes(), vec![NAK, NAK, NAK]);
}
