//! Byte transport used by the handshake engine.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::Serialize;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, info};

use crate::error::Result;

/// Default serial read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Byte-level link to the terminal.
///
/// Reads that time out must fail with [`io::ErrorKind::TimedOut`].
pub trait Transport {
    /// Write the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of bytes waiting in the input buffer.
    fn bytes_waiting(&mut self) -> Result<usize>;

    /// Discard both input and output buffers.
    fn flush_buffers(&mut self) -> Result<()>;
}

/// Information about an available serial port.
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,
    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,
    /// USB product ID (if USB device)
    pub pid: Option<u16>,
    /// Product name (if available)
    pub product: Option<String>,
}

/// List serial ports visible to the OS, sorted by name.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortInfo {
                name: info.port_name,
                vid: None,
                pid: None,
                product: None,
            },
        })
        .collect();

    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// Serial port transport (8N1, no flow control).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open and configure a serial port, then discard anything buffered.
    pub fn open(name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        info!("Opening serial port {name} at {baud_rate} baud");

        let port = serialport::new(name, baud_rate).timeout(read_timeout).open()?;

        let mut transport = Self { port };
        transport.configure()?;
        transport.flush_buffers()?;
        Ok(transport)
    }

    /// Apply the terminal's line settings.
    pub fn configure(&mut self) -> Result<()> {
        self.port.set_data_bits(DataBits::Eight)?;
        self.port.set_parity(Parity::None)?;
        self.port.set_stop_bits(StopBits::One)?;
        self.port.set_flow_control(FlowControl::None)?;
        Ok(())
    }

    /// Name of the underlying port, if known.
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn flush_buffers(&mut self) -> Result<()> {
        debug!("Clearing serial buffers");
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        (**self).bytes_waiting()
    }

    fn flush_buffers(&mut self) -> Result<()> {
        (**self).flush_buffers()
    }
}
